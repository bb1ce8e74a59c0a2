//! Repository secrets, scoped to `<did>/<repo>`.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::params;
use serde::Serialize;

use super::db::SpindleDb;
use crate::error::{Error, Result};
use crate::orm::{format_datetime, parse_datetime};

static KEY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockedSecret {
    pub repo: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockedSecret {
    pub repo: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Keys become environment variable names, so they follow the same rules.
/// The `TANGLED_` prefix is reserved for pipeline variables.
pub fn validate_key(key: &str) -> Result<()> {
    if !KEY_RE.as_ref().is_some_and(|re| re.is_match(key)) {
        return Err(Error::BadRequest(format!("invalid secret key: {key}")));
    }
    if key.to_ascii_uppercase().starts_with("TANGLED_") {
        return Err(Error::BadRequest(format!("reserved secret key: {key}")));
    }
    Ok(())
}

pub trait SecretsManager: Send + Sync {
    fn add_secret(&self, secret: &UnlockedSecret) -> Result<()>;
    fn remove_secret(&self, repo: &str, key: &str) -> Result<()>;
    /// Metadata only.
    fn get_secrets_locked(&self, repo: &str) -> Result<Vec<LockedSecret>>;
    fn get_secrets_unlocked(&self, repo: &str) -> Result<Vec<UnlockedSecret>>;
}

pub struct SqliteSecrets {
    db: Arc<SpindleDb>,
}

impl SqliteSecrets {
    pub fn new(db: Arc<SpindleDb>) -> Self {
        Self { db }
    }
}

impl SecretsManager for SqliteSecrets {
    fn add_secret(&self, secret: &UnlockedSecret) -> Result<()> {
        validate_key(&secret.key)?;
        self.db
            .conn()
            .execute(
                "INSERT INTO secrets (repo, key, value, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    secret.repo,
                    secret.key,
                    secret.value,
                    secret.created_by,
                    format_datetime(&secret.created_at),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Error::AlreadyExists
                }
                e => Error::from(e),
            })?;
        Ok(())
    }

    fn remove_secret(&self, repo: &str, key: &str) -> Result<()> {
        let removed = self.db.conn().execute(
            "DELETE FROM secrets WHERE repo = ?1 AND key = ?2",
            params![repo, key],
        )?;
        if removed == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn get_secrets_locked(&self, repo: &str) -> Result<Vec<LockedSecret>> {
        Ok(self
            .get_secrets_unlocked(repo)?
            .into_iter()
            .map(|s| LockedSecret {
                repo: s.repo,
                key: s.key,
                created_at: s.created_at,
                created_by: s.created_by,
            })
            .collect())
    }

    fn get_secrets_unlocked(&self, repo: &str) -> Result<Vec<UnlockedSecret>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT repo, key, value, created_by, created_at FROM secrets
             WHERE repo = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![repo], |row| {
            Ok(UnlockedSecret {
                repo: row.get(0)?,
                key: row.get(1)?,
                value: row.get(2)?,
                created_by: row.get(3)?,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}
