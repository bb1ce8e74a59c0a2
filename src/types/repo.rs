use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aturi::AtUri;
use crate::error::Error;

pub const REPO_NSID: &str = "sh.tangled.repo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    #[default]
    Git,
    Pijul,
}

impl VcsKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Pijul => "pijul",
        }
    }
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VcsKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            "pijul" => Ok(Self::Pijul),
            other => Err(Error::BadRequest(format!("unknown vcs: {other}"))),
        }
    }
}

/// Appview projection of a repository record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: i64,
    pub did: String,
    pub name: String,
    pub rkey: String,
    pub knot: String,
    pub vcs: VcsKind,
    pub default_branch: Option<String>,
    pub description: Option<String>,
    pub topics: Vec<String>,
    pub created: DateTime<Utc>,
}

impl Repo {
    #[must_use]
    pub fn repo_at(&self) -> AtUri {
        AtUri::new(&self.did, REPO_NSID, &self.rkey)
    }

    /// The RBAC object and on-disk relative path: `<did>/<name>`.
    #[must_use]
    pub fn did_slash_repo(&self) -> String {
        format!("{}/{}", self.did, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub subject_did: String,
    pub repo_at: AtUri,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Star {
    pub did: String,
    pub repo_at: AtUri,
    pub rkey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    pub user_did: String,
    pub subject_did: String,
    pub rkey: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    pub did: String,
    pub name: String,
    /// Authorized-keys formatted key, e.g. `ssh-ed25519 AAAA... comment`.
    pub key: String,
    pub created: DateTime<Utc>,
}
