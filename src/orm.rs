//! Dynamic SQL filter composition and named migrations.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
enum FilterArg {
    One(Value),
    Many(Vec<Value>),
}

/// A single `key <cmp> ?` condition. List arguments expand to `key in (?, ?, ...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub key: String,
    pub cmp: &'static str,
    arg: FilterArg,
}

impl Filter {
    fn new(key: &str, cmp: &'static str, arg: FilterArg) -> Self {
        Self {
            key: key.to_string(),
            cmp,
            arg,
        }
    }

    pub fn eq(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "=", FilterArg::One(arg.into()))
    }

    pub fn not_eq(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "<>", FilterArg::One(arg.into()))
    }

    pub fn gte(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, ">=", FilterArg::One(arg.into()))
    }

    pub fn lte(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "<=", FilterArg::One(arg.into()))
    }

    pub fn is(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "is", FilterArg::One(arg.into()))
    }

    pub fn is_not(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "is not", FilterArg::One(arg.into()))
    }

    pub fn is_in<V, I>(key: &str, args: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        let values = args.into_iter().map(Into::into).collect();
        Self::new(key, "in", FilterArg::Many(values))
    }

    pub fn like(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "like", FilterArg::One(arg.into()))
    }

    pub fn not_like(key: &str, arg: impl Into<Value>) -> Self {
        Self::new(key, "not like", FilterArg::One(arg.into()))
    }

    pub fn contains(key: &str, needle: &str) -> Self {
        Self::like(key, format!("%{needle}%"))
    }

    /// Renders the SQL fragment for this filter.
    #[must_use]
    pub fn condition(&self) -> String {
        match &self.arg {
            // `in ()` is a syntax error in sqlite; an empty list matches nothing
            FilterArg::Many(values) if values.is_empty() => "1 = 0".to_string(),
            FilterArg::Many(values) => {
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{} {} ({placeholders})", self.key, self.cmp)
            }
            FilterArg::One(_) => format!("{} {} ?", self.key, self.cmp),
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<Value> {
        match &self.arg {
            FilterArg::One(v) => vec![v.clone()],
            FilterArg::Many(values) => values.clone(),
        }
    }
}

/// Joins filters with `and`. Returns an empty clause when there are no filters.
#[must_use]
pub fn where_clause(filters: &[Filter]) -> (String, Vec<Value>) {
    if filters.is_empty() {
        return (String::new(), Vec::new());
    }

    let conditions: Vec<String> = filters.iter().map(Filter::condition).collect();
    let args = filters.iter().flat_map(Filter::args).collect();
    (format!(" where {}", conditions.join(" and ")), args)
}

pub const MIGRATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    applied_at TEXT DEFAULT (datetime('now'))
);
"#;

/// Runs `migration` once per database, recording it under `name`.
///
/// The migration and its bookkeeping row share one transaction, so a failing
/// migration leaves nothing behind.
pub fn run_migration<F>(conn: &mut Connection, name: &str, migration: F) -> Result<()>
where
    F: FnOnce(&Transaction<'_>) -> Result<()>,
{
    conn.execute_batch(MIGRATIONS_TABLE)?;

    let tx = conn.transaction()?;
    let exists = tx
        .query_row(
            "SELECT 1 FROM migrations WHERE name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if exists {
        tracing::debug!(migration = name, "skipped migration, already applied");
        return Ok(());
    }

    if let Err(e) = migration(&tx) {
        tracing::error!(migration = name, error = %e, "failed to run migration");
        return Err(e);
    }

    tx.execute("INSERT INTO migrations (name) VALUES (?1)", params![name])?;
    tx.commit()?;

    tracing::info!(migration = name, "migration applied successfully");
    Ok(())
}

/// Reads a stored timestamp: RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS`.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datetime_formats() {
        let rfc = parse_datetime("2024-03-01T10:00:00+02:00");
        assert_eq!(format_datetime(&rfc), "2024-03-01T08:00:00+00:00");
        let sqlite = parse_datetime("2024-03-01 08:00:00");
        assert_eq!(sqlite, rfc);
    }

    #[test]
    fn test_scalar_condition() {
        let f = Filter::eq("repo_at", "at://did:plc:a/sh.tangled.repo/1".to_string());
        assert_eq!(f.condition(), "repo_at = ?");
        assert_eq!(f.args().len(), 1);
    }

    #[test]
    fn test_in_expands_placeholders() {
        let f = Filter::is_in("user_did", ["a", "b", "c"].map(String::from));
        assert_eq!(f.condition(), "user_did in (?, ?, ?)");
        assert_eq!(
            f.args(),
            vec![
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::Text("c".into())
            ]
        );
    }

    #[test]
    fn test_empty_in_is_always_false() {
        let f = Filter::is_in::<String, _>("user_did", Vec::new());
        assert_eq!(f.condition(), "1 = 0");
        assert!(f.args().is_empty());
    }

    #[test]
    fn test_contains_wraps_wildcards() {
        let f = Filter::contains("title", "bug");
        assert_eq!(f.condition(), "title like ?");
        assert_eq!(f.args(), vec![Value::Text("%bug%".into())]);
    }

    #[test]
    fn test_where_clause_joins_with_and() {
        let (clause, args) = where_clause(&[Filter::eq("a", 1_i64), Filter::is_not("b", Value::Null)]);
        assert_eq!(clause, " where a = ? and b is not ?");
        assert_eq!(args.len(), 2);

        let (clause, args) = where_clause(&[]);
        assert!(clause.is_empty());
        assert!(args.is_empty());
    }

    #[test]
    fn test_filters_run_against_sqlite() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT, n INTEGER);
             INSERT INTO t VALUES ('a', 1), ('b', 2), ('c', 3);",
        )
        .unwrap();

        let (clause, args) = where_clause(&[Filter::is_in("name", ["a", "c"].map(String::from)), Filter::gte("n", 2_i64)]);
        let sql = format!("SELECT name FROM t{clause}");
        let mut stmt = conn.prepare(&sql).unwrap();
        let names: Vec<String> = stmt
            .query_map(rusqlite::params_from_iter(args), |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(names, vec!["c".to_string()]);
    }

    #[test]
    fn test_migration_runs_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE counter (n INTEGER); INSERT INTO counter VALUES (0);")
            .unwrap();

        for _ in 0..3 {
            run_migration(&mut conn, "bump", |tx| {
                tx.execute("UPDATE counter SET n = n + 1", [])?;
                Ok(())
            })
            .unwrap();
        }

        let n: i64 = conn.query_row("SELECT n FROM counter", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_failed_migration_is_not_recorded() {
        let mut conn = Connection::open_in_memory().unwrap();
        let result = run_migration(&mut conn, "broken", |tx| {
            tx.execute("INSERT INTO missing_table VALUES (1)", [])?;
            Ok(())
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT count(*) FROM migrations WHERE name = 'broken'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
