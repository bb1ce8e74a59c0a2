//! Spindle database: pipelines, per-workflow status and repository secrets.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::orm::{format_datetime, parse_datetime};
use crate::types::{Pipeline, PipelineId, Status, WorkflowId, WorkflowStatus};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    knot TEXT NOT NULL,
    rkey TEXT NOT NULL,
    repo_owner TEXT NOT NULL,
    repo_name TEXT NOT NULL,
    sha TEXT NOT NULL DEFAULT '',
    trigger TEXT,
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
    PRIMARY KEY (knot, rkey)
);

CREATE TABLE IF NOT EXISTS workflow_statuses (
    knot TEXT NOT NULL,
    rkey TEXT NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    exit_code INTEGER NOT NULL DEFAULT 0,
    updated TEXT NOT NULL,
    PRIMARY KEY (knot, rkey, name),
    FOREIGN KEY (knot, rkey) REFERENCES pipelines(knot, rkey) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS secrets (
    repo TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (repo, key)
);
"#;

/// Capacity of the status broadcast; slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 256;

pub struct SpindleDb {
    conn: Mutex<Connection>,
    events: broadcast::Sender<WorkflowStatus>,
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<WorkflowStatus> {
    let status: String = row.get(3)?;
    Ok(WorkflowStatus {
        workflow_id: WorkflowId::new(
            PipelineId::new(&row.get::<_, String>(0)?, &row.get::<_, String>(1)?),
            &row.get::<_, String>(2)?,
        ),
        status: status.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        error: row.get(4)?,
        exit_code: row.get(5)?,
        updated: parse_datetime(&row.get::<_, String>(6)?),
    })
}

impl SpindleDb {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every status change, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowStatus> {
        self.events.subscribe()
    }

    /// Records the pipeline with each named workflow `pending`.
    pub fn add_pipeline(&self, pipeline: &Pipeline, workflows: &[String]) -> Result<()> {
        let trigger = pipeline
            .trigger
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = format_datetime(&Utc::now());

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO pipelines (knot, rkey, repo_owner, repo_name, sha, trigger, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pipeline.knot,
                pipeline.rkey,
                pipeline.repo_owner,
                pipeline.repo_name,
                pipeline.sha,
                trigger,
                format_datetime(&pipeline.created),
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
        for name in workflows {
            tx.execute(
                "INSERT INTO workflow_statuses (knot, rkey, name, status, updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![pipeline.knot, pipeline.rkey, name, Status::Pending.as_str(), now],
            )?;
        }
        tx.commit()?;

        info!(pipeline = %pipeline.id().at_uri(), workflows = workflows.len(), "pipeline recorded");
        Ok(())
    }

    pub fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        self.conn()
            .query_row(
                "SELECT knot, rkey, repo_owner, repo_name, sha, trigger, created
                 FROM pipelines WHERE knot = ?1 AND rkey = ?2",
                params![id.knot, id.rkey],
                |row| {
                    let trigger: Option<String> = row.get(5)?;
                    Ok(Pipeline {
                        knot: row.get(0)?,
                        rkey: row.get(1)?,
                        repo_owner: row.get(2)?,
                        repo_name: row.get(3)?,
                        sha: row.get(4)?,
                        trigger: trigger.and_then(|t| serde_json::from_str(&t).ok()),
                        created: parse_datetime(&row.get::<_, String>(6)?),
                    })
                },
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn get_status(&self, wid: &WorkflowId) -> Result<Option<WorkflowStatus>> {
        self.conn()
            .query_row(
                "SELECT knot, rkey, name, status, error, exit_code, updated
                 FROM workflow_statuses WHERE knot = ?1 AND rkey = ?2 AND name = ?3",
                params![wid.pipeline_id.knot, wid.pipeline_id.rkey, wid.name],
                status_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn statuses(&self, id: &PipelineId) -> Result<Vec<WorkflowStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT knot, rkey, name, status, error, exit_code, updated
             FROM workflow_statuses WHERE knot = ?1 AND rkey = ?2 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![id.knot, id.rkey], status_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Moves a workflow to `next`, rejecting anything the status machine
    /// forbids. The change is broadcast after it commits.
    fn set_status(
        &self,
        wid: &WorkflowId,
        next: Status,
        error: Option<&str>,
        exit_code: i64,
    ) -> Result<WorkflowStatus> {
        let updated = Utc::now();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT status FROM workflow_statuses WHERE knot = ?1 AND rkey = ?2 AND name = ?3",
                    params![wid.pipeline_id.knot, wid.pipeline_id.rkey, wid.name],
                    |row| row.get(0),
                )
                .optional()?;
            let current: Status = current.ok_or(Error::NotFound)?.parse()?;

            if !current.can_transition_to(next) {
                return Err(Error::InvalidState(format!(
                    "workflow {} cannot move from {current} to {next}",
                    wid.name
                )));
            }

            tx.execute(
                "UPDATE workflow_statuses SET status = ?4, error = ?5, exit_code = ?6, updated = ?7
                 WHERE knot = ?1 AND rkey = ?2 AND name = ?3",
                params![
                    wid.pipeline_id.knot,
                    wid.pipeline_id.rkey,
                    wid.name,
                    next.as_str(),
                    error,
                    exit_code,
                    format_datetime(&updated),
                ],
            )?;
            tx.commit()?;
        }

        debug!(wid = %wid, status = %next, "workflow status updated");
        let status = WorkflowStatus {
            workflow_id: wid.clone(),
            status: next,
            error: error.map(str::to_string),
            exit_code,
            updated,
        };
        // no receivers is fine
        let _ = self.events.send(status.clone());
        Ok(status)
    }

    pub fn status_running(&self, wid: &WorkflowId) -> Result<WorkflowStatus> {
        self.set_status(wid, Status::Running, None, 0)
    }

    pub fn status_success(&self, wid: &WorkflowId) -> Result<WorkflowStatus> {
        self.set_status(wid, Status::Success, None, 0)
    }

    pub fn status_timeout(&self, wid: &WorkflowId) -> Result<WorkflowStatus> {
        self.set_status(wid, Status::Timeout, Some("workflow timed out"), -1)
    }

    pub fn status_failed(&self, wid: &WorkflowId, error: &str, exit_code: i64) -> Result<WorkflowStatus> {
        self.set_status(wid, Status::Failed, Some(error), exit_code)
    }

    pub fn status_cancelled(
        &self,
        wid: &WorkflowId,
        reason: &str,
        exit_code: i64,
    ) -> Result<WorkflowStatus> {
        self.set_status(wid, Status::Cancelled, Some(reason), exit_code)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{new_db, pipeline};
    use super::*;

    #[test]
    fn test_pipeline_roundtrip_and_pending() {
        let (_temp, db) = new_db();
        let p = pipeline("3k1");
        db.add_pipeline(&p, &["build".to_string(), "lint".to_string()]).unwrap();

        let loaded = db.get_pipeline(&p.id()).unwrap().unwrap();
        assert_eq!(loaded.did_slash_repo(), "did:plc:alice/proj");
        assert!(db.get_pipeline(&PipelineId::new("knot.example.com", "nope")).unwrap().is_none());

        let statuses = db.statuses(&p.id()).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.status == Status::Pending));

        assert!(matches!(db.add_pipeline(&p, &[]), Err(Error::AlreadyExists)));
    }

    #[test]
    fn test_status_machine_enforced() {
        let (_temp, db) = new_db();
        let p = pipeline("3k2");
        db.add_pipeline(&p, &["build".to_string()]).unwrap();
        let wid = WorkflowId::new(p.id(), "build");

        assert!(matches!(db.status_success(&wid), Err(Error::InvalidState(_))));
        db.status_running(&wid).unwrap();
        db.status_failed(&wid, "exit 2", 2).unwrap();

        // terminal is absorbing
        assert!(matches!(
            db.status_cancelled(&wid, "User canceled the workflow", -1),
            Err(Error::InvalidState(_))
        ));
        let status = db.get_status(&wid).unwrap().unwrap();
        assert_eq!(status.status, Status::Failed);
        assert_eq!(status.error.as_deref(), Some("exit 2"));
        assert_eq!(status.exit_code, 2);

        let missing = WorkflowId::new(p.id(), "nope");
        assert!(matches!(db.status_running(&missing), Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let (_temp, db) = new_db();
        let p = pipeline("3k3");
        db.add_pipeline(&p, &["build".to_string()]).unwrap();
        let wid = WorkflowId::new(p.id(), "build");

        let mut rx = db.subscribe();
        db.status_running(&wid).unwrap();
        db.status_timeout(&wid).unwrap();

        assert_eq!(rx.recv().await.unwrap().status, Status::Running);
        assert_eq!(rx.recv().await.unwrap().status, Status::Timeout);
    }
}
