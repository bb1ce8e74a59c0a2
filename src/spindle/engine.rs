//! Runs a pipeline's workflows concurrently, each on its engine.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};

use super::db::SpindleDb;
use super::env::pipeline_env;
use super::logger::{FileLogger, NullLogger, StepStatus, WorkflowLogger};
use super::secrets::{SecretsManager, UnlockedSecret};
use super::workflow::Workflow;
use crate::types::{Pipeline, WorkflowId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("timed out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    #[error("step exited with status {0}")]
    Exit(i32),

    #[error("workflow failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Exit code recorded with a failed status.
    #[must_use]
    pub fn exit_code(&self) -> i64 {
        match self {
            Self::Exit(code) => i64::from(*code),
            _ => -1,
        }
    }
}

/// Everything a step sees besides its own command.
pub struct StepContext<'a> {
    pub env: &'a BTreeMap<String, String>,
    pub secrets: &'a [UnlockedSecret],
    pub logger: Arc<dyn WorkflowLogger>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn workflow_timeout(&self) -> Duration;

    async fn setup_workflow(&self, wid: &WorkflowId, workflow: &Workflow) -> Result<(), EngineError>;

    async fn run_step(
        &self,
        wid: &WorkflowId,
        workflow: &Workflow,
        idx: usize,
        ctx: StepContext<'_>,
    ) -> Result<(), EngineError>;

    /// Releases everything held for `wid` and stops any step still running.
    /// Must succeed for workflows the engine never saw.
    async fn destroy_workflow(&self, wid: &WorkflowId) -> Result<(), EngineError>;
}

/// The workflows of one pipeline, grouped by the engine that runs them.
pub struct PipelinePlan {
    pub pipeline: Pipeline,
    pub workflows: Vec<(Arc<dyn Engine>, Vec<Workflow>)>,
}

impl PipelinePlan {
    #[must_use]
    pub fn workflow_names(&self) -> Vec<String> {
        self.workflows
            .iter()
            .flat_map(|(_, wfs)| wfs.iter().map(|w| w.name.clone()))
            .collect()
    }
}

pub struct Runner {
    db: Arc<SpindleDb>,
    secrets: Arc<dyn SecretsManager>,
    log_dir: PathBuf,
    dev: bool,
}

impl Runner {
    pub fn new(
        db: Arc<SpindleDb>,
        secrets: Arc<dyn SecretsManager>,
        log_dir: PathBuf,
        dev: bool,
    ) -> Self {
        Self {
            db,
            secrets,
            log_dir,
            dev,
        }
    }

    /// Runs every workflow of the plan to a terminal status and returns
    /// once all of them have finished. The pipeline must already be recorded.
    pub async fn start_workflows(self: &Arc<Self>, plan: PipelinePlan) {
        let pipeline_id = plan.pipeline.id();
        info!(pipeline = %pipeline_id.at_uri(), "starting all workflows in parallel");

        let secrets = match self
            .secrets
            .get_secrets_unlocked(&plan.pipeline.did_slash_repo())
        {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!(error = %e, "failed to load secrets, continuing without");
                Vec::new()
            }
        };
        let secrets: Arc<[UnlockedSecret]> = secrets.into();

        let mut env = match &plan.pipeline.trigger {
            Some(trigger) => pipeline_env(trigger, &pipeline_id, self.dev),
            None => BTreeMap::new(),
        };
        env.entry("CI".to_string()).or_insert_with(|| "true".to_string());
        let env = Arc::new(env);

        let mut set = JoinSet::new();
        for (engine, workflows) in plan.workflows {
            info!(engine = engine.name(), timeout = ?engine.workflow_timeout(), "using workflow timeout");
            for workflow in workflows {
                let wid = WorkflowId::new(pipeline_id.clone(), &workflow.name);
                let span = info_span!("workflow", wid = %wid);
                let runner = Arc::clone(self);
                let engine = Arc::clone(&engine);
                let env = Arc::clone(&env);
                let secrets = Arc::clone(&secrets);
                set.spawn(
                    async move {
                        runner
                            .run_workflow(engine.as_ref(), &wid, &workflow, &env, &secrets)
                            .await;
                    }
                    .instrument(span),
                );
            }
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "workflow task panicked");
            }
        }
        info!(pipeline = %pipeline_id.at_uri(), "all workflows completed");
    }

    fn open_logger(&self, wid: &WorkflowId, secrets: &[UnlockedSecret]) -> Arc<dyn WorkflowLogger> {
        let values: Vec<String> = secrets.iter().map(|s| s.value.clone()).collect();
        match FileLogger::open(&self.log_dir, wid, &values) {
            Ok(logger) => {
                info!(log_dir = %self.log_dir.display(), "step logs will be persisted");
                Arc::new(logger)
            }
            Err(e) => {
                warn!(error = %e, "failed to set up step logger; logs will not be persisted");
                Arc::new(NullLogger)
            }
        }
    }

    async fn run_workflow(
        &self,
        engine: &dyn Engine,
        wid: &WorkflowId,
        workflow: &Workflow,
        pipeline_env: &BTreeMap<String, String>,
        secrets: &[UnlockedSecret],
    ) {
        let logger = self.open_logger(wid, secrets);

        if let Err(e) = self.db.status_running(wid) {
            error!(error = %e, "failed to set workflow status to running");
            return;
        }

        if let Err(e) = engine.setup_workflow(wid, workflow).await {
            error!(error = %e, "setting up workflow");
            if let Err(destroy) = engine.destroy_workflow(wid).await {
                error!(error = %destroy, "failed to destroy workflow after setup failure");
            }
            if let Err(db) = self.db.status_failed(wid, &e.to_string(), -1) {
                error!(error = %db, "failed to set workflow status to failed");
            }
            return;
        }

        let outcome = self
            .run_steps(engine, wid, workflow, pipeline_env, secrets, logger)
            .await;

        if let Err(e) = engine.destroy_workflow(wid).await {
            error!(error = %e, "failed to destroy workflow");
        }

        let recorded = match outcome {
            Ok(()) => self.db.status_success(wid),
            Err(EngineError::TimedOut) => self.db.status_timeout(wid),
            // whoever cancelled owns the final status
            Err(EngineError::Cancelled) => return,
            Err(e) => self.db.status_failed(wid, &e.to_string(), e.exit_code()),
        };
        if let Err(e) = recorded {
            error!(error = %e, "failed to record workflow outcome");
        }
    }

    async fn run_steps(
        &self,
        engine: &dyn Engine,
        wid: &WorkflowId,
        workflow: &Workflow,
        pipeline_env: &BTreeMap<String, String>,
        secrets: &[UnlockedSecret],
        logger: Arc<dyn WorkflowLogger>,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + engine.workflow_timeout();

        let mut env = pipeline_env.clone();
        env.extend(workflow.environment.clone());

        for (idx, step) in workflow.steps.iter().enumerate() {
            logger.control(idx, &step.name, StepStatus::Start);

            let ctx = StepContext {
                env: &env,
                secrets,
                logger: Arc::clone(&logger),
            };
            let result =
                match tokio::time::timeout_at(deadline, engine.run_step(wid, workflow, idx, ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::TimedOut),
                };

            logger.control(idx, &step.name, StepStatus::End);

            if let Err(e) = result {
                warn!(step = %step.name, error = %e, "step failed");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;

    use parking_lot::Mutex;

    use super::*;

    /// An engine whose steps are scripted by command: `ok`, `fail`, `sleep`
    /// (waits past any deadline) or `setup-fail` on the first step.
    pub struct ScriptedEngine {
        pub timeout: Duration,
        pub destroyed: Mutex<HashSet<String>>,
    }

    impl ScriptedEngine {
        pub fn new(timeout: Duration) -> Self {
            Self {
                timeout,
                destroyed: Mutex::new(HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn workflow_timeout(&self) -> Duration {
            self.timeout
        }

        async fn setup_workflow(&self, _wid: &WorkflowId, workflow: &Workflow) -> Result<(), EngineError> {
            if workflow.steps.first().is_some_and(|s| s.command == "setup-fail") {
                return Err(EngineError::Failed("no workspace".to_string()));
            }
            Ok(())
        }

        async fn run_step(
            &self,
            _wid: &WorkflowId,
            workflow: &Workflow,
            idx: usize,
            ctx: StepContext<'_>,
        ) -> Result<(), EngineError> {
            let step = &workflow.steps[idx];
            ctx.logger
                .data(idx, crate::spindle::logger::Stream::Stdout, &format!("running {}", step.name));
            match step.command.as_str() {
                "fail" => Err(EngineError::Exit(3)),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
                "cancelled" => Err(EngineError::Cancelled),
                _ => Ok(()),
            }
        }

        async fn destroy_workflow(&self, wid: &WorkflowId) -> Result<(), EngineError> {
            self.destroyed.lock().insert(wid.name.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::testing::ScriptedEngine;
    use super::*;
    use crate::spindle::db::testing::{new_db, pipeline};
    use crate::spindle::logger::{LogLine, read_log};
    use crate::spindle::secrets::SqliteSecrets;
    use crate::spindle::workflow::Step;
    use crate::types::Status;

    fn workflow(name: &str, commands: &[&str]) -> Workflow {
        Workflow {
            name: name.to_string(),
            engine: "scripted".to_string(),
            when: Vec::new(),
            environment: BTreeMap::new(),
            steps: commands
                .iter()
                .enumerate()
                .map(|(i, c)| Step {
                    name: format!("step{i}"),
                    command: c.to_string(),
                    environment: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_each_workflow_reaches_its_terminal_status() {
        let (_temp, db) = new_db();
        let logs = TempDir::new().unwrap();
        let db = Arc::new(db);
        let runner = Arc::new(Runner::new(
            db.clone(),
            Arc::new(SqliteSecrets::new(db.clone())),
            logs.path().to_path_buf(),
            false,
        ));
        let engine = Arc::new(ScriptedEngine::new(Duration::from_millis(200)));

        let p = pipeline("3kengine");
        let plan = PipelinePlan {
            pipeline: p.clone(),
            workflows: vec![(
                engine.clone() as Arc<dyn Engine>,
                vec![
                    workflow("ok", &["ok", "ok"]),
                    workflow("fails", &["ok", "fail", "ok"]),
                    workflow("slow", &["sleep"]),
                    workflow("broken", &["setup-fail"]),
                ],
            )],
        };
        db.add_pipeline(&p, &plan.workflow_names()).unwrap();
        runner.start_workflows(plan).await;

        let status = |name: &str| {
            db.get_status(&WorkflowId::new(p.id(), name))
                .unwrap()
                .unwrap()
        };
        assert_eq!(status("ok").status, Status::Success);
        let failed = status("fails");
        assert_eq!(failed.status, Status::Failed);
        assert_eq!(failed.exit_code, 3);
        assert_eq!(status("slow").status, Status::Timeout);
        assert_eq!(status("broken").status, Status::Failed);

        let destroyed = engine.destroyed.lock().clone();
        assert_eq!(destroyed.len(), 4);

        // the failing workflow stopped at its second step
        let lines = read_log(logs.path(), &WorkflowId::new(p.id(), "fails")).unwrap();
        let controls = lines
            .iter()
            .filter(|l| matches!(l, LogLine::Control { .. }))
            .count();
        assert_eq!(controls, 4);
    }

    #[tokio::test]
    async fn test_cancelled_step_leaves_status_to_canceller() {
        let (_temp, db) = new_db();
        let logs = TempDir::new().unwrap();
        let db = Arc::new(db);
        let runner = Arc::new(Runner::new(
            db.clone(),
            Arc::new(SqliteSecrets::new(db.clone())),
            logs.path().to_path_buf(),
            false,
        ));
        let engine = Arc::new(ScriptedEngine::new(Duration::from_secs(5)));

        let p = pipeline("3kcancel");
        let plan = PipelinePlan {
            pipeline: p.clone(),
            workflows: vec![(engine as Arc<dyn Engine>, vec![workflow("w", &["cancelled"])])],
        };
        db.add_pipeline(&p, &plan.workflow_names()).unwrap();
        runner.start_workflows(plan).await;

        let status = db.get_status(&WorkflowId::new(p.id(), "w")).unwrap().unwrap();
        assert_eq!(status.status, Status::Running);
    }
}
