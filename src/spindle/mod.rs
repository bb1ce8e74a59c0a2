//! The spindle: runs CI workflows for pipelines emitted by knots.
//!
//! Workflows of a pipeline run concurrently; the steps of one workflow run
//! in order. Each workflow moves `pending → running → <terminal>` in the
//! spindle database, and step output lands in a JSON-lines log file per
//! workflow with repository secrets masked.

pub mod db;
pub mod engine;
pub mod env;
pub mod logger;
pub mod process;
pub mod secret_mask;
pub mod secrets;
pub mod workflow;
mod xrpc;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::SpindleConfig;
use crate::rbac::Enforcer;
use crate::types::Pipeline;

pub use db::SpindleDb;
pub use engine::{Engine, EngineError, PipelinePlan, Runner};
pub use workflow::Workflow;
pub use xrpc::{CANCEL_REASON, create_router};

pub struct SpindleState {
    pub config: SpindleConfig,
    pub db: Arc<SpindleDb>,
    pub enforcer: Arc<Enforcer>,
    pub engines: Vec<Arc<dyn Engine>>,
    /// Drives submitted pipelines on `engines`, so cancellation reaches
    /// the processes this server started.
    pub runner: Arc<Runner>,
}

pub type SharedSpindleState = Arc<SpindleState>;

/// Groups the workflows matching the pipeline's trigger by engine. Workflows
/// naming an engine this spindle does not run are skipped.
#[must_use]
pub fn plan(pipeline: Pipeline, workflows: Vec<Workflow>, engines: &[Arc<dyn Engine>]) -> PipelinePlan {
    let mut grouped: HashMap<&str, (Arc<dyn Engine>, Vec<Workflow>)> = HashMap::new();
    for workflow in workflows {
        if let Some(trigger) = &pipeline.trigger {
            if !workflow.matches(trigger) {
                continue;
            }
        }
        let Some(engine) = engines.iter().find(|e| e.name() == workflow.engine) else {
            warn!(workflow = %workflow.name, engine = %workflow.engine, "unknown engine, skipping workflow");
            continue;
        };
        grouped
            .entry(engine.name())
            .or_insert_with(|| (Arc::clone(engine), Vec::new()))
            .1
            .push(workflow);
    }

    let mut workflows: Vec<_> = grouped.into_values().collect();
    workflows.sort_by(|a, b| a.0.name().cmp(b.0.name()));
    PipelinePlan { pipeline, workflows }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::spindle::db::testing::pipeline;
    use crate::spindle::process::ProcessEngine;
    use crate::types::{PushTrigger, Trigger, TriggerKind};

    #[test]
    fn test_plan_filters_by_trigger_and_engine() {
        let engines: Vec<Arc<dyn Engine>> = vec![Arc::new(ProcessEngine::new(
            std::env::temp_dir(),
            Duration::from_secs(1),
        ))];
        let workflows = vec![
            Workflow::parse("main.yml", "when:\n  - event: [push]\n    branch: [main]\nsteps:\n  - name: a\n    command: 'true'\n").unwrap(),
            Workflow::parse("dev.yml", "when:\n  - branch: [dev]\nsteps:\n  - name: a\n    command: 'true'\n").unwrap(),
            Workflow::parse("nix.yml", "engine: nixery\nsteps:\n  - name: a\n    command: 'true'\n").unwrap(),
        ];

        let mut p = pipeline("3kplan");
        p.trigger = Some(Trigger {
            repo: None,
            kind: TriggerKind::Push(PushTrigger {
                git_ref: "refs/heads/main".to_string(),
                new_sha: "abc".to_string(),
                old_sha: String::new(),
            }),
        });

        let plan = plan(p, workflows, &engines);
        assert_eq!(plan.workflow_names(), vec!["main.yml"]);
    }
}
