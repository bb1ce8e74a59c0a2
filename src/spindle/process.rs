//! The `process` engine: each step is `sh -c <command>` in a per-workflow
//! scratch directory on the spindle host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{Engine, EngineError, StepContext};
use super::logger::{Stream, WorkflowLogger};
use super::workflow::Workflow;
use crate::types::WorkflowId;

pub const ENGINE_NAME: &str = "process";

pub struct ProcessEngine {
    workspace_root: PathBuf,
    timeout: Duration,
    running: Mutex<HashMap<WorkflowId, CancellationToken>>,
}

impl ProcessEngine {
    pub fn new(workspace_root: PathBuf, timeout: Duration) -> Self {
        Self {
            workspace_root,
            timeout,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn workspace(&self, wid: &WorkflowId) -> PathBuf {
        self.workspace_root.join(wid.to_string())
    }

    fn token(&self, wid: &WorkflowId) -> Option<CancellationToken> {
        self.running.lock().get(wid).cloned()
    }
}

fn pump<R>(reader: R, idx: usize, stream: Stream, logger: Arc<dyn WorkflowLogger>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => logger.data(idx, stream, &line),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read step output");
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl Engine for ProcessEngine {
    fn name(&self) -> &str {
        ENGINE_NAME
    }

    fn workflow_timeout(&self) -> Duration {
        self.timeout
    }

    async fn setup_workflow(&self, wid: &WorkflowId, _workflow: &Workflow) -> Result<(), EngineError> {
        let workspace = self.workspace(wid);
        tokio::fs::create_dir_all(&workspace).await?;
        self.running
            .lock()
            .insert(wid.clone(), CancellationToken::new());
        debug!(workspace = %workspace.display(), "workspace ready");
        Ok(())
    }

    async fn run_step(
        &self,
        wid: &WorkflowId,
        workflow: &Workflow,
        idx: usize,
        ctx: StepContext<'_>,
    ) -> Result<(), EngineError> {
        let step = workflow
            .steps
            .get(idx)
            .ok_or_else(|| EngineError::Failed(format!("no step at index {idx}")))?;
        let token = self.token(wid).ok_or(EngineError::Cancelled)?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&step.command)
            .current_dir(self.workspace(wid))
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", self.workspace(wid))
            .envs(ctx.env)
            .envs(&step.environment)
            .envs(ctx.secrets.iter().map(|s| (&s.key, &s.value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, idx, Stream::Stdout, Arc::clone(&ctx.logger)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, idx, Stream::Stderr, Arc::clone(&ctx.logger)));
        }

        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            () = token.cancelled() => None,
        };
        let Some(status) = finished else {
            info!(step = %step.name, "step cancelled");
            child.kill().await?;
            return Err(EngineError::Cancelled);
        };

        for handle in pumps {
            if let Err(e) = handle.await {
                warn!(error = %e, "output reader failed");
            }
        }

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Exit(status.code().unwrap_or(-1)))
        }
    }

    async fn destroy_workflow(&self, wid: &WorkflowId) -> Result<(), EngineError> {
        if let Some(token) = self.running.lock().remove(wid) {
            token.cancel();
        }
        match tokio::fs::remove_dir_all(self.workspace(wid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;

    use super::*;
    use crate::spindle::logger::{FileLogger, LogLine, read_log};
    use crate::spindle::secrets::UnlockedSecret;
    use crate::spindle::workflow::Step;
    use crate::types::PipelineId;

    fn workflow(commands: &[&str]) -> Workflow {
        Workflow {
            name: "ci".to_string(),
            engine: ENGINE_NAME.to_string(),
            when: Vec::new(),
            environment: BTreeMap::new(),
            steps: commands
                .iter()
                .map(|c| Step {
                    name: c.to_string(),
                    command: c.to_string(),
                    environment: BTreeMap::from([("STEP_VAR".to_string(), "step".to_string())]),
                })
                .collect(),
        }
    }

    fn wid(name: &str) -> WorkflowId {
        WorkflowId::new(PipelineId::new("knot.example.com", "3kproc"), name)
    }

    #[tokio::test]
    async fn test_step_output_env_and_exit_code() {
        let root = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let engine = ProcessEngine::new(root.path().to_path_buf(), Duration::from_secs(30));
        let wid = wid("ci");
        let wf = workflow(&[
            "echo \"$TANGLED_REF_NAME $STEP_VAR $TOKEN\"; echo oops >&2",
            "exit 7",
        ]);

        let secrets = vec![UnlockedSecret {
            repo: "did:plc:alice/proj".to_string(),
            key: "TOKEN".to_string(),
            value: "hunter2".to_string(),
            created_at: chrono::Utc::now(),
            created_by: "did:plc:alice".to_string(),
        }];
        let logger: Arc<dyn WorkflowLogger> =
            Arc::new(FileLogger::open(logs.path(), &wid, &["hunter2".to_string()]).unwrap());
        let env = BTreeMap::from([("TANGLED_REF_NAME".to_string(), "main".to_string())]);

        engine.setup_workflow(&wid, &wf).await.unwrap();
        assert!(root.path().join(wid.to_string()).is_dir());

        let ctx = StepContext {
            env: &env,
            secrets: &secrets,
            logger: Arc::clone(&logger),
        };
        engine.run_step(&wid, &wf, 0, ctx).await.unwrap();
        let ctx = StepContext {
            env: &env,
            secrets: &secrets,
            logger: Arc::clone(&logger),
        };
        let err = engine.run_step(&wid, &wf, 1, ctx).await.unwrap_err();
        assert!(matches!(err, EngineError::Exit(7)));
        assert_eq!(err.exit_code(), 7);

        let lines = read_log(logs.path(), &wid).unwrap();
        let contents: Vec<(Stream, String)> = lines
            .into_iter()
            .filter_map(|l| match l {
                LogLine::Data { stream, content, .. } => Some((stream, content)),
                LogLine::Control { .. } => None,
            })
            .collect();
        assert!(contents.contains(&(Stream::Stdout, "main step ***".to_string())));
        assert!(contents.contains(&(Stream::Stderr, "oops".to_string())));

        engine.destroy_workflow(&wid).await.unwrap();
        assert!(!root.path().join(wid.to_string()).exists());
        // destroying twice is fine
        engine.destroy_workflow(&wid).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_cancels_running_step() {
        let root = TempDir::new().unwrap();
        let engine = Arc::new(ProcessEngine::new(root.path().to_path_buf(), Duration::from_secs(30)));
        let wid = wid("long");
        let wf = workflow(&["sleep 30"]);
        engine.setup_workflow(&wid, &wf).await.unwrap();

        let running = {
            let engine = Arc::clone(&engine);
            let wid = wid.clone();
            let wf = wf.clone();
            tokio::spawn(async move {
                let env = BTreeMap::new();
                let ctx = StepContext {
                    env: &env,
                    secrets: &[],
                    logger: Arc::new(crate::spindle::logger::NullLogger),
                };
                engine.run_step(&wid, &wf, 0, ctx).await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.destroy_workflow(&wid).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }
}
