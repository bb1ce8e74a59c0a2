use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::logger::{LogLine, read_log};
use super::workflow::Workflow;
use super::{SharedSpindleState, plan};
use crate::error::Error;
use crate::rbac::{SERVER_MEMBER, SERVER_OWNER, THIS_SERVER};
use crate::types::{AtUri, Pipeline, PipelineId, WorkflowId};
use crate::xrpc::{ActorDid, ErrorTag, XrpcError, log_request, nsid};

pub const CANCEL_REASON: &str = "User canceled the workflow";

#[derive(Debug, Deserialize)]
pub struct CancelPipelineInput {
    pub pipeline: String,
    pub workflow: String,
    /// The repo's AT-URI. Ownership is checked against the recorded pipeline.
    #[serde(default)]
    pub repo: String,
}

pub async fn cancel_pipeline(
    State(state): State<SharedSpindleState>,
    ActorDid(actor): ActorDid,
    Json(input): Json<CancelPipelineInput>,
) -> Result<StatusCode, XrpcError> {
    let uri: AtUri = input
        .pipeline
        .parse()
        .map_err(|_| XrpcError::invalid_request(format!("invalid pipeline: {}", input.pipeline)))?;
    let wid = WorkflowId::new(PipelineId::from_at_uri(&uri), &input.workflow);
    debug!(wid = %wid, repo = %input.repo, "cancel pipeline");

    let pipeline = state
        .db
        .get_pipeline(&wid.pipeline_id)
        .map_err(XrpcError::from)?
        .ok_or_else(|| {
            XrpcError::new(
                StatusCode::NOT_FOUND,
                ErrorTag::InvalidRequest,
                format!("unknown pipeline: {}", input.pipeline),
            )
        })?;

    let is_owner = state
        .enforcer
        .is_repo_owner(&actor, THIS_SERVER, &pipeline.did_slash_repo())
        .unwrap_or(false);
    if !is_owner {
        info!(actor, repo = %pipeline.did_slash_repo(), "cancel denied");
        return Err(XrpcError::access_control(format!(
            "{actor} is not the owner of {}",
            pipeline.did_slash_repo()
        )));
    }

    for engine in &state.engines {
        debug!(engine = engine.name(), wid = %wid, "destroying workflow");
        engine.destroy_workflow(&wid).await.map_err(|e| {
            error!(wid = %wid, error = %e, "failed to destroy workflow");
            XrpcError::internal(format!("failed to destroy workflow: {e}"))
        })?;
    }

    state
        .db
        .status_cancelled(&wid, CANCEL_REASON, -1)
        .map_err(|e| match e {
            Error::InvalidState(msg) => XrpcError::invalid_request(msg),
            Error::NotFound => XrpcError::invalid_request(format!("unknown workflow: {}", wid.name)),
            other => XrpcError::internal(format!("failed to record cancellation: {other}")),
        })?;

    info!(wid = %wid, actor, "workflow cancelled");
    Ok(StatusCode::OK)
}

/// A workflow definition as submitted: its file name and raw YAML.
#[derive(Debug, Deserialize)]
pub struct SubmittedWorkflow {
    pub name: String,
    pub raw: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitPipelineInput {
    pub pipeline: Pipeline,
    pub workflows: Vec<SubmittedWorkflow>,
}

#[derive(Debug, Serialize)]
pub struct SubmitPipelineOutput {
    pub pipeline: String,
    pub workflows: Vec<String>,
}

/// Records a pipeline emitted by a knot and starts its matching workflows
/// on this server's engines. Only the spindle's owner and members (the
/// knots it serves) may submit.
pub async fn submit_pipeline(
    State(state): State<SharedSpindleState>,
    ActorDid(actor): ActorDid,
    Json(input): Json<SubmitPipelineInput>,
) -> Result<Json<SubmitPipelineOutput>, XrpcError> {
    let roles = state.enforcer.roles_for(&actor, THIS_SERVER).map_err(|e| {
        error!(actor, error = %e, "failed to look up roles");
        XrpcError::internal("failed to look up roles")
    })?;
    if !roles.iter().any(|r| r == SERVER_OWNER || r == SERVER_MEMBER) {
        info!(actor, "submit denied");
        return Err(XrpcError::access_control(format!(
            "{actor} is not a member of this spindle"
        )));
    }

    let pipeline = input.pipeline;
    let repo = pipeline.did_slash_repo();
    let mut workflows = Vec::with_capacity(input.workflows.len());
    for submitted in &input.workflows {
        let workflow = Workflow::parse(&submitted.name, &submitted.raw).map_err(|e| {
            XrpcError::invalid_request(format!("invalid workflow {}: {e}", submitted.name))
        })?;
        workflows.push(workflow);
    }

    let plan = plan(pipeline.clone(), workflows, &state.engines);
    let names = plan.workflow_names();
    if names.is_empty() {
        return Err(XrpcError::invalid_request("no workflow matches the trigger"));
    }

    // the repo owner may cancel what runs here
    state
        .enforcer
        .add_repo(&pipeline.repo_owner, THIS_SERVER, &repo)
        .map_err(|e| XrpcError::invalid_request(format!("invalid repo {repo}: {e}")))?;

    state.db.add_pipeline(&pipeline, &names).map_err(|e| match e {
        Error::AlreadyExists => XrpcError::new(
            StatusCode::CONFLICT,
            ErrorTag::InvalidRequest,
            format!("pipeline already submitted: {}", pipeline.rkey),
        ),
        other => {
            error!(error = %other, "failed to record pipeline");
            XrpcError::internal("failed to record pipeline")
        }
    })?;

    let uri = pipeline.id().at_uri().to_string();
    info!(pipeline = %uri, workflows = ?names, actor, "pipeline accepted");
    let runner = std::sync::Arc::clone(&state.runner);
    tokio::spawn(async move {
        runner.start_workflows(plan).await;
    });

    Ok(Json(SubmitPipelineOutput {
        pipeline: uri,
        workflows: names,
    }))
}

pub async fn logs(
    State(state): State<SharedSpindleState>,
    Path((knot, rkey, name)): Path<(String, String, String)>,
) -> Result<Json<Vec<LogLine>>, XrpcError> {
    let wid = WorkflowId::new(PipelineId::new(&knot, &rkey), &name);
    match read_log(&state.config.log_dir, &wid) {
        Ok(lines) => Ok(Json(lines)),
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(XrpcError::new(
            StatusCode::NOT_FOUND,
            ErrorTag::InvalidRequest,
            "no logs for workflow",
        )),
        Err(e) => {
            error!(wid = %wid, error = %e, "failed to read logs");
            Err(XrpcError::internal("failed to read logs"))
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

pub fn create_router(state: SharedSpindleState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(&format!("/xrpc/{}", nsid::PIPELINE_SUBMIT), post(submit_pipeline))
        .route(&format!("/xrpc/{}", nsid::PIPELINE_CANCEL), post(cancel_pipeline))
        .route("/logs/{knot}/{rkey}/{name}", get(logs))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
