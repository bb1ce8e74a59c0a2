use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{Method, StatusCode},
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::SharedKnotState;
use super::repo::{BlobOutput, TreeOutput, list_tree, pick_channel, read_blob};
use crate::vcs::pijul::{Channel, PijulRepo, channel};
use crate::vcs::{ApplyOutcome, Change, VcsRepo};
use crate::xrpc::{ErrorTag, PageParams, XrpcError};

fn open_failed(repo: &str, err: impl std::fmt::Display) -> XrpcError {
    error!(repo, error = %err, "failed to open pijul repository");
    XrpcError::new(
        StatusCode::NOT_FOUND,
        ErrorTag::RepoNotFound,
        "failed to open pijul repository",
    )
}

async fn open(state: &SharedKnotState, repo: &str, channel: &str) -> Result<PijulRepo, XrpcError> {
    let path = state.repo_path(repo)?;
    PijulRepo::open(&path, channel).await.map_err(|e| match e {
        crate::vcs::VcsError::ChannelNotFound(_) => XrpcError::from(e),
        other => open_failed(repo, other),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct RepoParams {
    #[serde(default)]
    pub repo: String,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Serialize)]
pub struct ChannelListOutput {
    pub channels: Vec<Channel>,
}

pub async fn channel_list(
    State(state): State<SharedKnotState>,
    Query(params): Query<RepoParams>,
) -> Result<Json<ChannelListOutput>, XrpcError> {
    let repo = open(&state, &params.repo, "").await?;
    let channels = repo.channels().await.map_err(|e| {
        error!(repo = %params.repo, error = %e, "failed to list channels");
        XrpcError::internal("failed to list channels")
    })?;
    Ok(Json(ChannelListOutput {
        channels: channel::paginate(channels, params.page.offset(), params.page.limit()),
    }))
}

#[derive(Debug, Serialize)]
pub struct DefaultChannelOutput {
    pub channel: String,
}

pub async fn get_default_channel(
    State(state): State<SharedKnotState>,
    Query(params): Query<RepoParams>,
) -> Result<Json<DefaultChannelOutput>, XrpcError> {
    let repo = open(&state, &params.repo, "").await?;
    let channel = repo.default_channel().await.map_err(|e| {
        error!(repo = %params.repo, error = %e, "failed to read channels");
        XrpcError::internal("failed to get default channel")
    })?;
    Ok(Json(DefaultChannelOutput { channel }))
}

#[derive(Debug, Default, Deserialize)]
pub struct PathParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub path: String,
}

pub async fn pijul_tree(
    State(state): State<SharedKnotState>,
    Query(params): Query<PathParams>,
) -> Result<Json<TreeOutput>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    let channel = pick_channel(&path, &params.channel, "").await;
    let repo = open(&state, &params.repo, &channel).await?;
    let mut output = list_tree(&repo, &params.path).await?;
    output.reference = channel;
    Ok(Json(output))
}

pub async fn pijul_blob(
    State(state): State<SharedKnotState>,
    Query(params): Query<PathParams>,
) -> Result<Json<BlobOutput>, XrpcError> {
    if params.path.is_empty() {
        return Err(XrpcError::invalid_request("missing path parameter"));
    }
    let path = state.repo_path(&params.repo)?;
    let channel = pick_channel(&path, &params.channel, "").await;
    let repo = open(&state, &params.repo, &channel).await?;
    Ok(Json(read_blob(&repo, channel, &params.path).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeListParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub channel: String,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Serialize)]
pub struct ChangeListOutput {
    pub changes: Vec<Change>,
    pub channel: String,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

pub async fn change_list(
    State(state): State<SharedKnotState>,
    Query(params): Query<ChangeListParams>,
) -> Result<Json<ChangeListOutput>, XrpcError> {
    let repo = open(&state, &params.repo, &params.channel).await?;
    let (offset, limit) = (params.page.offset(), params.page.limit());

    let page = repo.change_log(offset, limit).await.map_err(|e| {
        error!(repo = %params.repo, error = %e, "failed to list changes");
        XrpcError::internal("failed to list changes")
    })?;

    let channel = if params.channel.is_empty() {
        repo.current_channel().await.unwrap_or_else(|_| "main".to_string())
    } else {
        params.channel
    };

    Ok(Json(ChangeListOutput {
        changes: page.changes,
        channel,
        page: offset / limit + 1,
        per_page: limit,
        total: page.total,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangeGetParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Serialize)]
pub struct ChangeGetOutput {
    #[serde(flatten)]
    pub change: Change,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

pub async fn change_get(
    State(state): State<SharedKnotState>,
    Query(params): Query<ChangeGetParams>,
) -> Result<Json<ChangeGetOutput>, XrpcError> {
    if params.hash.is_empty() {
        return Err(XrpcError::invalid_request("missing hash parameter"));
    }
    let repo = open(&state, &params.repo, "").await?;
    let change = repo.get_change(&params.hash).await?;
    let diff = repo.diff_change(&params.hash).await.ok();
    Ok(Json(ChangeGetOutput { change, diff }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ApplyChangesInput {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

/// Routed for every method so that non-POST requests get an XRPC error body.
pub async fn apply_changes(
    State(state): State<SharedKnotState>,
    method: Method,
    body: Bytes,
) -> Result<Json<ApplyOutcome>, XrpcError> {
    if method != Method::POST {
        return Err(XrpcError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorTag::InvalidRequest,
            "method not allowed",
        ));
    }
    let input: ApplyChangesInput = serde_json::from_slice(&body)
        .map_err(|_| XrpcError::invalid_request("invalid request body"))?;
    if input.repo.is_empty() || input.channel.is_empty() || input.changes.is_empty() {
        return Err(XrpcError::invalid_request(
            "repo, channel, and changes are required",
        ));
    }

    let repo = open(&state, &input.repo, "").await?;
    if !repo.channel_exists(&input.channel).await.unwrap_or(false) {
        return Err(XrpcError::new(
            StatusCode::NOT_FOUND,
            ErrorTag::ChannelNotFound,
            "target channel not found",
        ));
    }
    let repo = open(&state, &input.repo, &input.channel).await?;

    let outcome = repo.apply_changes(&input.changes).await?;
    for hash in &outcome.applied {
        info!(repo = %input.repo, channel = %input.channel, hash = %hash, "applied change");
    }
    for failure in &outcome.failed {
        error!(repo = %input.repo, channel = %input.channel, hash = %failure.hash, error = %failure.error, "failed to apply change");
    }

    if outcome.applied.is_empty() && !outcome.failed.is_empty() {
        return Err(XrpcError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorTag::ApplyFailed,
            "all changes failed to apply",
        ));
    }
    Ok(Json(outcome))
}
