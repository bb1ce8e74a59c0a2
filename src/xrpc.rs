//! Shared XRPC plumbing for the knot and spindle services: the error body,
//! the trusted actor extractor, pagination and request logging.

use std::time::Instant;

use axum::{
    Json,
    extract::{FromRequestParts, Request},
    http::{StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::types::is_did;
use crate::vcs::VcsError;

/// Set by the gateway after it has verified the caller's service token.
pub const ACTOR_DID_HEADER: &str = "x-tangled-actor-did";

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 100;

pub mod nsid {
    pub const REPO_TREE: &str = "sh.tangled.repo.tree";
    pub const REPO_BLOB: &str = "sh.tangled.repo.blob";
    pub const REPO_BRANCHES: &str = "sh.tangled.repo.branches";
    pub const REPO_TAGS: &str = "sh.tangled.repo.tags";
    pub const REPO_TAG: &str = "sh.tangled.repo.tag";
    pub const REPO_ARCHIVE: &str = "sh.tangled.repo.archive";
    pub const REPO_CHANNEL_LIST: &str = "sh.tangled.repo.channelList";
    pub const REPO_GET_DEFAULT_CHANNEL: &str = "sh.tangled.repo.getDefaultChannel";
    pub const REPO_PIJUL_TREE: &str = "sh.tangled.repo.pijulTree";
    pub const REPO_PIJUL_BLOB: &str = "sh.tangled.repo.pijulBlob";
    pub const REPO_CHANGE_LIST: &str = "sh.tangled.repo.changeList";
    pub const REPO_CHANGE_GET: &str = "sh.tangled.repo.changeGet";
    pub const REPO_APPLY_CHANGES: &str = "sh.tangled.repo.applyChanges";
    pub const REPO_PERMISSIONS: &str = "sh.tangled.repo.permissions";
    pub const PIPELINE_CANCEL: &str = "sh.tangled.pipeline.cancelPipeline";
    pub const PIPELINE_SUBMIT: &str = "sh.tangled.pipeline.submitPipeline";
}

/// Error tags carried in the `error` field of every XRPC error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorTag {
    InvalidRequest,
    RepoNotFound,
    RefNotFound,
    PathNotFound,
    ChangeNotFound,
    ChannelNotFound,
    TagNotFound,
    InternalServerError,
    ApplyFailed,
    AccessControl,
    MissingActorDid,
}

/// `{error: <tag>, message}` with an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrpcError {
    pub status: StatusCode,
    pub tag: ErrorTag,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorTag,
    pub message: String,
}

impl XrpcError {
    #[must_use]
    pub fn new(status: StatusCode, tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            status,
            tag,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorTag::InvalidRequest, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorTag::InternalServerError,
            message,
        )
    }

    #[must_use]
    pub fn repo_not_found(status: StatusCode) -> Self {
        Self::new(status, ErrorTag::RepoNotFound, "repository not found")
    }

    #[must_use]
    pub fn ref_not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorTag::RefNotFound, "reference not found")
    }

    #[must_use]
    pub fn access_control(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorTag::AccessControl, message)
    }

    #[must_use]
    pub fn missing_actor() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorTag::MissingActorDid,
            "actor DID not supplied",
        )
    }
}

impl IntoResponse for XrpcError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.tag,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<VcsError> for XrpcError {
    fn from(err: VcsError) -> Self {
        let message = err.to_string();
        match err {
            VcsError::RepoNotFound => Self::repo_not_found(StatusCode::NOT_FOUND),
            VcsError::RefNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorTag::RefNotFound, message)
            }
            VcsError::PathNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorTag::PathNotFound, message)
            }
            VcsError::ChangeNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorTag::ChangeNotFound, message)
            }
            VcsError::ChannelNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorTag::ChannelNotFound, message)
            }
            VcsError::TagNotFound(_) => {
                Self::new(StatusCode::BAD_REQUEST, ErrorTag::TagNotFound, message)
            }
            VcsError::BinaryFile | VcsError::Unsupported(_) => Self::invalid_request(message),
            VcsError::Command(_) | VcsError::Internal(_) => Self::internal(message),
        }
    }
}

impl From<crate::error::Error> for XrpcError {
    fn from(err: crate::error::Error) -> Self {
        use crate::error::Error;
        match err {
            Error::BadRequest(msg) => Self::invalid_request(msg),
            Error::Forbidden => Self::access_control("access denied"),
            Error::NotFound => Self::repo_not_found(StatusCode::NOT_FOUND),
            other => Self::internal(other.to_string()),
        }
    }
}

/// The DID the gateway vouched for. Rejects with `MissingActorDid` when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorDid(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ActorDid {
    type Rejection = XrpcError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_DID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|did| is_did(did))
            .map(|did| ActorDid(did.to_string()))
            .ok_or_else(XrpcError::missing_actor)
    }
}

/// `limit` 1..=100 (anything else means the default) and `cursor` as an offset.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<String>,
    pub cursor: Option<String>,
}

impl PageParams {
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|l| (1..=MAX_LIMIT).contains(l))
            .unwrap_or(DEFAULT_LIMIT)
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.cursor
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
    }
}

pub async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        response.status().as_u16(),
        start.elapsed().as_millis()
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_params_bounds() {
        let page = |limit: &str, cursor: &str| PageParams {
            limit: Some(limit.to_string()),
            cursor: Some(cursor.to_string()),
        };
        assert_eq!(page("10", "20").limit(), 10);
        assert_eq!(page("10", "20").offset(), 20);
        assert_eq!(page("0", "x").limit(), DEFAULT_LIMIT);
        assert_eq!(page("101", "-1").limit(), DEFAULT_LIMIT);
        assert_eq!(page("101", "-1").offset(), 0);
        assert_eq!(PageParams::default().limit(), DEFAULT_LIMIT);
    }

    #[test]
    fn test_vcs_error_mapping() {
        let err = XrpcError::from(VcsError::ChannelNotFound("dev".into()));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.tag, ErrorTag::ChannelNotFound);

        let err = XrpcError::from(VcsError::Command("boom".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.tag, ErrorTag::InternalServerError);
    }

    #[test]
    fn test_error_body_shape() {
        let body = serde_json::to_value(ErrorBody {
            error: ErrorTag::MissingActorDid,
            message: "m".into(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"error": "MissingActorDid", "message": "m"}));
    }
}
