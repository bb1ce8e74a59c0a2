//! Outbound XRPC calls from the appview to a repository's knot.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::vcs::{ApplyOutcome, Author};
use crate::xrpc::{ErrorBody, ErrorTag, nsid};

#[derive(Debug, thiserror::Error)]
pub enum KnotClientError {
    #[error("knot request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{tag:?}: {message}")]
    Xrpc {
        status: u16,
        tag: ErrorTag,
        message: String,
    },

    #[error("knot responded {0} without an error body")]
    Status(u16),
}

/// `sh.tangled.repo.changeGet` output as the appview reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChangeDetail {
    pub hash: String,
    #[serde(default)]
    pub authors: Vec<Author>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub diff: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApplyChangesInput<'a> {
    repo: &'a str,
    channel: &'a str,
    changes: &'a [String],
}

/// The knot operations discussions depend on. `repo` is `<did>/<name>`.
#[async_trait]
pub trait KnotClient: Send + Sync {
    async fn change_get(
        &self,
        knot: &str,
        repo: &str,
        hash: &str,
    ) -> Result<ChangeDetail, KnotClientError>;

    async fn apply_changes(
        &self,
        knot: &str,
        repo: &str,
        channel: &str,
        changes: &[String],
    ) -> Result<ApplyOutcome, KnotClientError>;
}

#[derive(Clone)]
pub struct XrpcKnotClient {
    client: reqwest::Client,
    use_tls: bool,
}

impl XrpcKnotClient {
    pub fn new(use_tls: bool) -> Result<Self, KnotClientError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, use_tls })
    }

    fn url(&self, knot: &str, method: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{scheme}://{knot}/xrpc/{method}")
    }

    async fn handle_response<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, KnotClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }

        match resp.json::<ErrorBody>().await {
            Ok(body) => Err(KnotClientError::Xrpc {
                status: status.as_u16(),
                tag: body.error,
                message: body.message,
            }),
            Err(_) => Err(KnotClientError::Status(status.as_u16())),
        }
    }
}

#[async_trait]
impl KnotClient for XrpcKnotClient {
    async fn change_get(
        &self,
        knot: &str,
        repo: &str,
        hash: &str,
    ) -> Result<ChangeDetail, KnotClientError> {
        let resp = self
            .client
            .get(self.url(knot, nsid::REPO_CHANGE_GET))
            .query(&[("repo", repo), ("hash", hash)])
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    async fn apply_changes(
        &self,
        knot: &str,
        repo: &str,
        channel: &str,
        changes: &[String],
    ) -> Result<ApplyOutcome, KnotClientError> {
        let resp = self
            .client
            .post(self.url(knot, nsid::REPO_APPLY_CHANGES))
            .json(&ApplyChangesInput {
                repo,
                channel,
                changes,
            })
            .send()
            .await?;
        Self::handle_response(resp).await
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_change_get_parses_dependencies() {
        let router = Router::new().route(
            "/xrpc/sh.tangled.repo.changeGet",
            get(|| async {
                Json(json!({
                    "hash": "AAAA",
                    "authors": [{"name": "alice"}],
                    "message": "fix",
                    "dependencies": ["BBBB"],
                    "diff": "+x"
                }))
            }),
        );
        let knot = spawn(router).await;

        let client = XrpcKnotClient::new(false).unwrap();
        let change = client.change_get(&knot, "did:plc:a/r", "AAAA").await.unwrap();
        assert_eq!(change.dependencies, vec!["BBBB"]);
        assert_eq!(change.authors[0].name, "alice");
    }

    #[tokio::test]
    async fn test_error_body_becomes_tagged_error() {
        let router = Router::new().route(
            "/xrpc/sh.tangled.repo.changeGet",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": "ChangeNotFound", "message": "change not found"})),
                )
            }),
        );
        let knot = spawn(router).await;

        let client = XrpcKnotClient::new(false).unwrap();
        let err = client.change_get(&knot, "did:plc:a/r", "AAAA").await.unwrap_err();
        assert!(matches!(
            err,
            KnotClientError::Xrpc {
                status: 404,
                tag: ErrorTag::ChangeNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_apply_changes_posts_input() {
        let router = Router::new().route(
            "/xrpc/sh.tangled.repo.applyChanges",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["channel"], "main");
                Json(json!({
                    "applied": body["changes"],
                }))
            }),
        );
        let knot = spawn(router).await;

        let client = XrpcKnotClient::new(false).unwrap();
        let outcome = client
            .apply_changes(&knot, "did:plc:a/r", "main", &["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome.applied, vec!["A", "B"]);
        assert!(outcome.failed.is_empty());
    }
}
