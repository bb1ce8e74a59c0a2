use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{error, info};

use super::SharedKnotState;
use crate::rbac::THIS_SERVER;
use crate::types::is_did;

/// Query sent by the SSH guard before it execs a VCS command.
#[derive(Debug, Default, Deserialize)]
pub struct GuardQuery {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default, rename = "gitCmd")]
    pub git_cmd: String,
}

/// Commands that write to the repository.
const WRITE_COMMANDS: &[&str] = &["git-receive-pack", "pijul-protocol"];

/// Normalises a repo path from an SSH command line into `did/name`.
///
/// Accepts `/did/name`, `did/name.git`, and quoted variants. The first
/// component must already be a DID; handles are resolved upstream.
pub fn qualify_repo(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|c| c == '\'' || c == '"');
    let trimmed = trimmed.trim_start_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let (owner, name) = trimmed.split_once('/')?;
    if !is_did(owner) || name.is_empty() || name.contains('/') || name == ".." || name == "." {
        return None;
    }
    Some(format!("{owner}/{name}"))
}

pub async fn guard(
    State(state): State<SharedKnotState>,
    Query(query): Query<GuardQuery>,
) -> Response {
    let Some(qualified) = qualify_repo(&query.repo) else {
        info!(repo = %query.repo, "guard: unqualified repo");
        return (StatusCode::BAD_REQUEST, format!("invalid repo: {}", query.repo)).into_response();
    };

    if WRITE_COMMANDS.contains(&query.git_cmd.as_str()) {
        match state
            .enforcer
            .is_push_allowed(&query.user, THIS_SERVER, &qualified)
        {
            Ok(true) => {}
            Ok(false) => {
                info!(user = %query.user, repo = %qualified, command = %query.git_cmd, "guard: push denied");
                return (StatusCode::FORBIDDEN, "access denied").into_response();
            }
            Err(e) => {
                error!(user = %query.user, repo = %qualified, error = %e, "guard: policy lookup failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
            }
        }
    }

    (StatusCode::OK, qualified).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify_repo() {
        assert_eq!(
            qualify_repo("/did:plc:alice/repo.git").as_deref(),
            Some("did:plc:alice/repo")
        );
        assert_eq!(
            qualify_repo("'did:plc:alice/repo'").as_deref(),
            Some("did:plc:alice/repo")
        );
        assert_eq!(qualify_repo("alice.tngl.sh/repo"), None);
        assert_eq!(qualify_repo("did:plc:alice"), None);
        assert_eq!(qualify_repo("did:plc:alice/../etc"), None);
        assert_eq!(qualify_repo("did:plc:alice/.."), None);
    }
}
