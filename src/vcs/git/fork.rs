use std::path::{Path, PathBuf};

use reqwest::Url;
use tracing::debug;

use super::cmd::run_git_checked;
use crate::vcs::{VcsError, detect_vcs, secure_join};
use crate::types::VcsKind;

/// Rewrites a clone URL on this knot's own hostname to a local `file://` path
/// so forks within one knot skip the network.
#[must_use]
pub fn local_clone_path(source: &Url, hostname: &str, scan_root: &Path) -> Option<PathBuf> {
    let host = match source.port() {
        Some(port) => format!("{}:{port}", source.host_str()?),
        None => source.host_str()?.to_string(),
    };
    if host != hostname {
        return None;
    }
    let local = secure_join(scan_root, source.path().trim_start_matches('/')).ok()?;
    (detect_vcs(&local) == Some(VcsKind::Git)).then_some(local)
}

/// Bare-clones `source` into `repo_path` and hides `refs/hidden` from pushes.
pub async fn fork(
    repo_path: &Path,
    source: &str,
    hostname: &str,
    scan_root: &Path,
) -> Result<(), VcsError> {
    let url = Url::parse(source)
        .map_err(|e| VcsError::Command(format!("failed to parse source URL: {e}")))?;

    let source = match local_clone_path(&url, hostname, scan_root) {
        Some(local) => {
            debug!(path = %local.display(), "performing local clone");
            format!("file://{}", local.display())
        }
        None => url.to_string(),
    };

    let parent = repo_path.parent().unwrap_or(repo_path);
    tokio::fs::create_dir_all(parent).await?;
    let target = repo_path.to_string_lossy();
    run_git_checked(parent, &["clone", "--bare", &source, target.as_ref()]).await?;
    run_git_checked(repo_path, &["config", "receive.hideRefs", "refs/hidden"]).await?;
    Ok(())
}

/// Fast-forwards (or force-updates) `branch` from the fork's origin.
pub async fn sync(repo_path: &Path, branch: &str) -> Result<(), VcsError> {
    let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
    run_git_checked(repo_path, &["fetch", "origin", &refspec])
        .await
        .map(|_| ())
        .map_err(|e| VcsError::Command(format!("failed to fetch origin branch: {branch}: {e}")))
}

/// Tracks `remote_ref` of origin under `refs/hidden/<fork_ref>/<remote_ref>`,
/// e.g. `+refs/heads/main:refs/hidden/feature-1/main`.
pub async fn track_hidden_remote_ref(
    repo_path: &Path,
    fork_ref: &str,
    remote_ref: &str,
) -> Result<(), VcsError> {
    let refspec = format!("+refs/heads/{remote_ref}:refs/hidden/{fork_ref}/{remote_ref}");
    run_git_checked(repo_path, &["fetch", "origin", &refspec])
        .await
        .map(|_| ())
        .map_err(|e| VcsError::Command(format!("failed to fetch hidden remote: {fork_ref}: {e}")))
}
