//! The knot: an XRPC service over the repositories under `scan_root`, plus a
//! loopback-only API the SSH guard asks for authorization.

mod guard;
mod pijul;
mod repo;
mod router;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::KnotConfig;
use crate::error::Result;
use crate::rbac::{Enforcer, THIS_SERVER};
use crate::types::is_did;
use crate::vcs::secure_join;
use crate::xrpc::XrpcError;

pub use guard::{GuardQuery, qualify_repo};
pub use router::{create_internal_router, create_router};

pub struct KnotState {
    pub config: KnotConfig,
    pub enforcer: Arc<Enforcer>,
}

impl KnotState {
    #[must_use]
    pub fn new(config: KnotConfig, enforcer: Arc<Enforcer>) -> Self {
        Self { config, enforcer }
    }

    /// Joins the `repo` parameter (`<did>/<name>`) onto the scan root.
    pub fn repo_path(&self, repo: &str) -> std::result::Result<PathBuf, XrpcError> {
        if repo.trim().is_empty() {
            return Err(XrpcError::invalid_request("missing repo parameter"));
        }
        secure_join(&self.config.scan_root, repo)
            .map_err(|_| XrpcError::invalid_request(format!("invalid repo: {repo}")))
    }
}

pub type SharedKnotState = Arc<KnotState>;

/// Grants each `<did>/<name>` directory under the scan root to its DID.
/// Directories whose first component is not a DID are ignored.
pub fn register_repos(config: &KnotConfig, enforcer: &Enforcer) -> Result<usize> {
    let mut registered = 0;
    if !config.scan_root.is_dir() {
        return Ok(registered);
    }
    for owner in std::fs::read_dir(&config.scan_root)? {
        let owner = owner?;
        let Some(did) = owner.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_did(&did) || !owner.file_type()?.is_dir() {
            continue;
        }
        for repo in std::fs::read_dir(owner.path())? {
            let repo = repo?;
            if !repo.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = repo.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let did_slash_repo = format!("{did}/{name}");
            enforcer.add_repo(&did, THIS_SERVER, &did_slash_repo)?;
            debug!(repo = %did_slash_repo, "registered repository");
            registered += 1;
        }
    }
    info!(count = registered, "registered repositories");
    Ok(registered)
}
