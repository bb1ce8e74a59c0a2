use axum::middleware;
use axum::{
    Router,
    routing::{any, get},
};

use super::SharedKnotState;
use super::{guard, pijul, repo};
use crate::xrpc::{log_request, nsid};

async fn health() -> &'static str {
    "OK"
}

fn xrpc(nsid: &str) -> String {
    format!("/xrpc/{nsid}")
}

/// The public XRPC surface.
pub fn create_router(state: SharedKnotState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(&xrpc(nsid::REPO_TREE), get(repo::tree))
        .route(&xrpc(nsid::REPO_BLOB), get(repo::blob))
        .route(&xrpc(nsid::REPO_BRANCHES), get(repo::branches))
        .route(&xrpc(nsid::REPO_TAGS), get(repo::tags))
        .route(&xrpc(nsid::REPO_TAG), get(repo::tag))
        .route(&xrpc(nsid::REPO_ARCHIVE), get(repo::archive))
        .route(&xrpc(nsid::REPO_PERMISSIONS), get(repo::permissions))
        .route(&xrpc(nsid::REPO_CHANNEL_LIST), get(pijul::channel_list))
        .route(
            &xrpc(nsid::REPO_GET_DEFAULT_CHANNEL),
            get(pijul::get_default_channel),
        )
        .route(&xrpc(nsid::REPO_PIJUL_TREE), get(pijul::pijul_tree))
        .route(&xrpc(nsid::REPO_PIJUL_BLOB), get(pijul::pijul_blob))
        .route(&xrpc(nsid::REPO_CHANGE_LIST), get(pijul::change_list))
        .route(&xrpc(nsid::REPO_CHANGE_GET), get(pijul::change_get))
        .route(&xrpc(nsid::REPO_APPLY_CHANGES), any(pijul::apply_changes))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Loopback-only API consulted by the SSH guard.
pub fn create_internal_router(state: SharedKnotState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/guard", get(guard::guard))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
