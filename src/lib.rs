//! # Tangled
//!
//! Core services of a federated code-hosting platform, usable both as a
//! standalone binary and as a library.
//!
//! - [`knot`]: XRPC read API over git and pijul repositories, plus the
//!   internal authorization endpoint used by [`guard`].
//! - [`guard`]: SSH forced command that authorizes and execs VCS transports.
//! - [`spindle`]: CI workflow runner with per-workflow logs and secrets.
//! - [`appview`]: index store, discussions, notifications and commit
//!   signature verification.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! tangled = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tangled::config::KnotConfig;
//! use tangled::knot::{KnotState, create_router};
//! use tangled::rbac::Enforcer;
//!
//! let config = KnotConfig::default();
//! let enforcer = Arc::new(Enforcer::new(config.db_path()).unwrap());
//! let router = create_router(Arc::new(KnotState::new(config, enforcer)));
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): builds the `tangled` binary. Disable with `default-features = false`.

pub mod appview;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod knot;
pub mod orm;
pub mod rbac;
pub mod sets;
pub mod spindle;
pub mod types;
pub mod vcs;
pub mod xrpc;
