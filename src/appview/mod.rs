//! Appview-side logic: the index of repos, issues, pulls and discussions,
//! discussion workflows, notification fan-out and commit verification.

pub mod commitverify;
pub mod discussions;
pub mod knot_client;
pub mod notify;
pub mod store;

pub use discussions::{DiscussionError, Discussions};
pub use store::{SqliteStore, Store};
