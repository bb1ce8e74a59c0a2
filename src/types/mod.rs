pub mod aturi;
pub mod commit;
pub mod discussion;
pub mod issue;
pub mod notification;
pub mod pipeline;
pub mod repo;

pub use aturi::{AtUri, is_did, tid};
pub use commit::{Commit, Signature};
pub use discussion::*;
pub use issue::*;
pub use notification::*;
pub use pipeline::*;
pub use repo::*;
