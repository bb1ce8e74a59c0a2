//! Repository backends behind one capability trait.
//!
//! Every read endpoint goes through [`open`], which checks the directory for
//! the VCS in use and hands back a boxed [`VcsRepo`]. Call sites never branch
//! on the VCS kind themselves.

pub mod git;
pub mod path;
pub mod pijul;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::types::VcsKind;

pub use path::{clean_path, secure_join};

/// Upper bound on blob bytes returned inline.
pub const MAX_BLOB_SIZE: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("repository not found")]
    RepoNotFound,
    #[error("reference not found: {0}")]
    RefNotFound(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("change not found: {0}")]
    ChangeNotFound(String),
    #[error("channel not found: {0}")]
    ChannelNotFound(String),
    #[error("tag not found: {0}")]
    TagNotFound(String),
    #[error("binary file")]
    BinaryFile,
    #[error("{0} is not supported for this repository")]
    Unsupported(&'static str),
    #[error("{0}")]
    Command(String),
    #[error("{0}")]
    Internal(String),
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::Internal(err.to_string())
    }
}

impl From<git2::Error> for VcsError {
    fn from(err: git2::Error) -> Self {
        VcsError::Internal(err.message().to_string())
    }
}

/// Probes `path` for `.pijul/` first, then `.git/` or a bare `HEAD`.
#[must_use]
pub fn detect_vcs(path: &Path) -> Option<VcsKind> {
    if path.join(".pijul").is_dir() {
        return Some(VcsKind::Pijul);
    }
    if path.join(".git").is_dir() || path.join("HEAD").is_file() {
        return Some(VcsKind::Git);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastCommitInfo {
    pub hash: String,
    pub message: String,
    pub when: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    pub name: String,
    pub mode: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<LastCommitInfo>,
}

impl TreeEntry {
    pub fn is_file(&self) -> bool {
        self.mode.starts_with("100") || self.mode == "120000"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Blob {
    pub path: String,
    pub size: u64,
    pub is_binary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<git::refs::RefCommit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl Author {
    /// Parses `Name <email>`; anything without brackets is a bare name.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let (Some(start), Some(end)) = (s.find('<'), s.find('>')) {
            if end > start {
                return Self {
                    name: s[..start].trim().to_string(),
                    email: s[start + 1..end].trim().to_string(),
                };
            }
        }
        Self {
            name: s.to_string(),
            email: String::new(),
        }
    }
}

/// A unit of history: a pijul change or a git commit seen through the same lens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub hash: String,
    pub authors: Vec<Author>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangePage {
    pub changes: Vec<Change>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ApplyFailure {
    pub hash: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ApplyOutcome {
    pub applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<ApplyFailure>,
}

/// Gzipped tar stream produced by [`VcsRepo::archive`].
pub type ArchiveStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait VcsRepo: Send + Sync {
    fn kind(&self) -> VcsKind;

    fn path(&self) -> &Path;

    /// The resolved revision: a commit hash for git, a channel for pijul.
    fn revision(&self) -> &str;

    async fn tree(&self, path: &str) -> Result<Vec<TreeEntry>, VcsError>;

    async fn blob(&self, path: &str) -> Result<Blob, VcsError>;

    async fn branches(&self, offset: usize, limit: usize) -> Result<Vec<Branch>, VcsError>;

    async fn archive(&self, prefix: &str) -> Result<ArchiveStream, VcsError>;

    async fn change_log(&self, offset: usize, limit: usize) -> Result<ChangePage, VcsError>;

    async fn apply_changes(&self, hashes: &[String]) -> Result<ApplyOutcome, VcsError>;
}

/// Opens the repository at `path` at `reference` (a git ref or a pijul
/// channel). An empty reference means HEAD or the default channel.
pub async fn open(path: &Path, reference: &str) -> Result<Box<dyn VcsRepo>, VcsError> {
    match detect_vcs(path) {
        Some(VcsKind::Pijul) => {
            let repo = pijul::PijulRepo::open(path, reference).await?;
            Ok(Box::new(repo))
        }
        Some(VcsKind::Git) => {
            let repo = git::GitRepo::open(path, reference)?;
            Ok(Box::new(repo))
        }
        None => Err(VcsError::RepoNotFound),
    }
}

/// Case-insensitive README match: `README`, `readme.md`, `Readme.txt`, ...
#[must_use]
pub fn is_readme(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let stem = lower.split('.').next().unwrap_or_default();
    stem == "readme" && lower.matches('.').count() <= 1
}

/// NUL within the first `window` bytes marks a file as binary.
#[must_use]
pub fn looks_binary(content: &[u8], window: usize) -> bool {
    content[..content.len().min(window)].contains(&0)
}
