//! Pijul backend. Everything goes through the `pijul` CLI except working-copy
//! reads, which touch the filesystem directly.

pub mod change;
pub mod channel;
pub mod cmd;
pub mod tree;

use std::path::{Path, PathBuf};

use async_compression::tokio::bufread::GzipEncoder;
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

use super::{
    ApplyFailure, ApplyOutcome, ArchiveStream, Author, Blob, Branch, Change, ChangePage,
    TreeEntry, VcsError, VcsRepo,
};
use crate::types::VcsKind;

pub use channel::Channel;
pub use cmd::{clone, init_repo};

const ARCHIVE_PIPE_SIZE: usize = 64 * 1024;

/// A pijul repository, optionally pinned to a channel. An empty channel
/// means whatever pijul treats as current.
#[derive(Debug, Clone)]
pub struct PijulRepo {
    path: PathBuf,
    channel: String,
}

impl PijulRepo {
    /// Opens `path`, verifying that `channel` exists when one is given.
    pub async fn open(path: &Path, channel: &str) -> Result<Self, VcsError> {
        let repo = Self::plain_open(path)?;
        if channel.is_empty() {
            return Ok(repo);
        }
        if !repo.channel_exists(channel).await? {
            return Err(VcsError::ChannelNotFound(channel.to_string()));
        }
        Ok(Self {
            channel: channel.to_string(),
            ..repo
        })
    }

    pub fn plain_open(path: &Path) -> Result<Self, VcsError> {
        if !path.join(".pijul").is_dir() {
            return Err(VcsError::RepoNotFound);
        }
        Ok(Self {
            path: path.to_path_buf(),
            channel: String::new(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, VcsError> {
        cmd::run_pijul(&self.path, args).await
    }

    /// Appends `--channel <c>` when this handle is pinned to one.
    fn with_channel<'a>(&'a self, mut args: Vec<&'a str>) -> Vec<&'a str> {
        if !self.channel.is_empty() {
            args.extend(["--channel", self.channel.as_str()]);
        }
        args
    }

    pub async fn channels(&self) -> Result<Vec<Channel>, VcsError> {
        let output = self.run(&["channel"]).await?;
        Ok(channel::parse_channels(&String::from_utf8_lossy(&output)))
    }

    pub async fn channel_exists(&self, name: &str) -> Result<bool, VcsError> {
        Ok(self.channels().await?.iter().any(|c| c.name == name))
    }

    pub async fn default_channel(&self) -> Result<String, VcsError> {
        Ok(channel::default_channel(&self.channels().await?))
    }

    /// The channel marked current by pijul, `main` if none is marked.
    pub async fn current_channel(&self) -> Result<String, VcsError> {
        Ok(self
            .channels()
            .await?
            .into_iter()
            .find(|c| c.is_current)
            .map_or_else(|| "main".to_string(), |c| c.name))
    }

    pub async fn create_channel(&self, name: &str) -> Result<(), VcsError> {
        self.run(&["channel", "new", name]).await.map(|_| ())
    }

    pub async fn delete_channel(&self, name: &str) -> Result<(), VcsError> {
        self.run(&["channel", "delete", name]).await.map(|_| ())
    }

    pub async fn rename_channel(&self, from: &str, to: &str) -> Result<(), VcsError> {
        self.run(&["channel", "rename", from, to]).await.map(|_| ())
    }

    pub async fn switch_channel(&mut self, name: &str) -> Result<(), VcsError> {
        self.run(&["channel", "switch", name])
            .await
            .map_err(|e| VcsError::Command(format!("switching to channel {name}: {e}")))?;
        self.channel = name.to_string();
        Ok(())
    }

    /// Creates `name` from `from` (or the current channel).
    pub async fn fork_channel(&self, name: &str, from: Option<&str>) -> Result<(), VcsError> {
        let mut args = vec!["channel", "fork", name];
        if let Some(from) = from.filter(|f| !f.is_empty()) {
            args.extend(["--channel", from]);
        }
        self.run(&args).await.map(|_| ())
    }

    /// Text-format change log.
    pub async fn changes(&self, offset: usize, limit: usize) -> Result<Vec<Change>, VcsError> {
        let offset = offset.to_string();
        let limit = limit.to_string();
        let args = self.with_channel(vec!["log", "--offset", &offset, "--limit", &limit]);
        match self.run(&args).await {
            Ok(output) => Ok(change::parse_log_output(&String::from_utf8_lossy(&output))),
            Err(e) if cmd::is_no_changes(&e) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// `pijul log --json`, falling back to the text format when the
    /// installed pijul does not support it.
    pub async fn changes_json(&self, offset: usize, limit: usize) -> Result<Vec<Change>, VcsError> {
        let offset_arg = offset.to_string();
        let limit_arg = limit.to_string();
        let args = self.with_channel(vec!["log", "--offset", &offset_arg, "-n", &limit_arg, "--json"]);
        if let Ok(output) = self.run(&args).await {
            if let Some(changes) = change::parse_log_json(&output) {
                return Ok(changes);
            }
        }
        debug!(repo = %self.path.display(), "falling back to text pijul log");
        self.changes(offset, limit).await
    }

    pub async fn total_changes(&self) -> Result<usize, VcsError> {
        let args = self.with_channel(vec!["log", "--hash-only"]);
        match self.run(&args).await {
            Ok(output) => Ok(String::from_utf8_lossy(&output)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count()),
            Err(e) if cmd::is_no_changes(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn get_change(&self, hash: &str) -> Result<Change, VcsError> {
        let output = self
            .run(&["change", hash])
            .await
            .map_err(|_| VcsError::ChangeNotFound(hash.to_string()))?;
        Ok(change::parse_change_output(hash, &String::from_utf8_lossy(&output)))
    }

    /// Raw `pijul change <hash>` text.
    pub async fn diff_change(&self, hash: &str) -> Result<String, VcsError> {
        let output = self.run(&["change", hash]).await?;
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    pub async fn apply(&self, hash: &str) -> Result<(), VcsError> {
        let args = self.with_channel(vec!["apply", hash]);
        self.run(&args).await.map(|_| ())
    }

    pub async fn unrecord(&self, hash: &str) -> Result<(), VcsError> {
        let args = self.with_channel(vec!["unrecord", hash]);
        self.run(&args).await.map(|_| ())
    }

    pub async fn record(&self, message: &str, authors: &[Author]) -> Result<(), VcsError> {
        let rendered: Vec<String> = authors
            .iter()
            .map(|a| {
                if a.email.is_empty() {
                    a.name.clone()
                } else {
                    format!("{} <{}>", a.name, a.email)
                }
            })
            .collect();

        let mut args = vec!["record", "-m", message];
        for author in &rendered {
            args.extend(["--author", author.as_str()]);
        }
        let args = self.with_channel(args);
        self.run(&args).await.map(|_| ())
    }

    pub async fn add(&self, paths: &[&str]) -> Result<(), VcsError> {
        let mut args = vec!["add"];
        args.extend_from_slice(paths);
        self.run(&args).await.map(|_| ())
    }

    pub async fn remove(&self, paths: &[&str]) -> Result<(), VcsError> {
        let mut args = vec!["remove"];
        args.extend_from_slice(paths);
        self.run(&args).await.map(|_| ())
    }

    /// Tracked files as reported by `pijul ls`.
    pub async fn list_files(&self) -> Result<Vec<String>, VcsError> {
        let output = self.run(&["ls"]).await?;
        Ok(String::from_utf8_lossy(&output)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, VcsError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, VcsError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VcsError::Internal(e.to_string()))?
}

#[async_trait]
impl VcsRepo for PijulRepo {
    fn kind(&self) -> VcsKind {
        VcsKind::Pijul
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn revision(&self) -> &str {
        &self.channel
    }

    async fn tree(&self, path: &str) -> Result<Vec<TreeEntry>, VcsError> {
        let root = self.path.clone();
        let path = path.to_string();
        blocking(move || tree::file_tree(&root, &path)).await
    }

    async fn blob(&self, path: &str) -> Result<Blob, VcsError> {
        let root = self.path.clone();
        let path = path.to_string();
        blocking(move || tree::read_blob(&root, &path)).await
    }

    async fn branches(&self, offset: usize, limit: usize) -> Result<Vec<Branch>, VcsError> {
        let branches = self
            .channels()
            .await?
            .into_iter()
            .map(|c| Branch {
                name: c.name,
                hash: None,
                is_default: c.is_current,
                commit: None,
            })
            .collect();
        Ok(channel::paginate(branches, offset, limit))
    }

    async fn archive(&self, prefix: &str) -> Result<ArchiveStream, VcsError> {
        let root = self.path.clone();
        let prefix = prefix.to_string();
        let (reader, writer) = tokio::io::duplex(ARCHIVE_PIPE_SIZE);
        let writer = SyncIoBridge::new(writer);
        // dropping the writer ends the stream, early on failure
        tokio::task::spawn_blocking(move || {
            if let Err(e) = tree::write_tar(&root, &prefix, writer) {
                warn!(path = %root.display(), error = %e, "tar writer stopped");
            }
        });
        Ok(Box::pin(GzipEncoder::new(BufReader::new(reader))))
    }

    async fn change_log(&self, offset: usize, limit: usize) -> Result<ChangePage, VcsError> {
        let changes = self.changes_json(offset, limit).await?;
        let total = self.total_changes().await?;
        Ok(ChangePage { changes, total })
    }

    async fn apply_changes(&self, hashes: &[String]) -> Result<ApplyOutcome, VcsError> {
        let mut outcome = ApplyOutcome::default();
        for hash in hashes {
            match self.apply(hash).await {
                Ok(()) => outcome.applied.push(hash.clone()),
                Err(e) => outcome.failed.push(ApplyFailure {
                    hash: hash.clone(),
                    error: e.to_string(),
                }),
            }
        }
        Ok(outcome)
    }
}
