//! Git backend: git2 for object reads, the `git` binary for everything that
//! streams or rewrites refs.

pub mod cmd;
pub mod fork;
pub mod last_commit;
pub mod merge;
pub mod ops;
pub mod refs;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::GzipEncoder;
use async_trait::async_trait;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

use super::{
    ApplyOutcome, ArchiveStream, Author, Blob, Branch, ChangePage, TreeEntry, VcsError, VcsRepo,
    clean_path,
};
use crate::types::VcsKind;

pub use merge::{ConflictInfo, MergeError, MergeOptions};

/// A git repository pinned to one commit.
pub struct GitRepo {
    path: PathBuf,
    hash: String,
}

impl GitRepo {
    /// Opens `path` and resolves `reference` (empty for HEAD) to a commit.
    pub fn open(path: &Path, reference: &str) -> Result<Self, VcsError> {
        let repo = ops::open_repo(path)?;
        let oid = ops::resolve_ref(&repo, reference)?;
        Ok(Self {
            path: path.to_path_buf(),
            hash: oid.to_string(),
        })
    }

    /// Opens without resolving a ref, for listings that work on empty repos.
    pub fn plain_open(path: &Path) -> Result<Self, VcsError> {
        let repo = ops::open_repo(path)?;
        let hash = ops::resolve_ref(&repo, "")
            .map(|oid| oid.to_string())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            hash,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    fn pinned(&self) -> Result<(git2::Repository, git2::Oid), VcsError> {
        if self.hash.is_empty() {
            return Err(VcsError::RefNotFound("HEAD".to_string()));
        }
        let repo = ops::open_repo(&self.path)?;
        let oid = git2::Oid::from_str(&self.hash)?;
        Ok((repo, oid))
    }

    pub fn default_branch(&self) -> Option<String> {
        ops::open_repo(&self.path)
            .ok()
            .and_then(|repo| ops::default_branch(&repo))
    }

    /// Author of commit `hash`, if it can be read.
    pub fn author_of(&self, hash: &str) -> Option<Author> {
        let repo = ops::open_repo(&self.path).ok()?;
        let commit = repo.find_commit(git2::Oid::from_str(hash).ok()?).ok()?;
        let author = commit.author();
        Some(Author {
            name: author.name().unwrap_or_default().to_string(),
            email: author.email().unwrap_or_default().to_string(),
        })
    }
}

/// Keeps the producing child alive for as long as its stdout is being read.
struct ChildReader {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ChildReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

#[async_trait]
impl VcsRepo for GitRepo {
    fn kind(&self) -> VcsKind {
        VcsKind::Git
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn revision(&self) -> &str {
        &self.hash
    }

    async fn tree(&self, path: &str) -> Result<Vec<TreeEntry>, VcsError> {
        let dir = clean_path(path);
        let mut entries = {
            let (repo, oid) = self.pinned()?;
            ops::list_tree(&repo, oid, &dir)?
        };
        if entries.is_empty() {
            return Ok(entries);
        }

        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        let mut found = last_commit::last_commit_dir(
            &self.path,
            &self.hash,
            &dir,
            &names,
            last_commit::LAST_COMMIT_TIMEOUT,
        )
        .await?;

        for entry in &mut entries {
            let full = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{dir}/{}", entry.name)
            };
            entry.last_commit = found.remove(&full);
        }
        Ok(entries)
    }

    async fn blob(&self, path: &str) -> Result<Blob, VcsError> {
        let (repo, oid) = self.pinned()?;
        ops::read_blob(&repo, oid, &clean_path(path))
    }

    async fn branches(&self, offset: usize, limit: usize) -> Result<Vec<Branch>, VcsError> {
        let default = self.default_branch();
        refs::branches(&self.path, offset, limit, default.as_deref()).await
    }

    async fn archive(&self, prefix: &str) -> Result<ArchiveStream, VcsError> {
        if self.hash.is_empty() {
            return Err(VcsError::RefNotFound("HEAD".to_string()));
        }
        let prefix = format!("--prefix={}/", prefix.trim_end_matches('/'));
        let mut child = Command::new("git")
            .args(["archive", "--format=tar", &prefix, &self.hash])
            .current_dir(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VcsError::Internal("git archive stdout unavailable".to_string()))?;

        let reader = ChildReader {
            _child: child,
            stdout,
        };
        Ok(Box::pin(GzipEncoder::new(BufReader::new(reader))))
    }

    async fn change_log(&self, offset: usize, limit: usize) -> Result<ChangePage, VcsError> {
        let (repo, oid) = self.pinned()?;
        ops::commit_log(&repo, oid, offset, limit)
    }

    async fn apply_changes(&self, _hashes: &[String]) -> Result<ApplyOutcome, VcsError> {
        Err(VcsError::Unsupported("applyChanges"))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    use git2::{Oid, Repository, RepositoryInitOptions, Signature, Time};
    use tempfile::TempDir;

    /// A non-bare scratch repository on `main` with deterministic commit times.
    pub struct TestRepo {
        dir: TempDir,
    }

    impl TestRepo {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mut opts = RepositoryInitOptions::new();
            opts.initial_head("main");
            Repository::init_opts(dir.path(), &opts).unwrap();
            Self { dir }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        pub fn open(&self) -> Repository {
            Repository::open(self.dir.path()).unwrap()
        }

        pub fn commit(&self, files: &[(&str, &str)], message: &str, time: i64) -> Oid {
            let repo = self.open();
            let mut index = repo.index().unwrap();
            for (name, content) in files {
                let full = self.dir.path().join(name);
                std::fs::create_dir_all(full.parent().unwrap()).unwrap();
                std::fs::write(&full, content).unwrap();
                index.add_path(Path::new(name)).unwrap();
            }
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = Signature::new("Test User", "test@example.com", &Time::new(time, 0)).unwrap();
            let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
            let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
                .unwrap()
        }

        pub fn branch(&self, name: &str, target: Oid) {
            self.open()
                .reference(&format!("refs/heads/{name}"), target, true, "branch")
                .unwrap();
        }

        pub fn tag_lightweight(&self, name: &str, target: Oid) {
            self.open()
                .reference(&format!("refs/tags/{name}"), target, true, "tag")
                .unwrap();
        }

        pub fn tag_annotated(&self, name: &str, target: Oid, message: &str) {
            let repo = self.open();
            let object = repo.find_object(target, None).unwrap();
            let sig = Signature::new("Tagger", "tagger@example.com", &Time::new(1_700_000_050, 0)).unwrap();
            repo.tag(name, &object, &sig, message, true).unwrap();
        }

        /// `git clone --bare` of this repository into a fresh temp dir.
        pub fn bare_clone(&self) -> (TempDir, PathBuf) {
            let dir = TempDir::new().unwrap();
            let bare = dir.path().join("bare.git");
            let status = std::process::Command::new("git")
                .args(["clone", "--bare", "--quiet"])
                .arg(self.dir.path())
                .arg(&bare)
                .status()
                .unwrap();
            assert!(status.success());
            (dir, bare)
        }
    }
}
