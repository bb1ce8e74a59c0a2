//! Per-entry "last commit that touched this path", computed from a single
//! streaming `git log` and memoised in a process-wide LRU.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::vcs::{LastCommitInfo, VcsError, clean_path};

pub const LAST_COMMIT_TIMEOUT: Duration = Duration::from_secs(2);

const CACHE_CAPACITY: usize = 1 << 17;

static CACHE: OnceLock<Mutex<LruCache<String, LastCommitInfo>>> = OnceLock::new();

fn cache() -> &'static Mutex<LruCache<String, LastCommitInfo>> {
    CACHE.get_or_init(|| {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Mutex::new(LruCache::new(capacity))
    })
}

/// Hex sha256 of `<repo>:<commit>:<path>`. The commit hash pins history, so
/// entries never go stale.
#[must_use]
pub fn cache_key(repo_path: &Path, hash: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_path.to_string_lossy().as_bytes());
    hasher.update(b":");
    hasher.update(hash.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Every proper ancestor directory of a cleaned path, nearest first.
fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if parent.is_empty() {
            break;
        }
        out.push(parent.to_string());
        current = parent;
    }
    out
}

fn join(dir: &str, child: &str) -> String {
    if dir.is_empty() {
        clean_path(child)
    } else {
        clean_path(&format!("{dir}/{child}"))
    }
}

#[derive(Default)]
struct PendingCommit {
    info: Option<LastCommitInfo>,
    files: HashSet<String>,
}

fn parse_header(line: &str) -> Option<LastCommitInfo> {
    let mut parts = line.splitn(3, ',');
    let hash = parts.next()?;
    let when = parts.next()?;
    let message = parts.next()?;
    if hash.len() != 40 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let secs = when.parse::<i64>().unwrap_or_default();
    Some(LastCommitInfo {
        hash: hash.to_string(),
        message: message.to_string(),
        when: Utc.timestamp_opt(secs, 0).single().unwrap_or_default(),
    })
}

/// Resolves the last commit for each `entries` child of `dir` at commit
/// `hash`. Entries still unresolved when `timeout` fires are left out.
pub async fn last_commit_dir(
    repo_path: &Path,
    hash: &str,
    dir: &str,
    entries: &[String],
    timeout: Duration,
) -> Result<HashMap<String, LastCommitInfo>, VcsError> {
    let dir = clean_path(dir);
    let mut done: HashMap<String, LastCommitInfo> = HashMap::new();
    let mut todo: HashSet<String> = HashSet::new();

    {
        let mut cache = cache().lock();
        for entry in entries {
            let path = join(&dir, entry);
            match cache.get(&cache_key(repo_path, hash, &path)) {
                Some(hit) => {
                    done.insert(path, hit.clone());
                }
                None => {
                    todo.insert(path);
                }
            }
        }
    }

    if todo.is_empty() {
        return Ok(done);
    }

    let pathspec = match (todo.len(), todo.iter().next()) {
        (1, Some(only)) => only.clone(),
        _ if dir.is_empty() => ".".to_string(),
        _ => dir.clone(),
    };

    let walk = stream_log(repo_path, hash, &pathspec, &mut todo, &mut done);
    let outcome = tokio::time::timeout(timeout, walk).await;
    match outcome {
        Ok(result) => result?,
        Err(_) => debug!(
            repo = %repo_path.display(),
            remaining = todo.len(),
            "last commit computation hit its deadline"
        ),
    }

    Ok(done)
}

async fn stream_log(
    repo_path: &Path,
    hash: &str,
    pathspec: &str,
    todo: &mut HashSet<String>,
    done: &mut HashMap<String, LastCommitInfo>,
) -> Result<(), VcsError> {
    let mut child = Command::new("git")
        .args([
            "log",
            hash,
            "--pretty=format:%H,%ad,%s",
            "--date=unix",
            "--name-only",
            "--",
            pathspec,
        ])
        .current_dir(repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| VcsError::Internal("git log stdout unavailable".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut current = PendingCommit::default();
    loop {
        let line = lines.next_line().await?;
        let finished = line.is_none();
        let line = line.unwrap_or_default();
        let line = line.trim();

        // Commits without file lists (merges) run straight into the next header.
        let next_header = if current.info.is_some() && !line.is_empty() {
            parse_header(line).filter(|_| current.files.is_empty())
        } else {
            None
        };

        if line.is_empty() || next_header.is_some() || finished {
            if let Some(info) = current.info.take() {
                resolve(repo_path, hash, &info, &current.files, todo, done);
                if todo.is_empty() {
                    break;
                }
            }
            current = PendingCommit {
                info: next_header,
                files: HashSet::new(),
            };
        } else if current.info.is_none() {
            current.info = parse_header(line);
        } else {
            let file = clean_path(line);
            for ancestor in ancestors(&file) {
                current.files.insert(ancestor);
            }
            current.files.insert(file);
        }

        if finished {
            break;
        }
    }

    // Nothing left to learn; stop git walking the rest of history.
    let _ = child.start_kill();
    let _ = child.wait().await;
    Ok(())
}

fn resolve(
    repo_path: &Path,
    hash: &str,
    info: &LastCommitInfo,
    files: &HashSet<String>,
    todo: &mut HashSet<String>,
    done: &mut HashMap<String, LastCommitInfo>,
) {
    let touched: Vec<String> = todo.iter().filter(|p| files.contains(*p)).cloned().collect();
    if touched.is_empty() {
        return;
    }
    let mut cache = cache().lock();
    for path in touched {
        todo.remove(&path);
        cache.put(cache_key(repo_path, hash, &path), info.clone());
        done.insert(path, info.clone());
    }
}

/// Last commit touching a single file or directory.
pub async fn last_commit_file(
    repo_path: &Path,
    hash: &str,
    file_path: &str,
) -> Result<LastCommitInfo, VcsError> {
    let cleaned = clean_path(file_path);
    let (dir, child) = match cleaned.rsplit_once('/') {
        Some((dir, child)) => (dir.to_string(), child.to_string()),
        None => (String::new(), cleaned.clone()),
    };

    let mut found =
        last_commit_dir(repo_path, hash, &dir, &[child], LAST_COMMIT_TIMEOUT).await?;
    found
        .remove(&cleaned)
        .ok_or_else(|| VcsError::PathNotFound(format!("no commit found for path: {file_path}")))
}
