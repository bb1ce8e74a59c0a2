//! Applies a patch to a bare repository through a scratch clone.
//!
//! The bare repository only ever sees the final `git push`, so a failed merge
//! leaves it untouched.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::cmd::{run_git, run_git_with_env};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOptions {
    pub commit_message: String,
    pub commit_body: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub committer_name: String,
    pub committer_email: String,
    /// Apply with `git am` so author and dates from the patch survive.
    pub format_patch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictInfo {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeError {
    pub message: String,
    pub has_conflict: bool,
    pub conflicts: Vec<ConflictInfo>,
    pub other_error: Option<String>,
}

impl MergeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    fn with_other(message: impl Into<String>, other: impl fmt::Display) -> Self {
        Self {
            message: message.into(),
            other_error: Some(other.to_string()),
            ..Self::default()
        }
    }

    fn from_stderr(message: impl Into<String>, stderr: &str) -> Self {
        let conflicts = parse_git_apply_errors(stderr);
        Self {
            message: message.into(),
            has_conflict: !conflicts.is_empty(),
            conflicts,
            other_error: Some(stderr.trim().to_string()),
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_conflict {
            write!(
                f,
                "merge failed due to conflicts: {} ({} conflicts)",
                self.message,
                self.conflicts.len()
            )
        } else if let Some(other) = &self.other_error {
            write!(f, "merge failed: {}: {other}", self.message)
        } else {
            write!(f, "merge failed: {}", self.message)
        }
    }
}

impl std::error::Error for MergeError {}

/// Classifies `git apply` / `git am` stderr into per-file conflicts.
#[must_use]
pub fn parse_git_apply_errors(stderr: &str) -> Vec<ConflictInfo> {
    let mut conflicts = Vec::new();
    let mut current_file = String::new();

    for line in stderr.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("error: patch failed:") {
            let rest = rest.trim();
            current_file = rest
                .rsplit_once(':')
                .map_or(rest, |(file, _)| file)
                .to_string();
            continue;
        }

        let Some(rest) = line.strip_prefix("error:") else {
            continue;
        };
        let rest = rest.trim();

        let reason = if rest.contains("already exists") {
            "file already exists".to_string()
        } else if rest.contains("does not exist") {
            "file does not exist".to_string()
        } else if rest.contains("patch does not apply") {
            "patch does not apply".to_string()
        } else {
            rest.rsplit_once(": ")
                .map_or(rest, |(_, msg)| msg)
                .to_string()
        };

        let filename = rest
            .split_once(':')
            .map(|(file, _)| file.trim().to_string())
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| current_file.clone());

        conflicts.push(ConflictInfo { filename, reason });
    }

    conflicts
}

/// A mailbox patch starts with `From <40-hex>` like `git format-patch` output.
#[must_use]
pub fn is_mailbox(patch: &str) -> bool {
    let Some(first) = patch.lines().next() else {
        return false;
    };
    let Some(rest) = first.strip_prefix("From ") else {
        return false;
    };
    let hash = rest.split_whitespace().next().unwrap_or_default();
    hash.len() == 40 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Scratch directory removed on drop, whichever way the merge ends.
struct Scratch {
    root: PathBuf,
}

impl Scratch {
    fn create() -> Result<Self, MergeError> {
        let root = std::env::temp_dir().join(format!("tangled-merge-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root)
            .map_err(|e| MergeError::with_other("failed to create temporary directory", e))?;
        Ok(Self { root })
    }

    fn workdir(&self) -> PathBuf {
        self.root.join("repo")
    }

    fn patch_file(&self) -> PathBuf {
        self.root.join("patch.diff")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            warn!(path = %self.root.display(), error = %e, "failed to remove merge scratch directory");
        }
    }
}

fn identity_env(opts: &MergeOptions) -> Vec<(&str, &str)> {
    vec![
        ("GIT_COMMITTER_NAME", opts.committer_name.as_str()),
        ("GIT_COMMITTER_EMAIL", opts.committer_email.as_str()),
        ("GIT_AUTHOR_NAME", opts.author_name.as_deref().unwrap_or(&opts.committer_name)),
        ("GIT_AUTHOR_EMAIL", opts.author_email.as_deref().unwrap_or(&opts.committer_email)),
    ]
}

async fn clone_branch(bare: &Path, branch: &str, workdir: &Path) -> Result<(), MergeError> {
    let bare = bare.to_string_lossy();
    let workdir_str = workdir.to_string_lossy();
    let parent = workdir.parent().unwrap_or(workdir);
    let output = run_git(
        parent,
        &["clone", "--branch", branch, bare.as_ref(), workdir_str.as_ref()],
        None,
    )
    .await
    .map_err(|e| MergeError::with_other("failed to clone repository", e))?;

    if !output.status.success() {
        return Err(MergeError::with_other(
            "failed to clone repository",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    Ok(())
}

async fn apply_mailbox(workdir: &Path, patch: &str, opts: &MergeOptions) -> Result<(), MergeError> {
    let output = run_git_with_env(workdir, &["am", "--keep-cr"], &identity_env(opts), Some(patch.as_bytes()))
        .await
        .map_err(|e| MergeError::with_other("failed to run git am", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let _ = run_git(workdir, &["am", "--abort"], None).await;
        return Err(MergeError::from_stderr("failed to apply mailbox patches", &stderr));
    }
    Ok(())
}

async fn apply_patch(
    workdir: &Path,
    patch_file: &Path,
    opts: &MergeOptions,
) -> Result<(), MergeError> {
    let file = patch_file.to_string_lossy();
    let env = identity_env(opts);

    if opts.format_patch {
        let output = run_git_with_env(workdir, &["am", file.as_ref()], &env, None)
            .await
            .map_err(|e| MergeError::with_other("failed to run git am", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let _ = run_git(workdir, &["am", "--abort"], None).await;
            return Err(MergeError::from_stderr("patch application failed", &stderr));
        }
        return Ok(());
    }

    let output = run_git(workdir, &["apply", "--index", file.as_ref()], None)
        .await
        .map_err(|e| MergeError::with_other("patch application failed", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MergeError::from_stderr("patch application failed", &stderr));
    }

    let mut args = vec!["commit", "-m", opts.commit_message.as_str()];
    if let Some(body) = opts.commit_body.as_deref().filter(|b| !b.is_empty()) {
        args.extend(["-m", body]);
    }
    let output = run_git_with_env(workdir, &args, &env, None)
        .await
        .map_err(|e| MergeError::with_other("failed to commit", e))?;
    if !output.status.success() {
        return Err(MergeError::with_other(
            "failed to commit",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    Ok(())
}

async fn prepare(
    bare: &Path,
    patch: &str,
    branch: &str,
) -> Result<Scratch, MergeError> {
    let scratch = Scratch::create()?;
    clone_branch(bare, branch, &scratch.workdir()).await?;
    tokio::fs::write(scratch.patch_file(), patch)
        .await
        .map_err(|e| MergeError::with_other("failed to write patch file", e))?;
    Ok(scratch)
}

/// Applies `patch` on top of `branch` in the bare repository at `bare` and
/// pushes the result with `+<branch>:<branch>`.
pub async fn merge(bare: &Path, patch: &str, branch: &str, opts: &MergeOptions) -> Result<(), MergeError> {
    let scratch = prepare(bare, patch, branch).await?;
    let workdir = scratch.workdir();

    if is_mailbox(patch) {
        apply_mailbox(&workdir, patch, opts).await?;
    } else {
        apply_patch(&workdir, &scratch.patch_file(), opts).await?;
    }

    let refspec = format!("+{branch}:{branch}");
    let output = run_git(&workdir, &["push", "origin", &refspec], None)
        .await
        .map_err(|e| MergeError::with_other("failed to push", e))?;
    if !output.status.success() {
        return Err(MergeError::with_other(
            "failed to push",
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }

    debug!(repo = %bare.display(), branch, "merged patch");
    Ok(())
}

/// Dry run of [`merge`]: reports conflicts without committing or pushing.
pub async fn check_merge(bare: &Path, patch: &str, branch: &str) -> Result<(), MergeError> {
    let scratch = prepare(bare, patch, branch).await?;
    let file = scratch.patch_file();
    let file = file.to_string_lossy();

    let output = run_git(&scratch.workdir(), &["apply", "--check", "-v", file.as_ref()], None)
        .await
        .map_err(|e| MergeError::with_other("failed to check patch", e))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut err = MergeError::from_stderr("patch cannot be applied cleanly", &stderr);
        if err.conflicts.is_empty() {
            err = MergeError::new("patch cannot be applied cleanly");
        }
        return Err(err);
    }
    Ok(())
}
