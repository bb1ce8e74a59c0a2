use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::vcs::VcsError;

const GIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs `git <args>` in `dir`, optionally feeding `input` on stdin.
/// The child is killed if the timeout fires or the future is dropped.
pub async fn run_git(dir: &Path, args: &[&str], input: Option<&[u8]>) -> Result<Output, VcsError> {
    run_git_with_env(dir, args, &[], input).await
}

pub async fn run_git_with_env(
    dir: &Path,
    args: &[&str],
    envs: &[(&str, &str)],
    input: Option<&[u8]>,
) -> Result<Output, VcsError> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(dir)
        .envs(envs.iter().copied())
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(data) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await?;
        }
    }

    tokio::time::timeout(GIT_COMMAND_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| VcsError::Command(format!("git {} timed out", args.first().unwrap_or(&""))))?
        .map_err(VcsError::from)
}

/// Like [`run_git`] but turns a non-zero exit into [`VcsError::Command`]
/// carrying stderr.
pub async fn run_git_checked(dir: &Path, args: &[&str]) -> Result<Vec<u8>, VcsError> {
    let output = run_git(dir, args, None).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VcsError::Command(format!(
            "git {}: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

pub async fn init_bare_repo(repo_path: &Path, default_branch: &str) -> Result<(), VcsError> {
    fs::create_dir_all(repo_path).await?;

    let output = Command::new("git")
        .args(["init", "--bare"])
        .arg(repo_path)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VcsError::Command(format!(
            "Failed to init bare repo: {stderr}"
        )));
    }

    let head_path = repo_path.join("HEAD");
    fs::write(&head_path, format!("ref: refs/heads/{default_branch}\n")).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_bare_repo_sets_head() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("did:plc:abc").join("repo");
        init_bare_repo(&path, "trunk").await.unwrap();

        let head = std::fs::read_to_string(path.join("HEAD")).unwrap();
        assert_eq!(head, "ref: refs/heads/trunk\n");
        assert!(git2::Repository::open_bare(&path).is_ok());
    }

    #[tokio::test]
    async fn test_run_git_checked_reports_stderr() {
        let temp = TempDir::new().unwrap();
        let err = run_git_checked(temp.path(), &["rev-parse", "HEAD"])
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::Command(msg) if msg.starts_with("git rev-parse")));
    }
}
