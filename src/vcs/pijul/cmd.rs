use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::vcs::VcsError;

const PIJUL_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs `pijul <args>` in `dir`. A non-zero exit becomes [`VcsError::Command`]
/// carrying stderr.
pub async fn run_pijul(dir: &Path, args: &[&str]) -> Result<Vec<u8>, VcsError> {
    let child = Command::new("pijul")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let verb = args.first().copied().unwrap_or_default();
    let output = tokio::time::timeout(PIJUL_COMMAND_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| VcsError::Command(format!("pijul {verb} timed out")))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VcsError::Command(format!("pijul {verb}: {}", stderr.trim())));
    }
    Ok(output.stdout)
}

/// `pijul log` reports an empty channel as an error rather than empty output.
pub fn is_no_changes(err: &VcsError) -> bool {
    match err {
        VcsError::Command(msg) => msg.to_ascii_lowercase().contains("no change"),
        _ => false,
    }
}

/// Creates `repo_path` and runs `pijul init` inside it.
pub async fn init_repo(repo_path: &Path) -> Result<(), VcsError> {
    tokio::fs::create_dir_all(repo_path).await?;
    run_pijul(repo_path, &["init"]).await?;
    Ok(())
}

/// `pijul clone <source> <dest> [--channel <c>]`, used for both clones and forks.
pub async fn clone(source: &str, dest: &Path, channel: Option<&str>) -> Result<(), VcsError> {
    let parent = dest.parent().unwrap_or(dest);
    tokio::fs::create_dir_all(parent).await?;

    let dest = dest.to_string_lossy();
    let mut args = vec!["clone", source, dest.as_ref()];
    if let Some(channel) = channel.filter(|c| !c.is_empty()) {
        args.extend(["--channel", channel]);
    }
    run_pijul(parent, &args).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_no_changes() {
        assert!(is_no_changes(&VcsError::Command("pijul log: No changes".into())));
        assert!(is_no_changes(&VcsError::Command("pijul log: no change found".into())));
        assert!(!is_no_changes(&VcsError::Command("pijul log: broken".into())));
        assert!(!is_no_changes(&VcsError::RepoNotFound));
    }
}
