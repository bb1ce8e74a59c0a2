use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Joins `unsafe_path` onto `root` so that the result stays inside `root`.
///
/// `..` segments, absolute paths and control characters are rejected outright.
/// Components that already exist on disk are checked for symlinks pointing
/// outside the root.
pub fn secure_join(root: &Path, unsafe_path: &str) -> Result<PathBuf> {
    let segments = normalize_segments(unsafe_path)?;

    let mut joined = root.to_path_buf();
    for segment in &segments {
        joined.push(segment);
    }

    check_symlinks(root, &segments)?;
    Ok(joined)
}

/// Splits a relative path into validated segments, dropping empty and `.` parts.
pub fn normalize_segments(path: &str) -> Result<Vec<String>> {
    let path = path.trim();

    if Path::new(path).has_root() {
        return Err(Error::BadRequest(format!("absolute path not allowed: {path}")));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::BadRequest(format!(
                    "path traversal not allowed: {path}"
                )));
            }
            s => {
                validate_segment(s)?;
                segments.push(s.to_string());
            }
        }
    }

    if segments.is_empty() {
        return Err(Error::BadRequest("Path cannot be empty".to_string()));
    }

    Ok(segments)
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.len() > 255 {
        return Err(Error::BadRequest(
            "Path segment cannot exceed 255 characters".to_string(),
        ));
    }

    const INVALID_CHARS: &[char] = &['\0', '\n', '\r', '\\'];
    if segment.chars().any(|c| INVALID_CHARS.contains(&c)) {
        return Err(Error::BadRequest(
            "Path segment contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

fn check_symlinks(root: &Path, segments: &[String]) -> Result<()> {
    let Ok(canonical_root) = root.canonicalize() else {
        // nothing on disk yet, so nothing can escape
        return Ok(());
    };

    let mut current = root.to_path_buf();
    for segment in segments {
        current.push(segment);
        let Ok(meta) = std::fs::symlink_metadata(&current) else {
            return Ok(());
        };
        if meta.file_type().is_symlink() {
            let target = current.canonicalize()?;
            if !target.starts_with(&canonical_root) {
                return Err(Error::BadRequest(format!(
                    "path escapes root via symlink: {}",
                    current.display()
                )));
            }
        }
    }
    Ok(())
}

/// Lexically cleans a repository-internal path (`a//b/./c/` → `a/b/c`).
/// Returns an empty string for the repository root.
#[must_use]
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(s) => parts.push(s.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.join("/")
}
