//! Working-copy reads. Pijul has no object store to walk, so trees, blobs and
//! archives come straight from the checked-out files.

use std::fs;
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::vcs::{Blob, MAX_BLOB_SIZE, TreeEntry, VcsError, clean_path, looks_binary, secure_join};

const PIJUL_DIR: &str = ".pijul";
const BINARY_SNIFF_BYTES: usize = 512;

fn resolve(root: &Path, path: &str) -> Result<PathBuf, VcsError> {
    let cleaned = clean_path(path);
    if cleaned.is_empty() {
        return Ok(root.to_path_buf());
    }
    secure_join(root, &cleaned).map_err(|_| VcsError::PathNotFound(path.to_string()))
}

fn not_found(path: &str) -> impl Fn(io::Error) -> VcsError + '_ {
    move |e| match e.kind() {
        io::ErrorKind::NotFound => VcsError::PathNotFound(path.to_string()),
        _ => VcsError::from(e),
    }
}

/// Git-style mode string for a working-copy entry.
pub fn mode_string(meta: &fs::Metadata) -> &'static str {
    if meta.file_type().is_symlink() {
        "120000"
    } else if meta.is_dir() {
        "040000"
    } else if is_executable(meta) {
        "100755"
    } else {
        "100644"
    }
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

/// Lists `path` in the working copy, skipping `.pijul`. A file path yields no
/// entries.
pub fn file_tree(root: &Path, path: &str) -> Result<Vec<TreeEntry>, VcsError> {
    let full = resolve(root, path)?;
    let meta = fs::metadata(&full).map_err(not_found(path))?;
    if !meta.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&full)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == PIJUL_DIR {
            continue;
        }
        let Ok(meta) = fs::symlink_metadata(entry.path()) else {
            continue;
        };
        entries.push(TreeEntry {
            name,
            mode: mode_string(&meta).to_string(),
            size: meta.len(),
            last_commit: None,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn read_blob(root: &Path, path: &str) -> Result<Blob, VcsError> {
    let full = resolve(root, path)?;
    let meta = fs::metadata(&full).map_err(not_found(path))?;
    if meta.is_dir() {
        return Err(VcsError::PathNotFound(path.to_string()));
    }

    let size = meta.len();
    let bytes = fs::read(&full).map_err(not_found(path))?;
    let is_binary = looks_binary(&bytes, BINARY_SNIFF_BYTES);
    let content = (!is_binary && size <= MAX_BLOB_SIZE)
        .then(|| String::from_utf8_lossy(&bytes).into_owned());

    Ok(Blob {
        path: clean_path(path),
        size,
        is_binary,
        content,
    })
}

/// Every tracked-looking file below `root`, relative and sorted, `.pijul` excluded.
fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        if child.file_name() == PIJUL_DIR {
            continue;
        }
        let path = child.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        out.push(rel);
        if child.file_type()?.is_dir() {
            walk(root, &path, out)?;
        }
    }
    Ok(())
}

/// Writes a tar of the working copy with every entry under `prefix/`.
/// Compression is left to the caller.
pub fn write_tar<W: Write>(root: &Path, prefix: &str, out: W) -> io::Result<W> {
    let mut paths = Vec::new();
    walk(root, root, &mut paths)?;

    let mut builder = tar::Builder::new(out);
    builder.follow_symlinks(false);
    let prefix = Path::new(prefix.trim_end_matches('/'));
    for rel in paths {
        builder.append_path_with_name(root.join(&rel), prefix.join(&rel))?;
    }
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn working_copy() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join(".pijul/pristine")).unwrap();
        fs::write(root.join(".pijul/config"), "x").unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("README.md"), "# hello\n").unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(root.join("logo.png"), b"\x89PNG\0\0data").unwrap();
        let script = root.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        temp
    }

    #[test]
    fn test_file_tree_skips_pijul_dir() {
        let temp = working_copy();
        let entries = file_tree(temp.path(), "").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["README.md", "logo.png", "run.sh", "src"]);

        #[cfg(unix)]
        {
            let modes: Vec<&str> = entries.iter().map(|e| e.mode.as_str()).collect();
            assert_eq!(modes, vec!["100644", "100644", "100755", "040000"]);
        }
        assert!(entries.iter().all(|e| e.last_commit.is_none()));
    }

    #[test]
    fn test_file_tree_paths() {
        let temp = working_copy();
        assert_eq!(file_tree(temp.path(), "src").unwrap().len(), 1);
        assert!(file_tree(temp.path(), "README.md").unwrap().is_empty());
        assert!(matches!(
            file_tree(temp.path(), "missing"),
            Err(VcsError::PathNotFound(_))
        ));
        assert!(matches!(
            file_tree(temp.path(), "../etc"),
            Err(VcsError::PathNotFound(_))
        ));
    }

    #[test]
    fn test_read_blob() {
        let temp = working_copy();
        let text = read_blob(temp.path(), "src/main.rs").unwrap();
        assert!(!text.is_binary);
        assert_eq!(text.content.as_deref(), Some("fn main() {}\n"));

        let binary = read_blob(temp.path(), "logo.png").unwrap();
        assert!(binary.is_binary);
        assert!(binary.content.is_none());

        assert!(matches!(read_blob(temp.path(), "src"), Err(VcsError::PathNotFound(_))));
    }

    #[test]
    fn test_write_tar_excludes_pijul() {
        let temp = working_copy();
        let bytes = write_tar(temp.path(), "repo-main", Vec::new()).unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n == "repo-main/src/main.rs"));
        assert!(names.iter().any(|n| n == "repo-main/README.md"));
        assert!(names.iter().all(|n| !n.contains(".pijul")));
    }
}
