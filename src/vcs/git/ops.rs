use std::path::Path;

use chrono::{TimeZone, Utc};
use git2::{ObjectType, Oid, Repository, Sort, Tree};

use crate::vcs::{Author, Blob, Change, ChangePage, MAX_BLOB_SIZE, TreeEntry, VcsError, looks_binary};

const BINARY_SNIFF_BYTES: usize = 8192;

pub fn open_repo(path: &Path) -> Result<Repository, VcsError> {
    Repository::open(path).map_err(|_| VcsError::RepoNotFound)
}

/// Resolves a full hash, branch, tag (peeled to its commit) or, when empty, HEAD.
pub fn resolve_ref(repo: &Repository, ref_spec: &str) -> Result<Oid, VcsError> {
    let ref_spec = if ref_spec.is_empty() {
        "HEAD"
    } else {
        ref_spec
    };

    if ref_spec.len() == 40 {
        if let Ok(oid) = Oid::from_str(ref_spec) {
            if repo.find_commit(oid).is_ok() {
                return Ok(oid);
            }
        }
    }

    let candidates = [
        ref_spec.to_string(),
        format!("refs/heads/{ref_spec}"),
        format!("refs/tags/{ref_spec}"),
    ];
    for name in candidates.iter().filter(|n| n.starts_with("refs/")) {
        if let Ok(reference) = repo.find_reference(name) {
            if let Ok(commit) = reference.peel_to_commit() {
                return Ok(commit.id());
            }
        }
    }

    if ref_spec == "HEAD" {
        let head = repo
            .head()
            .map_err(|_| VcsError::RefNotFound("HEAD".to_string()))?;
        return head
            .peel_to_commit()
            .map(|c| c.id())
            .map_err(|_| VcsError::RefNotFound("HEAD".to_string()));
    }

    Err(VcsError::RefNotFound(ref_spec.to_string()))
}

/// Branch HEAD points at, even when that branch has no commits yet.
#[must_use]
pub fn default_branch(repo: &Repository) -> Option<String> {
    let head = repo.find_reference("HEAD").ok()?;
    match head.symbolic_target() {
        Some(target) => target.strip_prefix("refs/heads/").map(String::from),
        None => repo.head().ok()?.shorthand().map(String::from),
    }
}

fn root_tree(repo: &Repository, oid: Oid) -> Result<Tree<'_>, VcsError> {
    let commit = repo
        .find_commit(oid)
        .map_err(|_| VcsError::RefNotFound(oid.to_string()))?;
    commit
        .tree()
        .map_err(|e| VcsError::Internal(format!("Failed to get tree: {e}")))
}

/// Lists the directory at `path` (empty for the root) as of commit `oid`.
pub fn list_tree(repo: &Repository, oid: Oid, path: &str) -> Result<Vec<TreeEntry>, VcsError> {
    let root = root_tree(repo, oid)?;

    let tree = if path.is_empty() {
        root
    } else {
        let entry = root
            .get_path(Path::new(path))
            .map_err(|_| VcsError::PathNotFound(path.to_string()))?;
        if entry.kind() != Some(ObjectType::Tree) {
            return Ok(Vec::new());
        }
        entry
            .to_object(repo)?
            .into_tree()
            .map_err(|_| VcsError::PathNotFound(path.to_string()))?
    };

    let mut entries = Vec::with_capacity(tree.len());
    for entry in tree.iter() {
        let size = match entry.kind() {
            Some(ObjectType::Blob) => repo.find_blob(entry.id()).map(|b| b.size() as u64).unwrap_or(0),
            _ => 0,
        };
        entries.push(TreeEntry {
            name: entry.name().unwrap_or_default().to_string(),
            mode: format!("{:06o}", entry.filemode()),
            size,
            last_commit: None,
        });
    }
    Ok(entries)
}

pub fn read_blob(repo: &Repository, oid: Oid, path: &str) -> Result<Blob, VcsError> {
    let root = root_tree(repo, oid)?;
    let entry = root
        .get_path(Path::new(path))
        .map_err(|_| VcsError::PathNotFound(path.to_string()))?;
    if entry.kind() == Some(ObjectType::Tree) {
        return Err(VcsError::PathNotFound(path.to_string()));
    }

    let blob = repo
        .find_blob(entry.id())
        .map_err(|e| VcsError::Internal(format!("Failed to get blob object: {e}")))?;
    let content = blob.content();
    let size = content.len() as u64;
    let is_binary = looks_binary(content, BINARY_SNIFF_BYTES);

    let content = if is_binary {
        None
    } else {
        let cap = content.len().min(MAX_BLOB_SIZE as usize);
        Some(String::from_utf8_lossy(&content[..cap]).into_owned())
    };

    Ok(Blob {
        path: path.to_string(),
        size,
        is_binary,
        content,
    })
}

/// First-parent-agnostic history walk from `oid`, newest first.
pub fn commit_log(
    repo: &Repository,
    oid: Oid,
    offset: usize,
    limit: usize,
) -> Result<ChangePage, VcsError> {
    let mut walk = repo.revwalk()?;
    walk.set_sorting(Sort::TIME)?;
    walk.push(oid)?;

    let ids: Vec<Oid> = walk.collect::<Result<Vec<_>, _>>()?;
    let total = ids.len();

    let mut changes = Vec::new();
    for id in ids.into_iter().skip(offset).take(limit) {
        let commit = repo.find_commit(id)?;
        let author = commit.author();
        let timestamp = Utc.timestamp_opt(author.when().seconds(), 0).single();
        changes.push(Change {
            hash: id.to_string(),
            authors: vec![Author {
                name: author.name().unwrap_or_default().to_string(),
                email: author.email().unwrap_or_default().to_string(),
            }],
            message: commit.message().unwrap_or_default().trim().to_string(),
            timestamp,
            dependencies: commit.parent_ids().map(|p| p.to_string()).collect(),
        });
    }

    Ok(ChangePage { changes, total })
}
