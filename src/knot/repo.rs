use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use super::SharedKnotState;
use crate::rbac::{PijulPermissions, THIS_SERVER, check_repo_format};
use crate::types::VcsKind;
use crate::vcs::git::{GitRepo, refs};
use crate::vcs::pijul::PijulRepo;
use crate::vcs::{self, ArchiveStream, Author, Branch, TreeEntry, VcsError, VcsRepo, detect_vcs};
use crate::xrpc::{ActorDid, PageParams, XrpcError, nsid};

#[derive(Debug, Default, Deserialize)]
pub struct TreeParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub channel: String,
}

#[derive(Debug, Serialize)]
pub struct Readme {
    pub filename: String,
    pub contents: String,
}

#[derive(Debug, Serialize)]
pub struct TreeLastCommit {
    pub hash: String,
    pub message: String,
    pub when: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
}

#[derive(Debug, Serialize)]
pub struct TreeOutput {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotdot: Option<String>,
    pub files: Vec<TreeEntry>,
    pub readme: Readme,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_commit: Option<TreeLastCommit>,
}

fn pijul_open_failed() -> XrpcError {
    XrpcError::new(
        StatusCode::NOT_FOUND,
        crate::xrpc::ErrorTag::RepoNotFound,
        "failed to open pijul repository",
    )
}

/// The channel a pijul read should use: `channel`, else `ref`, else the
/// repository's default.
pub(super) async fn pick_channel(path: &std::path::Path, channel: &str, reference: &str) -> String {
    if !channel.is_empty() {
        return channel.to_string();
    }
    if !reference.is_empty() {
        return reference.to_string();
    }
    match PijulRepo::plain_open(path) {
        Ok(repo) => repo.default_channel().await.unwrap_or_default(),
        Err(_) => String::new(),
    }
}

/// Opens through the VCS dispatch, mapping open failures the way each
/// backend reports them.
pub(super) async fn open_for_read(
    path: &std::path::Path,
    kind: VcsKind,
    reference: &str,
) -> Result<Box<dyn VcsRepo>, XrpcError> {
    vcs::open(path, reference).await.map_err(|e| {
        error!(repo = %path.display(), reference, error = %e, "failed to open repository");
        match kind {
            VcsKind::Pijul => pijul_open_failed(),
            VcsKind::Git => XrpcError::ref_not_found(),
        }
    })
}

/// Shared tree listing for both backends once the repository is open.
pub(super) async fn list_tree(repo: &dyn VcsRepo, path: &str) -> Result<TreeOutput, XrpcError> {
    let files = repo.tree(path).await.map_err(|e| {
        error!(path, error = %e, "failed to get file tree");
        XrpcError::new(
            StatusCode::NOT_FOUND,
            crate::xrpc::ErrorTag::PathNotFound,
            "failed to read repository tree",
        )
    })?;

    let mut readme = Readme {
        filename: String::new(),
        contents: String::new(),
    };
    for file in files.iter().filter(|f| f.is_file() && vcs::is_readme(&f.name)) {
        let full = if path.is_empty() {
            file.name.clone()
        } else {
            format!("{}/{}", path.trim_end_matches('/'), file.name)
        };
        match repo.blob(&full).await {
            Ok(blob) if !blob.is_binary => {
                if let Some(contents) = blob.content {
                    readme = Readme {
                        filename: file.name.clone(),
                        contents,
                    };
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => warn!(file = %file.name, error = %e, "failed to read readme candidate"),
        }
    }

    let newest = files
        .iter()
        .filter_map(|f| f.last_commit.as_ref())
        .max_by_key(|c| c.when)
        .cloned();
    let last_commit = newest.map(|c| {
        let author = match repo.kind() {
            VcsKind::Git => GitRepo::plain_open(repo.path())
                .ok()
                .and_then(|g| g.author_of(&c.hash)),
            VcsKind::Pijul => None,
        };
        TreeLastCommit {
            hash: c.hash,
            message: c.message,
            when: c.when,
            author,
        }
    });

    let (parent, dotdot) = if path.is_empty() {
        (None, None)
    } else {
        let dotdot = path
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_string());
        (Some(path.to_string()), dotdot)
    };

    Ok(TreeOutput {
        reference: String::new(),
        parent,
        dotdot,
        files,
        readme,
        last_commit,
    })
}

pub async fn tree(
    State(state): State<SharedKnotState>,
    Query(params): Query<TreeParams>,
) -> Result<Json<TreeOutput>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    let kind = detect_vcs(&path).unwrap_or_default();

    let reference = match kind {
        VcsKind::Pijul => pick_channel(&path, &params.channel, &params.reference).await,
        VcsKind::Git => params.reference.clone(),
    };

    let repo = open_for_read(&path, kind, &reference).await?;
    let mut output = list_tree(repo.as_ref(), &params.path).await?;
    output.reference = reference;
    Ok(Json(output))
}

#[derive(Debug, Serialize)]
pub struct BlobOutput {
    #[serde(rename = "ref")]
    pub reference: String,
    pub path: String,
    pub size: u64,
    pub is_binary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

pub(super) async fn read_blob(repo: &dyn VcsRepo, reference: String, path: &str) -> Result<BlobOutput, XrpcError> {
    let blob = repo.blob(path).await.map_err(|e| {
        error!(path, error = %e, "failed to read file");
        match e {
            VcsError::RefNotFound(_) => XrpcError::ref_not_found(),
            _ => XrpcError::new(
                StatusCode::NOT_FOUND,
                crate::xrpc::ErrorTag::PathNotFound,
                "failed to read file",
            ),
        }
    })?;
    Ok(BlobOutput {
        reference,
        path: blob.path,
        size: blob.size,
        is_binary: blob.is_binary,
        content: blob.content,
    })
}

pub async fn blob(
    State(state): State<SharedKnotState>,
    Query(params): Query<TreeParams>,
) -> Result<Json<BlobOutput>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    if params.path.is_empty() {
        return Err(XrpcError::invalid_request("missing path parameter"));
    }
    let kind = detect_vcs(&path).unwrap_or_default();
    let reference = match kind {
        VcsKind::Pijul => pick_channel(&path, &params.channel, &params.reference).await,
        VcsKind::Git => params.reference.clone(),
    };

    let repo = open_for_read(&path, kind, &reference).await?;
    Ok(Json(read_blob(repo.as_ref(), reference, &params.path).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub repo: String,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Serialize)]
pub struct BranchesOutput {
    pub branches: Vec<Branch>,
}

pub async fn branches(
    State(state): State<SharedKnotState>,
    Query(params): Query<ListParams>,
) -> Result<Json<BranchesOutput>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    let (offset, limit) = (params.page.offset(), params.page.limit());

    let repo: Box<dyn VcsRepo> = match detect_vcs(&path) {
        Some(VcsKind::Pijul) => Box::new(
            PijulRepo::plain_open(&path).map_err(|_| XrpcError::repo_not_found(StatusCode::NO_CONTENT))?,
        ),
        _ => Box::new(
            GitRepo::plain_open(&path).map_err(|_| XrpcError::repo_not_found(StatusCode::NO_CONTENT))?,
        ),
    };

    let branches = repo.branches(offset, limit).await.map_err(|e| {
        error!(repo = %params.repo, error = %e, "failed to list branches");
        XrpcError::internal("failed to list branches")
    })?;
    Ok(Json(BranchesOutput { branches }))
}

#[derive(Debug, Serialize)]
pub struct TagsOutput {
    pub tags: Vec<refs::TagReference>,
}

pub async fn tags(
    State(state): State<SharedKnotState>,
    Query(params): Query<ListParams>,
) -> Result<Json<TagsOutput>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    GitRepo::plain_open(&path).map_err(|_| XrpcError::repo_not_found(StatusCode::NO_CONTENT))?;

    let tags = refs::tags(&path, params.page.offset(), params.page.limit())
        .await
        .unwrap_or_else(|e| {
            warn!(repo = %params.repo, error = %e, "getting tags");
            Vec::new()
        });
    Ok(Json(TagsOutput { tags }))
}

#[derive(Debug, Default, Deserialize)]
pub struct TagParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub tag: String,
}

pub async fn tag(
    State(state): State<SharedKnotState>,
    Query(params): Query<TagParams>,
) -> Result<Json<refs::TagReference>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    if params.tag.is_empty() {
        return Err(XrpcError::invalid_request("missing name parameter"));
    }
    GitRepo::plain_open(&path).map_err(|_| XrpcError::repo_not_found(StatusCode::NO_CONTENT))?;
    Ok(Json(refs::tag(&path, &params.tag).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ArchiveParams {
    #[serde(default)]
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub prefix: String,
}

/// `refs/heads/feature/x` -> `feature-x`.
pub fn safe_ref(reference: &str) -> String {
    let short = ["refs/heads/", "refs/tags/", "refs/remotes/"]
        .iter()
        .find_map(|p| reference.strip_prefix(p))
        .unwrap_or(reference);
    short.replace('/', "-")
}

/// Archive URL pinned to a resolved revision. Query keys are sorted.
pub fn immutable_link(
    scheme: &str,
    hostname: &str,
    repo: &str,
    format: &str,
    revision: &str,
    prefix: &str,
) -> String {
    let query = [
        ("format", format),
        ("prefix", prefix),
        ("ref", revision),
        ("repo", repo),
    ]
    .iter()
    .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
    .collect::<Vec<_>>()
    .join("&");
    format!(
        "{scheme}://{hostname}/xrpc/{}?{query}",
        nsid::REPO_ARCHIVE
    )
}

/// Passes reads through and logs the first failure; once the body has
/// started there is no way to report it to the client.
struct LoggedArchive {
    inner: ArchiveStream,
    repo: String,
}

impl AsyncRead for LoggedArchive {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = this.inner.as_mut().poll_read(cx, buf);
        if let Poll::Ready(Err(e)) = &poll {
            error!(repo = %this.repo, error = %e, "writing tar file");
        }
        poll
    }
}

pub async fn archive(
    State(state): State<SharedKnotState>,
    Query(params): Query<ArchiveParams>,
) -> Result<Response, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    let format = if params.format.is_empty() {
        "tar.gz"
    } else {
        params.format.as_str()
    };
    if format != "tar.gz" {
        return Err(XrpcError::invalid_request("only tar.gz format is supported"));
    }

    let kind = detect_vcs(&path).unwrap_or_default();
    let reference = match kind {
        VcsKind::Pijul => pick_channel(&path, "", &params.reference).await,
        VcsKind::Git => params.reference.clone(),
    };
    let repo = vcs::open(&path, &reference)
        .await
        .map_err(|_| XrpcError::ref_not_found())?;

    let repo_name = params.repo.rsplit('/').next().unwrap_or_default();
    let safe = safe_ref(&reference);
    let prefix = if params.prefix.is_empty() {
        format!("{repo_name}-{safe}")
    } else {
        params.prefix.clone()
    };
    let filename = format!("{repo_name}-{safe}.tar.gz");
    let link = immutable_link(
        state.config.scheme(),
        &state.config.hostname,
        &params.repo,
        format,
        repo.revision(),
        &params.prefix,
    );

    let stream = repo.archive(&prefix).await.map_err(|e| {
        error!(repo = %params.repo, error = %e, "failed to start archive");
        XrpcError::internal("failed to create archive")
    })?;
    let body = Body::from_stream(ReaderStream::new(LoggedArchive {
        inner: stream,
        repo: params.repo.clone(),
    }));

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/gzip"));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    match HeaderValue::from_str(&format!("<{link}>; rel=\"immutable\"")) {
        Ok(value) => {
            headers.insert(header::LINK, value);
        }
        Err(e) => error!(repo = %params.repo, error = %e, "failed to build immutable link"),
    }
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
pub struct PermissionsParams {
    #[serde(default)]
    pub repo: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PermissionsOutput {
    pub mask: u32,
    pub permissions: Vec<String>,
}

pub async fn permissions(
    State(state): State<SharedKnotState>,
    actor: ActorDid,
    Query(params): Query<PermissionsParams>,
) -> Result<Json<PermissionsOutput>, XrpcError> {
    let path = state.repo_path(&params.repo)?;
    if !path.exists() {
        return Err(XrpcError::repo_not_found(StatusCode::NO_CONTENT));
    }
    if detect_vcs(&path) != Some(VcsKind::Pijul) {
        return Err(XrpcError::invalid_request(
            "permissions are only available for pijul repositories",
        ));
    }
    check_repo_format(&params.repo)
        .map_err(|_| XrpcError::invalid_request("invalid repo format, expected 'did/repoName'"))?;

    let granted = state
        .enforcer
        .permissions_in_repo(&actor.0, THIS_SERVER, &params.repo)?;
    let mask = PijulPermissions::from_actions(&granted);
    Ok(Json(PermissionsOutput {
        mask: mask.bits(),
        permissions: mask.to_strings().into_iter().map(str::to_string).collect(),
    }))
}
