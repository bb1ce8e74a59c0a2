//! SSH forced-command guard.
//!
//! sshd runs `tangled guard --user <did>` for every key it accepts. The guard
//! parses `SSH_ORIGINAL_COMMAND`, asks the knot's internal API whether the
//! user may run it against the named repository, then replaces itself with
//! the real `git-*-pack` or `pijul protocol` process. Its stderr belongs to
//! the SSH client, so diagnostics go to a JSON log file instead.

mod command;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::vcs::secure_join;

pub use command::{GIT_COMMANDS, PIJUL_PROTOCOL, SshCommand, client_ip, parse_command, parse_pijul_protocol_args};

pub const DEFAULT_MOTD: &str = "Welcome to this knot!\n";

/// Environment variable carrying the authenticated DID into git hooks.
pub const USER_DID_ENV: &str = "GIT_USER_DID";

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("access denied: no user specified")]
    NoUser,
    #[error("Hi @{0}! You've successfully authenticated.")]
    Greeting(String),
    #[error("invalid command format")]
    InvalidFormat,
    #[error("access denied: invalid git command")]
    InvalidGitCommand,
    #[error("access denied: invalid pijul command")]
    InvalidPijulCommand,
    #[error("invalid pijul protocol args: {0}")]
    PijulArgs(&'static str),
    #[error("unsupported pijul protocol version")]
    UnsupportedPijulVersion,
    #[error("access denied: user not allowed")]
    AccessDenied,
    #[error("{0}")]
    Api(String),
    #[error("invalid repo path: {0}")]
    InvalidRepo(String),
    #[error("guard request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("command failed: {0}")]
    Exec(#[from] std::io::Error),
}

/// Flags sshd passes through the forced command.
#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub user: String,
    pub git_dir: PathBuf,
    pub log_path: PathBuf,
    pub internal_api: String,
    pub motd_file: Option<PathBuf>,
}

/// What sshd put in the environment for this session.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub original_command: String,
    pub connection: String,
}

impl Session {
    pub fn from_env() -> Self {
        Self {
            original_command: std::env::var("SSH_ORIGINAL_COMMAND").unwrap_or_default(),
            connection: std::env::var("SSH_CONNECTION").unwrap_or_default(),
        }
    }
}

/// The process the guard becomes once access is granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecPlan {
    pub program: String,
    pub args: Vec<String>,
    pub user: String,
    /// Bytes written to stderr before exec; empty for pijul.
    pub banner: Vec<u8>,
}

/// Routes tracing output to `log_path` as JSON lines.
pub fn init_logging(log_path: &Path) -> Result<(), GuardError> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    // a subscriber installed by the embedding process wins
    tracing_subscriber::fmt()
        .json()
        .with_writer(Mutex::new(file))
        .with_max_level(tracing::Level::INFO)
        .try_init()
        .ok();
    Ok(())
}

/// Asks the knot's internal API whether `user` may run `verb` on `repo`.
/// Returns the qualified `did/name` on success.
pub async fn authorize(
    client: &reqwest::Client,
    endpoint: &str,
    user: &str,
    repo: &str,
    verb: &str,
) -> Result<String, GuardError> {
    let url = format!("{}/guard", endpoint.trim_end_matches('/'));
    let response = client
        .get(&url)
        .query(&[("user", user), ("repo", repo), ("gitCmd", verb)])
        .send()
        .await?;
    let status = response.status();
    info!(url = %url, status = %status, "running guard");
    let body = response.text().await?;

    match status {
        reqwest::StatusCode::OK => Ok(body),
        reqwest::StatusCode::FORBIDDEN => {
            error!(did = user, reponame = %body, "access denied: user not allowed");
            Err(GuardError::AccessDenied)
        }
        _ => Err(GuardError::Api(body)),
    }
}

/// Contents of the MOTD file, or the default greeting when it is unset or unreadable.
pub fn motd(path: Option<&Path>) -> Vec<u8> {
    let Some(path) = path else {
        return DEFAULT_MOTD.as_bytes().to_vec();
    };
    match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to read motd file");
            }
            DEFAULT_MOTD.as_bytes().to_vec()
        }
    }
}

/// Validates the session and resolves the command to run, without executing it.
pub async fn plan(opts: &GuardOptions, session: &Session) -> Result<ExecPlan, GuardError> {
    if opts.user.is_empty() {
        return Err(GuardError::NoUser);
    }
    let client = client_ip(&session.connection);
    info!(user = %opts.user, command = %session.original_command, client = %client, "connection attempt");

    if session.original_command.trim().is_empty() {
        info!(user = %opts.user, "access denied: no interactive shells");
        return Err(GuardError::Greeting(opts.user.clone()));
    }

    let command = parse_command(&session.original_command)?;
    let http = reqwest::Client::new();
    let qualified = authorize(
        &http,
        &opts.internal_api,
        &opts.user,
        command.repo(),
        command.verb(),
    )
    .await?;

    let full_path = secure_join(&opts.git_dir, &qualified)
        .map_err(|_| GuardError::InvalidRepo(qualified.clone()))?;
    let full_path = full_path.to_string_lossy().into_owned();

    info!(
        user = %opts.user,
        command = %command.verb(),
        repo = %command.repo(),
        full_path = %full_path,
        client = %client,
        "processing command"
    );

    let plan = match command {
        SshCommand::Git { verb, .. } => {
            let mut banner = Vec::new();
            if verb == "git-upload-pack" {
                banner.push(0x02);
            }
            banner.extend(motd(opts.motd_file.as_deref()));
            ExecPlan {
                program: verb,
                args: vec![full_path],
                user: opts.user.clone(),
                banner,
            }
        }
        SshCommand::Pijul { version, .. } => {
            let mut args = vec!["protocol".to_string(), "--repository".to_string(), full_path];
            if let Some(version) = version {
                args.extend(["--version".to_string(), version]);
            }
            ExecPlan {
                program: "pijul".to_string(),
                args,
                user: opts.user.clone(),
                banner: Vec::new(),
            }
        }
    };
    Ok(plan)
}

/// Writes the banner and replaces the current process. Only returns on failure.
#[cfg(unix)]
pub fn exec(plan: &ExecPlan) -> GuardError {
    use std::os::unix::process::CommandExt;

    let mut stderr = std::io::stderr();
    if let Err(e) = stderr.write_all(&plan.banner).and_then(|()| stderr.flush()) {
        warn!(error = %e, "failed to write motd");
    }

    let err = std::process::Command::new(&plan.program)
        .args(&plan.args)
        .env(USER_DID_ENV, &plan.user)
        .exec();
    error!(program = %plan.program, error = %err, "command failed");
    GuardError::Exec(err)
}

/// Full guard run: log setup, authorization, exec.
#[cfg(unix)]
pub async fn run(opts: GuardOptions) -> Result<(), GuardError> {
    init_logging(&opts.log_path)?;
    let session = Session::from_env();
    let plan = plan(&opts, &session).await.inspect_err(|e| match e {
        GuardError::Greeting(_) => {}
        other => error!(error = %other, "guard rejected session"),
    })?;
    Err(exec(&plan))
}
