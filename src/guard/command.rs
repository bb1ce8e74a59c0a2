use super::GuardError;

/// The git verbs a client may run over SSH.
pub const GIT_COMMANDS: &[&str] = &["git-receive-pack", "git-upload-pack", "git-upload-archive"];

/// Verb sent to the knot's guard API for pijul sessions.
pub const PIJUL_PROTOCOL: &str = "pijul-protocol";

/// A parsed `SSH_ORIGINAL_COMMAND`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshCommand {
    Git { verb: String, repo: String },
    Pijul { repo: String, version: Option<String> },
}

impl SshCommand {
    /// Verb reported to the guard API.
    pub fn verb(&self) -> &str {
        match self {
            SshCommand::Git { verb, .. } => verb,
            SshCommand::Pijul { .. } => PIJUL_PROTOCOL,
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            SshCommand::Git { repo, .. } | SshCommand::Pijul { repo, .. } => repo,
        }
    }
}

pub fn parse_command(command: &str) -> Result<SshCommand, GuardError> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(GuardError::InvalidFormat);
    }

    if parts[0] == "pijul" {
        if parts[1] != "protocol" {
            return Err(GuardError::InvalidPijulCommand);
        }
        let (repo, version) = parse_pijul_protocol_args(&parts[2..])?;
        if version.as_deref().is_some_and(|v| v != "3") {
            return Err(GuardError::UnsupportedPijulVersion);
        }
        return Ok(SshCommand::Pijul { repo, version });
    }

    if !GIT_COMMANDS.contains(&parts[0]) {
        return Err(GuardError::InvalidGitCommand);
    }
    Ok(SshCommand::Git {
        verb: parts[0].to_string(),
        repo: parts[1].to_string(),
    })
}

/// Extracts `--repository`/`-r` and `--version` from `pijul protocol` args.
pub fn parse_pijul_protocol_args(args: &[&str]) -> Result<(String, Option<String>), GuardError> {
    let mut repo = String::new();
    let mut version = None;
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match *arg {
            "--repository" | "-r" => {
                repo = iter
                    .next()
                    .ok_or(GuardError::PijulArgs("missing --repository value"))?
                    .to_string();
            }
            "--version" => {
                version = Some(
                    iter.next()
                        .ok_or(GuardError::PijulArgs("missing --version value"))?
                        .to_string(),
                );
            }
            other => {
                if let Some(r) = other.strip_prefix("--repository=") {
                    repo = r.to_string();
                } else if let Some(v) = other.strip_prefix("--version=") {
                    version = Some(v.to_string());
                }
            }
        }
    }

    if repo.is_empty() {
        return Err(GuardError::PijulArgs("missing --repository"));
    }
    Ok((repo, version.filter(|v| !v.is_empty())))
}

/// Client IP from `SSH_CONNECTION` (`client_ip client_port server_ip server_port`).
pub fn client_ip(ssh_connection: &str) -> String {
    ssh_connection
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}
