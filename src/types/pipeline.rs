use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::aturi::AtUri;
use crate::error::Error;

pub const PIPELINE_NSID: &str = "sh.tangled.pipeline";

/// A pipeline is named by the knot that emitted it and the record key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineId {
    pub knot: String,
    pub rkey: String,
}

impl PipelineId {
    #[must_use]
    pub fn new(knot: &str, rkey: &str) -> Self {
        Self {
            knot: knot.to_string(),
            rkey: rkey.to_string(),
        }
    }

    #[must_use]
    pub fn at_uri(&self) -> AtUri {
        AtUri::new(&format!("did:web:{}", self.knot), PIPELINE_NSID, &self.rkey)
    }

    /// Inverse of [`PipelineId::at_uri`]; tolerates authorities without the `did:web:` prefix.
    #[must_use]
    pub fn from_at_uri(uri: &AtUri) -> Self {
        let knot = uri.authority().strip_prefix("did:web:").unwrap_or(uri.authority());
        Self::new(knot, uri.rkey())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId {
    pub pipeline_id: PipelineId,
    pub name: String,
}

impl WorkflowId {
    #[must_use]
    pub fn new(pipeline_id: PipelineId, name: &str) -> Self {
        Self {
            pipeline_id,
            name: name.to_string(),
        }
    }
}

/// Flat, filesystem-safe form used for log file names: `<knot>-<rkey>-<name>`.
impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let safe = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
                .collect()
        };
        write!(
            f,
            "{}-{}-{}",
            safe(&self.pipeline_id.knot),
            safe(&self.pipeline_id.rkey),
            safe(&self.name)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Failed,
    Timeout,
    Cancelled,
    Success,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Success => "success",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Timeout | Self::Cancelled | Self::Success
        )
    }

    /// `pending → running → terminal`. Cancelling a workflow that never
    /// started is allowed; nothing leaves a terminal state.
    #[must_use]
    pub fn can_transition_to(self, next: Status) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "success" => Ok(Self::Success),
            other => Err(Error::BadRequest(format!("unknown status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRepo {
    pub knot: String,
    pub did: String,
    pub repo: String,
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTrigger {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub new_sha: String,
    #[serde(default)]
    pub old_sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestTrigger {
    pub source_branch: String,
    pub target_branch: String,
    pub source_sha: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualInput {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    Push(PushTrigger),
    PullRequest(PullRequestTrigger),
    Manual {
        #[serde(default)]
        inputs: Vec<ManualInput>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<TriggerRepo>,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

/// A pipeline as recorded by the spindle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub knot: String,
    pub rkey: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub sha: String,
    pub created: DateTime<Utc>,
    pub trigger: Option<Trigger>,
}

impl Pipeline {
    #[must_use]
    pub fn id(&self) -> PipelineId {
        PipelineId::new(&self.knot, &self.rkey)
    }

    #[must_use]
    pub fn did_slash_repo(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: WorkflowId,
    pub status: Status,
    pub error: Option<String>,
    pub exit_code: i64,
    pub updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_at_uri_roundtrip() {
        let id = PipelineId::new("knot.example.com", "3kxyz");
        let uri = id.at_uri();
        assert_eq!(uri.to_string(), "at://did:web:knot.example.com/sh.tangled.pipeline/3kxyz");
        assert_eq!(PipelineId::from_at_uri(&uri), id);
    }

    #[test]
    fn test_workflow_id_is_filename_safe() {
        let wid = WorkflowId::new(PipelineId::new("localhost:5555", "abc"), "build/test");
        assert_eq!(wid.to_string(), "localhost-5555-abc-build-test");
    }

    #[test]
    fn test_status_progression() {
        use Status::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Timeout));
        assert!(!Pending.can_transition_to(Success));
        for terminal in [Failed, Timeout, Cancelled, Success] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
            assert!(!terminal.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_trigger_json_shape() {
        let raw = r#"{"kind":"push","ref":"refs/heads/main","new_sha":"abc","repo":{"knot":"k","did":"did:plc:a","repo":"r"}}"#;
        let trigger: Trigger = serde_json::from_str(raw).unwrap();
        assert!(matches!(trigger.kind, TriggerKind::Push(ref p) if p.git_ref == "refs/heads/main"));
        assert_eq!(trigger.repo.unwrap().default_branch, "");
    }
}
