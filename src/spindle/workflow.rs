//! Workflow definitions read from `.tangled/workflows/*.yml` in a repository.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Trigger, TriggerKind};

pub const WORKFLOW_DIR: &str = ".tangled/workflows";

fn default_engine() -> String {
    "process".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// One `when` entry. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub event: Vec<String>,
    #[serde(default)]
    pub branch: Vec<String>,
}

impl Constraint {
    fn matches(&self, trigger: &Trigger) -> bool {
        let (event, branch) = match &trigger.kind {
            TriggerKind::Push(push) => (
                "push",
                push.git_ref.strip_prefix("refs/heads/").map(str::to_string),
            ),
            TriggerKind::PullRequest(pr) => ("pull_request", Some(pr.target_branch.clone())),
            TriggerKind::Manual { .. } => ("manual", None),
        };

        if !self.event.is_empty() && !self.event.iter().any(|e| e == event) {
            return false;
        }
        if self.branch.is_empty() {
            return true;
        }
        let Some(branch) = branch else {
            return false;
        };
        self.branch.iter().any(|pattern| match glob::Pattern::new(pattern) {
            Ok(p) => p.matches(&branch),
            Err(e) => {
                warn!(pattern, error = %e, "invalid branch pattern");
                false
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub when: Vec<Constraint>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Parses a definition; `name` is used when the file does not set one.
    pub fn parse(name: &str, raw: &str) -> Result<Self> {
        let mut workflow: Workflow = serde_yaml::from_str(raw)
            .map_err(|e| Error::BadRequest(format!("workflow {name}: {e}")))?;
        if workflow.name.is_empty() {
            workflow.name = name.to_string();
        }
        if workflow.steps.is_empty() {
            return Err(Error::BadRequest(format!("workflow {name}: no steps")));
        }
        Ok(workflow)
    }

    /// Workflows with no `when` run for every trigger.
    #[must_use]
    pub fn matches(&self, trigger: &Trigger) -> bool {
        self.when.is_empty() || self.when.iter().any(|c| c.matches(trigger))
    }
}

/// Loads every `*.yml`/`*.yaml` under `<repo_dir>/.tangled/workflows`, sorted by file name.
pub fn discover(repo_dir: &Path) -> Result<Vec<Workflow>> {
    let dir = repo_dir.join(WORKFLOW_DIR);
    let mut paths = Vec::new();
    for ext in ["yml", "yaml"] {
        let pattern = format!("{}/*.{ext}", dir.display());
        let entries =
            glob::glob(&pattern).map_err(|e| Error::Config(format!("{pattern}: {e}")))?;
        paths.extend(entries.filter_map(std::result::Result::ok));
    }
    paths.sort();

    let mut workflows = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let raw = std::fs::read_to_string(&path)?;
        debug!(workflow = %name, "loaded workflow");
        workflows.push(Workflow::parse(&name, &raw)?);
    }
    Ok(workflows)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::types::{PullRequestTrigger, PushTrigger};

    const BUILD: &str = r#"
when:
  - event: ["push"]
    branch: ["main", "release/*"]
  - event: ["pull_request"]
environment:
  RUST_LOG: debug
steps:
  - name: build
    command: cargo build
  - name: test
    command: cargo test
    environment:
      RUST_BACKTRACE: "1"
"#;

    fn push(git_ref: &str) -> Trigger {
        Trigger {
            repo: None,
            kind: TriggerKind::Push(PushTrigger {
                git_ref: git_ref.to_string(),
                new_sha: "abc".to_string(),
                old_sha: String::new(),
            }),
        }
    }

    #[test]
    fn test_parse_defaults() {
        let wf = Workflow::parse("build.yml", BUILD).unwrap();
        assert_eq!(wf.name, "build.yml");
        assert_eq!(wf.engine, "process");
        assert_eq!(wf.steps.len(), 2);
        assert_eq!(wf.steps[1].environment["RUST_BACKTRACE"], "1");
        assert_eq!(wf.environment["RUST_LOG"], "debug");

        assert!(Workflow::parse("empty.yml", "name: empty\n").is_err());
        assert!(Workflow::parse("bad.yml", "steps: [").is_err());
    }

    #[test]
    fn test_when_constraints() {
        let wf = Workflow::parse("build.yml", BUILD).unwrap();
        assert!(wf.matches(&push("refs/heads/main")));
        assert!(wf.matches(&push("refs/heads/release/1.0")));
        assert!(!wf.matches(&push("refs/heads/feature")));
        assert!(!wf.matches(&push("refs/tags/v1")));

        let pr = Trigger {
            repo: None,
            kind: TriggerKind::PullRequest(PullRequestTrigger {
                source_branch: "feature".to_string(),
                target_branch: "main".to_string(),
                source_sha: "abc".to_string(),
                action: "opened".to_string(),
            }),
        };
        assert!(wf.matches(&pr));

        let manual = Trigger {
            repo: None,
            kind: TriggerKind::Manual { inputs: Vec::new() },
        };
        assert!(!wf.matches(&manual));

        let always = Workflow::parse("a.yml", "steps:\n  - name: x\n    command: 'true'\n").unwrap();
        assert!(always.matches(&manual));
    }

    #[test]
    fn test_discover_sorted() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(WORKFLOW_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("b.yml"), "steps:\n  - name: b\n    command: 'true'\n").unwrap();
        std::fs::write(dir.join("a.yaml"), "steps:\n  - name: a\n    command: 'true'\n").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let workflows = discover(temp.path()).unwrap();
        let names: Vec<_> = workflows.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["a.yaml", "b.yml"]);

        let empty = TempDir::new().unwrap();
        assert!(discover(empty.path()).unwrap().is_empty());
    }
}
