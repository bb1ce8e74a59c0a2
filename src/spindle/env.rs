//! Variables injected into every workflow step, derived from the trigger.

use std::collections::BTreeMap;

use crate::types::{PipelineId, Trigger, TriggerKind, TriggerRepo};

/// Clone URL for the triggering repo. Dev mode talks plain HTTP and reaches
/// a knot on the host's loopback from inside a container.
#[must_use]
pub fn repo_url(repo: &TriggerRepo, dev: bool) -> String {
    if dev {
        let host = repo.knot.replace("localhost", "host.docker.internal");
        format!("http://{host}/{}/{}", repo.did, repo.repo)
    } else {
        format!("https://{}/{}/{}", repo.knot, repo.did, repo.repo)
    }
}

fn short_ref(git_ref: &str) -> (&str, &'static str) {
    if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (tag, "tag")
    } else if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (branch, "branch")
    } else {
        (git_ref, "branch")
    }
}

#[must_use]
pub fn pipeline_env(trigger: &Trigger, pipeline_id: &PipelineId, dev: bool) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: &str| {
        env.insert(k.to_string(), v.to_string());
    };

    set("CI", "true");
    set("TANGLED_PIPELINE_ID", &pipeline_id.at_uri().to_string());

    if let Some(repo) = &trigger.repo {
        set("TANGLED_REPO_KNOT", &repo.knot);
        set("TANGLED_REPO_DID", &repo.did);
        set("TANGLED_REPO_NAME", &repo.repo);
        set("TANGLED_REPO_DEFAULT_BRANCH", &repo.default_branch);
        set("TANGLED_REPO_URL", &repo_url(repo, dev));
    }

    match &trigger.kind {
        TriggerKind::Push(push) => {
            let (name, ref_type) = short_ref(&push.git_ref);
            set("TANGLED_REF", &push.git_ref);
            set("TANGLED_REF_NAME", name);
            set("TANGLED_REF_TYPE", ref_type);
            set("TANGLED_SHA", &push.new_sha);
            set("TANGLED_COMMIT_SHA", &push.new_sha);
        }
        TriggerKind::PullRequest(pr) => {
            set("TANGLED_REF", &format!("refs/heads/{}", pr.source_branch));
            set("TANGLED_REF_NAME", &pr.source_branch);
            set("TANGLED_REF_TYPE", "branch");
            set("TANGLED_SHA", &pr.source_sha);
            set("TANGLED_COMMIT_SHA", &pr.source_sha);

            set("TANGLED_PR_SOURCE_BRANCH", &pr.source_branch);
            set("TANGLED_PR_TARGET_BRANCH", &pr.target_branch);
            set("TANGLED_PR_SOURCE_SHA", &pr.source_sha);
            set("TANGLED_PR_ACTION", &pr.action);
        }
        TriggerKind::Manual { inputs } => {
            for input in inputs {
                set(&format!("TANGLED_INPUT_{}", input.key.to_uppercase()), &input.value);
            }
        }
    }

    env
}
