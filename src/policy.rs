//! # Deploy policy evaluation
//!
//! Decides whether an artifact triggers a deployment to a manifest's
//! environment, and whether a deleted branch triggers a cleanup.
//!
//! Branch and tag values in rules are matched first by exact equality,
//! then as glob patterns (`master*` matches both `master` and
//! `master-hotfix`). A rule must express the event it applies to: a
//! branch rule only matches push and pr events, a tag rule only matches
//! tag events, and an empty rule never matches.

use glob::Pattern;

use crate::dx::{Artifact, Cleanup, CleanupEvent, Deploy, GitEvent};

/// Returns true if the artifact matches the manifest's deploy rule.
pub fn deploy_triggered(artifact: &Artifact, deploy: Option<&Deploy>) -> bool {
    let Some(deploy) = deploy else {
        return false;
    };
    if deploy.branch.is_empty() && deploy.tag.is_empty() && deploy.event.is_none() {
        return false;
    }

    if !deploy.branch.is_empty()
        && !matches!(artifact.version.event, GitEvent::Push | GitEvent::Pr)
    {
        return false;
    }
    if !deploy.tag.is_empty() && artifact.version.event != GitEvent::Tag {
        return false;
    }

    if !deploy.tag.is_empty() && !matches_pattern(&deploy.tag, &artifact.version.tag) {
        return false;
    }
    if !deploy.branch.is_empty() && !matches_pattern(&deploy.branch, &artifact.version.branch) {
        return false;
    }
    if let Some(event) = deploy.event {
        if event != artifact.version.event {
            return false;
        }
    }

    true
}

/// Returns true if the deleted branch matches the manifest's cleanup rule.
pub fn cleanup_triggered(branch: &str, cleanup: Option<&Cleanup>) -> bool {
    let Some(cleanup) = cleanup else {
        return false;
    };
    if cleanup.event != CleanupEvent::BranchDeleted || cleanup.branch.is_empty() {
        return false;
    }

    matches_pattern(&cleanup.branch, branch)
}

// Exact match first, glob second.
fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == value {
        return true;
    }
    Pattern::new(pattern).is_ok_and(|p| p.matches(value))
}
