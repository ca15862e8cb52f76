//! # Domain types
//!
//! The shared vocabulary between CI, the event store, the worker and the
//! gitops repository: artifacts, manifests, deploy policies and release
//! audit records.
//!
//! Artifacts arrive as JSON from CI, manifests travel inside artifacts and
//! are re-parsed from YAML after variable resolution, releases are written
//! as `release.json` into the gitops repository.

mod artifact;
mod manifest;
mod release;

pub use artifact::{Artifact, GitEvent, Version};
pub use manifest::{Chart, Cleanup, CleanupEvent, Deploy, Manifest};
pub use release::{BranchDeletedEvent, Release, ReleaseRequest, RollbackRequest};

use regex::Regex;
use std::sync::LazyLock;

static NON_DNS_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^0-9a-z]+").expect("static regex must parse"));

/// Sanitizes a string to a valid Kubernetes resource name.
///
/// Adheres to the RFC 1123 label spec: lower case alphanumeric characters
/// or '-', starting and ending with an alphanumeric character, at most 63
/// characters long.
pub fn sanitize_dns_name(s: &str) -> String {
    let lowered = s.to_lowercase();
    let mut sanitized = NON_DNS_RUN.replace_all(&lowered, "-").into_owned();
    if sanitized.len() > 63 {
        sanitized.truncate(63);
    }
    sanitized.trim_matches('-').to_string()
}
