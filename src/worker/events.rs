use crate::dx::{Artifact, Manifest, RollbackRequest};

/// Outcome of one gitops write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

/// One manifest's deploy attempt, successful or not. Deploy attempts
/// are independent across the manifests of an artifact.
#[derive(Debug, Clone)]
pub struct DeployEvent {
    pub manifest: Manifest,
    pub artifact: Artifact,
    pub triggered_by: String,

    pub status: Status,
    pub status_desc: String,

    pub gitops_ref: String,
    pub gitops_repo: String,
}

/// Outcome of a rollback request, with every revert commit it produced.
#[derive(Debug, Clone)]
pub struct RollbackEvent {
    pub rollback_request: RollbackRequest,
    pub gitops_refs: Vec<String>,
    pub gitops_repo: String,

    pub status: Status,
    pub status_desc: String,
}

/// A policy-based cleanup after a source branch was deleted.
#[derive(Debug, Clone)]
pub struct DeleteEvent {
    pub env: String,
    pub app: String,
    pub branch: String,
    pub gitops_ref: Option<String>,
    pub gitops_repo: String,
}
