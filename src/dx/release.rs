use serde::{Deserialize, Serialize};

use super::{Manifest, Version};

/// Release contains all metadata about a successful write to the gitops
/// repository. Serialized as `release.json` next to the rendered
/// manifests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub app: String,
    pub env: String,

    pub artifact_id: String,
    pub triggered_by: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default)]
    pub gitops_ref: String,
    #[serde(default)]
    pub gitops_repo: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rolled_back: bool,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub created: i64,
}

fn is_false(v: &bool) -> bool {
    !(*v)
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Request to deploy an existing artifact to an environment. With `app`
/// omitted every manifest of the artifact matching the environment is
/// deployed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default)]
    pub artifact_id: String,
    #[serde(default)]
    pub triggered_by: String,
}

/// Request to roll an (env, app) pair back to the state of a given
/// gitops commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub env: String,
    pub app: String,
    #[serde(rename = "targetSHA")]
    pub target_sha: String,
    #[serde(default)]
    pub triggered_by: String,
}

/// Emitted by the branch-deletion watcher; carries the manifests found on
/// the deleted branch so cleanup rules can be evaluated without the
/// branch still existing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchDeletedEvent {
    #[serde(default)]
    pub manifests: Vec<Manifest>,
    pub branch: String,
}
