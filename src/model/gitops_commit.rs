use serde::{Deserialize, Serialize};

pub const PROGRESSING: &str = "Progressing";
pub const RECONCILIATION_SUCCEEDED: &str = "ReconciliationSucceeded";
pub const VALIDATION_FAILED: &str = "ValidationFailed";
pub const RECONCILIATION_FAILED: &str = "ReconciliationFailed";
pub const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";

/// Reconciler status of one gitops commit, keyed by commit SHA.
/// Later callbacks for the same SHA overwrite status and description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitopsCommit {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub sha: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_desc: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}
