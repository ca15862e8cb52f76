use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::model::{GitopsCommit, RECONCILIATION_FAILED, VALIDATION_FAILED};
use crate::notifications::Message;

use super::{ApiError, ApiState, AuthenticatedUser};

/// Status callback from the reconciler, in the shape flux's notification
/// controller emits.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FluxEvent {
    pub severity: String,
    pub message: String,
    pub reason: String,
    pub metadata: HashMap<String, String>,
    pub reporting_controller: String,
    pub reporting_instance: String,
}

// Lines of a successful (dry-run) apply; everything else in the message
// is the useful error.
static CLEAN_APPLY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+ (created|configured|unchanged)( \(dry run\))?$")
        .expect("static regex must parse")
});

/// Accepts reconciler feedback: upserts the gitops commit status record
/// and fans a notification out.
pub async fn flux_event(
    State(state): State<ApiState>,
    _user: AuthenticatedUser,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let event: FluxEvent = serde_json::from_str(&body)
        .map_err(|e| ApiError::bad_request(format!("cannot decode flux event: {}", e)))?;

    // Commit-status updates echo state this service wrote; ignore them.
    if event.metadata.contains_key("commit_status") {
        return Ok(StatusCode::OK);
    }

    let Some(revision) = event.metadata.get("revision") else {
        return Err(ApiError::bad_request("revision metadata is mandatory"));
    };
    let sha = parse_revision_sha(revision);

    let status_desc = match event.reason.as_str() {
        VALIDATION_FAILED | RECONCILIATION_FAILED => filter_reconcile_message(&event.message),
        _ => event.message.clone(),
    };

    let gitops_commit = GitopsCommit {
        sha: sha.to_string(),
        status: event.reason.clone(),
        status_desc,
        ..Default::default()
    };
    state
        .store
        .save_or_update_gitops_commit(&gitops_commit)
        .map_err(ApiError::internal)?;

    let env = params.get("env").cloned().unwrap_or_default();
    state.notifications.broadcast(Message::flux(
        gitops_commit,
        state.gitops_repo.clone(),
        env,
    ));

    Ok(StatusCode::OK)
}

/// The commit sha out of a `<branch>/<sha>` revision reference.
fn parse_revision_sha(revision: &str) -> &str {
    revision.rsplit('/').next().unwrap_or(revision)
}

/// Drops the clean apply lines from a reconciler error message, keeping
/// only the lines worth reading.
pub fn filter_reconcile_message(message: &str) -> String {
    let kept: Vec<&str> = message
        .lines()
        .filter(|line| !CLEAN_APPLY_LINE.is_match(line.trim_end()))
        .filter(|line| !line.trim().is_empty())
        .collect();

    if kept.is_empty() {
        return String::new();
    }
    format!("{}\n", kept.join("\n"))
}
