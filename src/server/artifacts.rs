use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::dx::Artifact;
use crate::model::Event;
use crate::store::ArtifactsQuery;

use super::{ApiError, ApiState, AuthenticatedUser};

/// Ingests a CI artifact. The id is assigned here and equals the id of
/// the event that carries the artifact through the worker.
pub async fn save_artifact(
    State(state): State<ApiState>,
    _user: AuthenticatedUser,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let mut artifact: Artifact = serde_json::from_str(&body)
        .map_err(|e| ApiError::bad_request(format!("cannot decode artifact: {}", e)))?;

    artifact.id = format!(
        "{}-{}",
        artifact.version.repository_name.replace('/', "-"),
        Uuid::new_v4()
    );
    artifact.created = Utc::now().timestamp();

    let mut event =
        Event::from_artifact(&artifact).map_err(ApiError::internal)?;
    event.id = artifact.id.clone();

    let saved = state.store.create_event(event).map_err(ApiError::internal)?;
    let mut saved_artifact = saved.as_artifact().map_err(ApiError::internal)?;
    saved_artifact.created = saved.created;

    Ok((StatusCode::CREATED, Json(saved_artifact)))
}

/// Lists stored artifacts with the denormalized-column filters. Returns
/// an empty array, never null.
pub async fn get_artifacts(
    State(state): State<ApiState>,
    _user: AuthenticatedUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    let mut query = ArtifactsQuery::default();

    if let Some(app) = params.get("app") {
        query.repository = app.clone();
    }
    if let Some(branch) = params.get("branch") {
        query.branch = branch.clone();
    }
    if let Some(source_branch) = params.get("sourceBranch") {
        query.source_branch = source_branch.clone();
    }
    if let Some(event) = params.get("event") {
        query.event = Some(
            event
                .parse()
                .map_err(|_| ApiError::bad_request(format!("invalid event: {}", event)))?,
        );
    }
    if let Some(sha) = params.get("sha") {
        query.sha = vec![sha.clone()];
    }
    if let Some(limit) = params.get("limit") {
        query.limit = limit
            .parse()
            .map_err(|e| ApiError::bad_request(format!("invalid limit: {}", e)))?;
    }
    if let Some(offset) = params.get("offset") {
        query.offset = offset
            .parse()
            .map_err(|e| ApiError::bad_request(format!("invalid offset: {}", e)))?;
    }
    if let Some(since) = params.get("since") {
        query.since = Some(parse_rfc3339(since)?);
    }
    if let Some(until) = params.get("until") {
        query.until = Some(parse_rfc3339(until)?);
    }

    let events = state.store.artifacts(&query).map_err(ApiError::internal)?;

    let mut artifacts = Vec::with_capacity(events.len());
    for event in events {
        let mut artifact = event.as_artifact().map_err(ApiError::internal)?;
        artifact.created = event.created;
        artifacts.push(artifact);
    }

    Ok(Json(artifacts))
}

pub(super) fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::bad_request(format!("invalid time: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_save_artifact_assigns_id() {
        let (router, store, _) = test_router();

        let response = router
            .oneshot(
                Request::post("/api/artifact")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"version": {"repositoryName": "acme/my-app", "branch": "master", "event": "push", "sha": "ea9ab7cc"}}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::CREATED, response.status());
        let saved = body_json(response).await;
        let id = saved["id"].as_str().unwrap();
        assert!(id.starts_with("acme-my-app-"));
        assert!(saved["created"].as_i64().unwrap() > 0);

        let event = store.artifact(id).unwrap().unwrap();
        assert_eq!(id, event.id, "artifact id equals its creating event id");
    }

    #[tokio::test]
    async fn test_save_artifact_rejects_malformed_json() {
        let (router, _, _) = test_router();

        let response = router
            .oneshot(
                Request::post("/api/artifact")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn test_get_artifacts_returns_empty_array() {
        let (router, _, _) = test_router();

        let response = router
            .oneshot(
                Request::get("/api/artifacts")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, response.status());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!("[]", String::from_utf8_lossy(&bytes));
    }

    #[tokio::test]
    async fn test_get_artifacts_rejects_bad_time() {
        let (router, _, _) = test_router();

        let response = router
            .oneshot(
                Request::get("/api/artifacts?since=yesterday")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::BAD_REQUEST, response.status());
    }

    #[tokio::test]
    async fn test_endpoints_require_auth() {
        let (router, _, _) = test_router();

        let response = router
            .oneshot(
                Request::get("/api/artifacts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::UNAUTHORIZED, response.status());
    }
}
