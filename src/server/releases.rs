use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::collections::{BTreeMap, HashMap};

use crate::dx::{Release, ReleaseRequest, RollbackRequest};
use crate::git::gitops;
use crate::model::{Event, EventType};

use super::artifacts::parse_rfc3339;
use super::{ApiError, ApiState, AuthenticatedUser};

/// Accepts a release request and hands it to the worker as an event.
/// Responds with the event id for tracking.
pub async fn release(
    State(state): State<ApiState>,
    AuthenticatedUser(user): AuthenticatedUser,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let request: ReleaseRequest = serde_json::from_str(&body)
        .map_err(|e| ApiError::bad_request(format!("cannot decode release request: {}", e)))?;

    if request.env.is_empty() {
        return Err(ApiError::bad_request("env parameter is mandatory"));
    }
    if request.artifact_id.is_empty() {
        return Err(ApiError::bad_request("artifact parameter is mandatory"));
    }

    let artifact_event = state
        .store
        .artifact(&request.artifact_id)
        .map_err(ApiError::internal)?
        .ok_or_else(ApiError::not_found)?;

    let blob = serde_json::to_string(&ReleaseRequest {
        env: request.env,
        app: request.app,
        artifact_id: request.artifact_id,
        triggered_by: user.login,
    })
    .map_err(ApiError::internal)?;

    let event = state
        .store
        .create_event(Event {
            id: String::new(),
            created: 0,
            event_type: EventType::Release,
            blob,
            status: String::new(),
            status_desc: String::new(),
            repository: artifact_event.repository,
            branch: String::new(),
            event: None,
            source_branch: String::new(),
            target_branch: String::new(),
            tag: String::new(),
            sha: String::new(),
            artifact_id: String::new(),
            gitops_hashes: Vec::new(),
        })
        .map_err(ApiError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": event.id })),
    ))
}

/// Accepts a rollback request (env, app and target sha are query
/// parameters) and responds with the tracking event id.
pub async fn rollback(
    State(state): State<ApiState>,
    AuthenticatedUser(user): AuthenticatedUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let env = required_param(&params, "env")?;
    let app = required_param(&params, "app")?;
    let sha = required_param(&params, "sha")?;

    let blob = serde_json::to_string(&RollbackRequest {
        env,
        app,
        target_sha: sha,
        triggered_by: user.login,
    })
    .map_err(ApiError::internal)?;

    let event = state
        .store
        .create_event(Event {
            id: String::new(),
            created: 0,
            event_type: EventType::Rollback,
            blob,
            status: String::new(),
            status_desc: String::new(),
            repository: String::new(),
            branch: String::new(),
            event: None,
            source_branch: String::new(),
            target_branch: String::new(),
            tag: String::new(),
            sha: String::new(),
            artifact_id: String::new(),
            gitops_hashes: Vec::new(),
        })
        .map_err(ApiError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": event.id })),
    ))
}

/// Release history of an environment, read from the gitops repository
/// cache.
pub async fn get_releases(
    State(state): State<ApiState>,
    _user: AuthenticatedUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Release>>, ApiError> {
    let env = required_param(&params, "env")?;
    let app = params.get("app").cloned();
    let git_repo = params.get("git-repo").cloned();

    let limit = match params.get("limit") {
        Some(limit) => limit
            .parse()
            .map_err(|e| ApiError::bad_request(format!("invalid limit: {}", e)))?,
        None => 10,
    };
    let since = params.get("since").map(|s| parse_rfc3339(s)).transpose()?;
    let until = params.get("until").map(|u| parse_rfc3339(u)).transpose()?;

    let repo_cache = state
        .repo_cache
        .as_ref()
        .ok_or_else(|| ApiError::internal("gitops repo is not configured"))?;
    let snapshot = repo_cache.snapshot_for_read();

    let mut releases = gitops::releases(
        &snapshot.repo(),
        &env,
        app.as_deref(),
        git_repo.as_deref(),
        since,
        until,
        limit,
    )
    .map_err(ApiError::internal)?;

    for release in &mut releases {
        release.gitops_repo = state.gitops_repo.clone();
    }

    Ok(Json(releases))
}

/// The current release of every app in an environment.
pub async fn get_status(
    State(state): State<ApiState>,
    _user: AuthenticatedUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<BTreeMap<String, Release>>, ApiError> {
    let env = required_param(&params, "env")?;
    let app = params.get("app").cloned();

    let repo_cache = state
        .repo_cache
        .as_ref()
        .ok_or_else(|| ApiError::internal("gitops repo is not configured"))?;
    let snapshot = repo_cache.snapshot_for_read();

    let mut releases =
        gitops::status(snapshot.path(), &env, app.as_deref()).map_err(ApiError::internal)?;

    for release in releases.values_mut() {
        release.gitops_repo = state.gitops_repo.clone();
    }

    Ok(Json(releases))
}

/// Processing status of a release or rollback request by its tracking
/// event id.
pub async fn track(
    State(state): State<ApiState>,
    _user: AuthenticatedUser,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = required_param(&params, "id")?;

    let event = state
        .store
        .event(&id)
        .map_err(ApiError::internal)?
        .ok_or_else(ApiError::not_found)?;

    Ok(Json(serde_json::json!({
        "status": event.status,
        "desc": event.status_desc,
    })))
}

fn required_param(params: &HashMap<String, String>, name: &str) -> Result<String, ApiError> {
    params
        .get(name)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| ApiError::bad_request(format!("{} parameter is mandatory", name)))
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use crate::dx::{Artifact, Version};
    use crate::model::Event;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_release_request_creates_tracking_event() {
        let (router, store, _) = test_router();

        let artifact = Artifact {
            id: "my-app-1".to_string(),
            version: Version {
                repository_name: "acme/my-app".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut event = Event::from_artifact(&artifact).unwrap();
        event.id = artifact.id.clone();
        store.create_event(event).unwrap();

        let response = router
            .oneshot(
                Request::post("/api/releases")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::from(
                        r#"{"env": "staging", "artifactId": "my-app-1"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::CREATED, response.status());
        let body = body_json(response).await;
        let id = body["id"].as_str().unwrap();

        let tracking = store.event(id).unwrap().unwrap();
        assert_eq!("new", tracking.status);
        // triggeredBy is stamped from the authenticated user.
        assert!(tracking.blob.contains(r#""triggeredBy":"ci""#));
    }

    #[tokio::test]
    async fn test_release_request_validations() {
        let (router, _, _) = test_router();

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/releases")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::from(r#"{"artifactId": "my-app-1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, response.status());

        let response = router
            .oneshot(
                Request::post("/api/releases")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::from(
                        r#"{"env": "staging", "artifactId": "unknown"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn test_rollback_requires_parameters() {
        let (router, _, _) = test_router();

        let response = router
            .clone()
            .oneshot(
                Request::post("/api/rollback?env=staging&app=my-app")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, response.status());

        let response = router
            .oneshot(
                Request::post("/api/rollback?env=staging&app=my-app&sha=abc123")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::CREATED, response.status());
    }

    #[tokio::test]
    async fn test_track_unknown_id_is_not_found() {
        let (router, _, _) = test_router();

        let response = router
            .oneshot(
                Request::get("/api/track?id=unknown")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn test_track_reports_event_status() {
        let (router, store, _) = test_router();

        let artifact = Artifact {
            id: "my-app-1".to_string(),
            ..Default::default()
        };
        let mut event = Event::from_artifact(&artifact).unwrap();
        event.id = artifact.id.clone();
        let saved = store.create_event(event).unwrap();
        store
            .update_event_status(&saved.id, "processed", "", &["abc".to_string()])
            .unwrap();

        let response = router
            .oneshot(
                Request::get(format!("/api/track?id={}", saved.id).as_str())
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::OK, response.status());
        let body = body_json(response).await;
        assert_eq!("processed", body["status"]);
    }
}
