use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use crate::model::User;

use super::{AdminUser, ApiError, ApiState};

pub async fn get_user(
    State(state): State<ApiState>,
    _admin: AdminUser,
    Path(login): Path<String>,
) -> Result<Json<User>, ApiError> {
    let user = state
        .store
        .user(&login)
        .map_err(ApiError::internal)?
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(user))
}

pub async fn get_users(
    State(state): State<ApiState>,
    _admin: AdminUser,
) -> Result<Json<Vec<User>>, ApiError> {
    let users = state.store.users().map_err(ApiError::internal)?;
    Ok(Json(users))
}

/// Creates a user with a generated secret. The secret is returned once,
/// here; it is never serialized again.
pub async fn save_user(
    State(state): State<ApiState>,
    _admin: AdminUser,
    body: String,
) -> Result<impl IntoResponse, ApiError> {
    let mut user: User = serde_json::from_str(&body)
        .map_err(|e| ApiError::bad_request(format!("cannot decode user: {}", e)))?;
    if user.login.is_empty() {
        return Err(ApiError::bad_request("login parameter is mandatory"));
    }

    user.secret = Uuid::new_v4().simple().to_string();
    state.store.create_user(&user).map_err(ApiError::internal)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "login": user.login,
            "secret": user.secret,
            "admin": user.admin,
        })),
    ))
}

pub async fn delete_user(
    State(state): State<ApiState>,
    _admin: AdminUser,
    Path(login): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .user(&login)
        .map_err(ApiError::internal)?
        .ok_or_else(ApiError::not_found)?;
    state.store.delete_user(&login).map_err(ApiError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_user_management_requires_admin() {
        let (router, _, _) = test_router();

        let response = router
            .oneshot(
                Request::get("/api/users")
                    .header(header::AUTHORIZATION, format!("Bearer {}", TEST_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::FORBIDDEN, response.status());
    }

    #[tokio::test]
    async fn test_save_user_returns_secret_once() {
        let (router, store, _) = test_router();

        let response = router
            .oneshot(
                Request::post("/api/user")
                    .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::from(r#"{"login": "deploy-bot"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(StatusCode::CREATED, response.status());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let secret = body["secret"].as_str().unwrap();
        assert!(!secret.is_empty());

        let saved = store.user_by_secret(secret).unwrap().unwrap();
        assert_eq!("deploy-bot", saved.login);
    }

    #[tokio::test]
    async fn test_get_and_delete_user() {
        let (router, _, _) = test_router();

        let response = router
            .clone()
            .oneshot(
                Request::get("/api/user/ci")
                    .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, response.status());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        // The stored secret never leaves through user reads.
        assert!(!String::from_utf8_lossy(&bytes).contains(TEST_TOKEN));

        let response = router
            .clone()
            .oneshot(
                Request::delete("/api/user/ci")
                    .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::NO_CONTENT, response.status());

        let response = router
            .oneshot(
                Request::get("/api/user/ci")
                    .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }
}
