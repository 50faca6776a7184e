use anyhow::Context;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use taskdeck_db::models::orgs::Organization;

use crate::AppState;
use crate::auth;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct MergeRequest {
    pub source_organization_id: i64,
    pub target_organization_id: i64,
}

#[derive(Serialize)]
pub struct MergeResponse {
    pub success: bool,
    pub merge_event_id: i64,
}

pub async fn merge_organizations(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> Result<Json<MergeResponse>, ApiError> {
    let Json(req) = payload?;
    let actor = auth::resolve_actor(&state.pool, &headers)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let event_id = state
        .merge_service
        .merge(req.source_organization_id, req.target_organization_id, actor)
        .await?;
    Ok(Json(MergeResponse {
        success: true,
        merge_event_id: event_id,
    }))
}

pub async fn revert_merge(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let actor = auth::resolve_actor(&state.pool, &headers)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    state.merge_service.revert(event_id, actor).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn list_organizations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Organization>>, ApiError> {
    let actor = auth::resolve_actor(&state.pool, &headers)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    let orgs: Vec<Organization> = sqlx::query_as(
        "SELECT o.* FROM organizations o
         JOIN user_organizations uo ON uo.organization_id = o.id
         WHERE uo.user_id = $1
         ORDER BY o.display_order, o.id",
    )
    .bind(actor)
    .fetch_all(&state.pool)
    .await
    .context("Failed to list organizations")?;
    Ok(Json(orgs))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use sqlx::postgres::PgPoolOptions;
    use tower::ServiceExt;

    use taskdeck_db::store::{MemStore, Store};

    use crate::AppState;
    use crate::services::merge_service::MergeService;

    fn test_app() -> axum::Router {
        // The body is rejected before any query runs, so a lazy pool that
        // never connects is enough.
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://127.0.0.1:1/taskdeck")
            .unwrap();
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let state = AppState {
            pool,
            merge_service: MergeService::new(store),
        };
        crate::router(state)
    }

    #[tokio::test]
    async fn malformed_merge_body_gets_json_error_envelope() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/orgs/merge")
                    .header("Content-Type", "application/json")
                    .header("Authorization", "Bearer sometoken")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], serde_json::Value::Bool(false));
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn non_json_merge_body_gets_json_error_envelope() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/orgs/merge")
                    .header("Content-Type", "text/plain")
                    .header("Authorization", "Bearer sometoken")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], serde_json::Value::Bool(false));
    }
}
