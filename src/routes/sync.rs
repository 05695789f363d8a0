//! Sync API endpoints
//!
//! Provides the upload / download / status endpoints used by offline-capable
//! clients, and the conflict review endpoints.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};

use super::caller_id;
use crate::error::Result;
use crate::state::AppState;
use crate::sync::{
    DownloadQuery, DownloadResponse, ResolveConflictRequest, ResolveConflictResponse,
    StatusQuery, StatusResponse, SyncConflict, UploadRequest, UploadResponse,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload))
        .route("/download", get(download))
        .route("/status", get(status))
        .route("/conflicts", get(list_conflicts))
        .route("/conflicts/:id", get(get_conflict))
        .route("/resolve-conflict", post(resolve_conflict))
}

/// Submit queued offline actions
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UploadRequest>,
) -> Result<Json<UploadResponse>> {
    let user_id = caller_id(&headers)?;
    let response = state.sync().upload(&user_id, req).await?;
    Ok(Json(response))
}

/// Fetch changes since the device's last download
async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadResponse>> {
    let user_id = caller_id(&headers)?;
    let response = state.sync().download(&user_id, query).await?;
    Ok(Json(response))
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>> {
    let user_id = caller_id(&headers)?;
    let response = state.sync().status(&user_id, &query.device_id).await?;
    Ok(Json(response))
}

/// Unresolved conflicts raised by the caller's actions
async fn list_conflicts(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<SyncConflict>>> {
    let user_id = caller_id(&headers)?;
    let conflicts = state.sync().list_conflicts(&user_id).await?;
    Ok(Json(conflicts))
}

async fn get_conflict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SyncConflict>> {
    caller_id(&headers)?;
    let conflict = state.sync().get_conflict(&id).await?;
    Ok(Json(conflict))
}

/// Settle a conflict on a reviewer's decision
async fn resolve_conflict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResolveConflictRequest>,
) -> Result<Json<ResolveConflictResponse>> {
    let reviewer_id = caller_id(&headers)?;
    let response = state.sync().resolve_conflict(&reviewer_id, req).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::db::test_pool;
    use crate::routes::{app, USER_ID_HEADER};
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn test_app() -> Router {
        app(AppState::new(Config::default(), test_pool().await))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(USER_ID_HEADER, user)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str, user: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(USER_ID_HEADER, user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn create_report(client_id: &str) -> Value {
        json!({
            "device_id": "device-a",
            "actions": [{
                "client_id": client_id,
                "action_type": "create_entity",
                "entity_type": "report",
                "timestamp": "2024-05-01T09:00:00Z",
                "payload": {"title": "Broken streetlight", "latitude": 40.4, "longitude": -3.7}
            }]
        })
    }

    #[tokio::test]
    async fn test_missing_caller_is_unauthorized() {
        let app = test_app().await;
        let request = Request::builder()
            .method("POST")
            .uri("/sync/upload")
            .header("content-type", "application/json")
            .body(Body::from(create_report("u1").to_string()))
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let app = test_app().await;

        let (status, body) = send(&app, post("/sync/upload", "user-1", create_report("u1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["results"][0]["client_id"], "u1");
        assert_eq!(body["results"][0]["status"], "success");
        let server_id = body["results"][0]["server_id"].as_i64().unwrap();

        let (status, body) =
            send(&app, get("/sync/download?device_id=device-b", "user-2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_more"], false);
        assert!(body.get("next_cursor").is_none());
        let reports = body["data"]["report"].as_array().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["id"], server_id);
        assert_eq!(reports[0]["version"], 1);
        assert_eq!(reports[0]["deleted"], false);
        assert_eq!(body["data"]["task"], json!([]));
        assert_eq!(body["data"]["profile"], json!([]));
    }

    #[tokio::test]
    async fn test_download_paging_with_since() {
        let app = test_app().await;
        send(&app, post("/sync/upload", "user-1", create_report("u1"))).await;
        send(&app, post("/sync/upload", "user-1", create_report("u2"))).await;

        let (_, first) = send(
            &app,
            get("/sync/download?device_id=device-a&page_size=1&since=2000-01-01T00:00:00Z", "user-1"),
        )
        .await;
        assert_eq!(first["has_more"], true);
        let cursor = first["next_cursor"].as_str().unwrap().to_string();

        let (status, second) = send(
            &app,
            get(
                &format!("/sync/download?device_id=device-a&page_size=1&cursor={}", cursor),
                "user-1",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["has_more"], false);
        assert_ne!(first["data"]["report"][0]["id"], second["data"]["report"][0]["id"]);
    }

    #[tokio::test]
    async fn test_malformed_cursor_is_bad_request() {
        let app = test_app().await;
        let (status, body) =
            send(&app, get("/sync/download?device_id=device-a&cursor=nope", "user-1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_status_reports_health() {
        let app = test_app().await;

        let (status, body) = send(&app, get("/sync/status?device_id=device-a", "user-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sync_health"], "never_synced");
        assert_eq!(body["pending_uploads"], 0);

        send(&app, post("/sync/upload", "user-1", create_report("u1"))).await;

        let (_, body) = send(&app, get("/sync/status?device_id=device-a", "user-1")).await;
        assert_eq!(body["sync_health"], "good");
        assert!(body["last_upload"].is_string());
        assert_eq!(body["conflicts"], 0);
    }

    #[tokio::test]
    async fn test_conflict_endpoints() {
        let app = test_app().await;

        let (status, body) = send(&app, get("/sync/conflicts", "user-1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = send(&app, get("/sync/conflicts/unknown", "user-1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            post(
                "/sync/resolve-conflict",
                "moderator-1",
                json!({"conflict_id": "unknown", "resolution_strategy": "server_wins"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "ok");
    }
}
