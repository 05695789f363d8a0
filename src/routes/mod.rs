//! Route modules for the Civic Sync server

pub mod health;
pub mod sync;

use axum::http::HeaderMap;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the caller identity resolved by the authentication gateway
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller of a request
pub fn caller_id(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?
        .to_str()
        .map_err(|_| AppError::Unauthorized("X-User-Id header is not valid UTF-8".to_string()))?
        .trim();

    if value.is_empty() {
        return Err(AppError::Unauthorized("X-User-Id header is empty".to_string()));
    }
    Ok(value.to_string())
}

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/health", health::router())
        .nest("/sync", sync::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_id() {
        let mut headers = HeaderMap::new();
        assert!(matches!(caller_id(&headers), Err(AppError::Unauthorized(_))));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert!(caller_id(&headers).is_err());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("user-1"));
        assert_eq!(caller_id(&headers).unwrap(), "user-1");
    }
}
