use axum::http::{HeaderName, Method, StatusCode, header};
use axum::{Router, routing::get};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::wisp::{WispState, wisp_ws_handler};

/// Liveness probe
async fn health() -> StatusCode {
    StatusCode::OK
}

/// Register all routes. The Wisp endpoint accepts every origin; browser
/// proxies connect from arbitrary pages.
pub fn build_router(wisp_state: WispState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::UPGRADE,
            header::CONNECTION,
            HeaderName::from_static("sec-websocket-key"),
            HeaderName::from_static("sec-websocket-version"),
            HeaderName::from_static("sec-websocket-protocol"),
        ])
        .allow_credentials(true);

    Router::new()
        // Wisp WebSocket endpoint, at the root and the conventional path
        .route("/", get(wisp_ws_handler))
        .route("/wisp/", get(wisp_ws_handler))
        .route("/health", get(health))
        .with_state(wisp_state)
        .layer(cors)
}
