//! sluss backend library.
//!
//! This module exposes the application builder for use in tests.

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub mod api;
pub mod config;
pub mod dispatch;
pub mod notify;
pub mod session;
pub mod state;
pub mod store;
pub mod tools;

use config::RuntimeOptions;
use state::AppState;

/// Create the Axum application router with the demo tool-set and
/// default options.
///
/// This function is used both by the main server binary and by
/// integration tests.
pub async fn create_app() -> Router {
    let (tools, resources) = tools::demo_registry().expect("demo registry is valid");
    create_app_with_state(AppState::new(tools, resources, RuntimeOptions::default())).await
}

/// Create the Axum application router with a given state.
pub async fn create_app_with_state(state: AppState) -> Router {
    create_app_with_config(state, Vec::new()).await
}

/// Create the Axum application router with a given state and CORS origins.
///
/// If `cors_allowed_origins` is empty, any origin is allowed.
/// Otherwise, only the specified origins are allowed.
pub async fn create_app_with_config(state: AppState, cors_allowed_origins: Vec<String>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", post(api::mcp::mcp_post))
        .route("/mcp", get(api::mcp::mcp_get))
        .route("/mcp", delete(api::mcp::mcp_delete))
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    HeaderName::from_static(sluss_types::SESSION_ID_HEADER),
                    HeaderName::from_static(sluss_types::LAST_EVENT_ID_HEADER),
                ])
                .expose_headers([HeaderName::from_static(sluss_types::SESSION_ID_HEADER)]);

            // If no origins specified, allow any origin
            if cors_allowed_origins.is_empty() {
                cors.allow_origin(Any)
            } else {
                let origins: Vec<HeaderValue> = cors_allowed_origins
                    .iter()
                    .filter_map(|o| o.parse::<HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins).allow_credentials(true)
            }
        })
        .with_state(state)
}

/// Health check endpoint.
async fn health() -> &'static str {
    "OK"
}
