mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use utoipa::OpenApi;

pub use self::error::AppError;
pub use self::state::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health_handler,
        api::trigger_load_handler,
        api::fetch_drive_handler,
        api::caption_handler,
        api::store_handler,
        api::search_handler,
    ),
    components(schemas(
        types::HealthResponse,
        types::StatusResponse,
        types::FetchDriveRequest,
        types::FetchDriveResponse,
        types::CaptionRequest,
        types::CaptionResponse,
        types::StoreRequest,
        types::StoreResponse,
        types::SearchResponse,
    ))
)]
pub struct ApiDoc;

async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// 构建API服务器
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health_handler))
        .route("/trigger_load", get(api::trigger_load_handler).post(api::trigger_load_handler))
        .route("/api/fetch-drive", post(api::fetch_drive_handler))
        .route("/api/caption", post(api::caption_handler))
        .route("/api/store", post(api::store_handler))
        .route("/api/search", get(api::search_handler))
        .route("/api-docs/openapi.json", get(openapi_handler))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        // 请求体限制：10M
        .layer(RequestBodyLimitLayer::new(1024 * 1024 * 10))
        .with_state(state)
}
