use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use log::{debug, info, warn};

use super::error::{AppError, Result};
use super::state::AppState;
use super::types::*;
use crate::db::{DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT};
use crate::registry::TriggerOutcome;
use crate::{embedding, metrics};

/// 请求体无法解析时返回 400，并带上解析错误
fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload.map(|Json(body)| body).map_err(|e| AppError::bad_request(e.body_text()))
}

/// 服务健康状态
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        ready: state.registry.is_ready().await,
        state: state.registry.state(),
    })
}

/// 在后台开始加载模型
#[utoipa::path(
    post,
    path = "/trigger_load",
    responses(
        (status = 202, body = StatusResponse, description = "已开始加载，或加载已在进行中"),
        (status = 412, body = StatusResponse, description = "SKIP_MODEL_LOAD 禁止加载"),
    )
)]
pub async fn trigger_load_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<StatusResponse>) {
    match state.registry.trigger().await {
        TriggerOutcome::Disabled => {
            (StatusCode::PRECONDITION_FAILED, Json(StatusResponse { status: "skipped_by_env" }))
        }
        outcome => {
            debug!("触发模型加载: {:?}", outcome);
            (StatusCode::ACCEPTED, Json(StatusResponse { status: "loading_started" }))
        }
    }
}

/// 列出 Drive 文件夹中的图片
#[utoipa::path(
    post,
    path = "/api/fetch-drive",
    request_body = FetchDriveRequest,
    responses(
        (status = 200, body = FetchDriveResponse),
        (status = 400, description = "缺少 driveLink"),
        (status = 503, description = "Drive 凭据未配置"),
    )
)]
pub async fn fetch_drive_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<FetchDriveRequest>, JsonRejection>,
) -> Result<Json<FetchDriveResponse>> {
    let request = json_body(payload)?;
    let drive_link = request
        .drive_link
        .filter(|link| !link.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("Drive link is required"))?;

    let drive = state.registry.drive().await.map_err(|e| {
        warn!("Drive 客户端不可用: {e:#}");
        AppError::unavailable("service not ready")
    })?;

    let images = drive.list_images(&drive_link).await?;
    info!("从 Drive 获取到 {} 张图片", images.len());
    Ok(Json(FetchDriveResponse { count: images.len(), images }))
}

/// 为图片生成描述
#[utoipa::path(
    post,
    path = "/api/caption",
    request_body = CaptionRequest,
    responses(
        (status = 200, body = CaptionResponse),
        (status = 202, body = CaptionResponse, description = "模型尚未加载"),
        (status = 400, description = "图片列表为空"),
    )
)]
pub async fn caption_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<CaptionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CaptionResponse>)> {
    let request = json_body(payload)?;
    if request.images.is_empty() {
        return Err(AppError::bad_request("No images provided"));
    }

    let Some(service) = state.registry.caption_service().await? else {
        state.registry.trigger().await;
        let response = CaptionResponse { status: Some(MODEL_NOT_READY), captions: vec![], count: 0 };
        return Ok((StatusCode::ACCEPTED, Json(response)));
    };

    let start = Instant::now();
    let captions = service.caption_images(&request.images).await;
    info!("生成 {} 条描述，耗时 {:.2}s", captions.len(), start.elapsed().as_secs_f32());
    let response = CaptionResponse { status: None, count: captions.len(), captions };
    Ok((StatusCode::OK, Json(response)))
}

/// 计算描述向量并写入数据库
#[utoipa::path(
    post,
    path = "/api/store",
    request_body = StoreRequest,
    responses(
        (status = 200, body = StoreResponse),
        (status = 400, description = "记录列表为空"),
        (status = 503, description = "数据库或向量模型不可用"),
    )
)]
pub async fn store_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<StoreRequest>, JsonRejection>,
) -> Result<Json<StoreResponse>> {
    let request = json_body(payload)?;
    if request.photos.is_empty() {
        return Err(AppError::bad_request("No photos provided"));
    }

    let store = state.registry.store().await.map_err(|e| {
        warn!("数据库不可用: {e:#}");
        AppError::unavailable("database service not ready")
    })?;
    let embedder = state.registry.embedder_for_write().await.map_err(|e| {
        warn!("向量模型不可用: {e:#}");
        AppError::unavailable("embedding model not ready")
    })?;

    let count = store.store(embedder, &request.photos).await?;
    metrics::inc_stored(count);
    info!("写入 {} 条记录", count);
    Ok(Json(StoreResponse { message: "Photos stored successfully", count }))
}

/// 使用自然语言搜索图片
#[utoipa::path(
    get,
    path = "/api/search",
    params(SearchQuery),
    responses(
        (status = 200, body = SearchResponse),
        (status = 202, body = SearchResponse, description = "模型或数据库尚未就绪"),
        (status = 400, description = "缺少 query 参数"),
    )
)]
pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    params: std::result::Result<Query<SearchQuery>, QueryRejection>,
) -> Result<(StatusCode, Json<SearchResponse>)> {
    let Query(params) = params.map_err(|e| AppError::bad_request(e.body_text()))?;
    let query = params
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("Query parameter is required"))?;
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    if limit == 0 || limit > MAX_SEARCH_LIMIT {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_SEARCH_LIMIT
        )));
    }

    let embedder = state.registry.embedder().await;
    if embedder.is_none() {
        state.registry.trigger().await;
    }
    let store = state
        .registry
        .store()
        .await
        .inspect_err(|e| warn!("数据库不可用: {e:#}"))
        .ok();
    let (Some(embedder), Some(store)) = (embedder, store) else {
        let response = SearchResponse { status: Some(MODEL_NOT_READY), results: vec![], count: 0 };
        return Ok((StatusCode::ACCEPTED, Json(response)));
    };

    let start = Instant::now();
    let vector = embedding::embed_blocking(embedder, query.clone()).await?;
    let results = store.search(vector, limit).await?;
    let elapsed = start.elapsed().as_secs_f32();
    metrics::observe_search(elapsed, results.first().map(|r| r.similarity));
    debug!("搜索 {:?} 返回 {} 条结果，耗时 {:.3}s", query, results.len(), elapsed);

    let response = SearchResponse { status: None, count: results.len(), results };
    Ok((StatusCode::OK, Json(response)))
}
