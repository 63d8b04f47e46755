use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::caption::CaptionedImage;
use crate::db::SearchResult;
use crate::drive::ImageDescriptor;
use crate::registry::LoadState;

pub const MODEL_NOT_READY: &str = "model_not_ready";

/// 健康检查响应
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// 固定为 `healthy`
    pub status: &'static str,
    /// 描述模型和向量模型均已加载
    pub ready: bool,
    pub state: LoadState,
}

/// 只包含状态的响应
#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    /// `loading_started` 或 `skipped_by_env`
    pub status: &'static str,
}

/// 获取 Drive 图片的请求
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FetchDriveRequest {
    /// Drive 文件夹链接
    #[serde(default)]
    pub drive_link: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FetchDriveResponse {
    pub images: Vec<ImageDescriptor>,
    pub count: usize,
}

/// 生成描述的请求
#[derive(Debug, Deserialize, ToSchema)]
pub struct CaptionRequest {
    #[serde(default)]
    pub images: Vec<ImageDescriptor>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CaptionResponse {
    /// 模型未就绪时为 `model_not_ready`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    pub captions: Vec<CaptionedImage>,
    pub count: usize,
}

/// 写入数据库的请求
#[derive(Debug, Deserialize, ToSchema)]
pub struct StoreRequest {
    #[serde(default)]
    pub photos: Vec<CaptionedImage>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StoreResponse {
    pub message: &'static str,
    /// 提交的记录数量
    pub count: usize,
}

/// 搜索参数
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct SearchQuery {
    /// 自然语言查询
    pub query: Option<String>,
    /// 返回结果数量，默认为 10，最大为 1000
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SearchResponse {
    /// 模型未就绪时为 `model_not_ready`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    pub results: Vec<SearchResult>,
    pub count: usize,
}
