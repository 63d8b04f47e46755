use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// 相似度搜索结果
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct SearchResult {
    /// 记录 ID
    pub id: Uuid,
    pub file_name: String,
    pub drive_link: String,
    pub caption: Option<String>,
    /// 1 - 余弦距离
    pub similarity: f64,
    pub updated_at: DateTime<Utc>,
}
