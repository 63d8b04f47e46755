use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};

use crate::caption::CaptionedImage;
use crate::config::DatabaseOptions;
use crate::embedding::{self, TextEmbedder};

pub mod crud;
pub mod model;

pub use model::*;

/// 默认返回的搜索结果数量
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
/// 单次搜索最多返回的结果数量
pub const MAX_SEARCH_LIMIT: usize = 1000;
/// 单条 INSERT 最多写入的行数，每行绑定 4 个参数，PostgreSQL 限制 65535 个参数
pub const UPSERT_CHUNK_ROWS: usize = u16::MAX as usize / 4;

/// 图片记录存储
///
/// 每次操作都会建立新的连接，并在操作结束后关闭
pub struct PhotoStore {
    options: PgConnectOptions,
}

impl PhotoStore {
    pub fn new(opts: &DatabaseOptions) -> Result<Self> {
        Ok(Self { options: opts.connect_options()? })
    }

    pub fn with_options(options: PgConnectOptions) -> Self {
        Self { options }
    }

    async fn connect(&self) -> Result<PgConnection> {
        Ok(PgConnection::connect_with(&self.options).await?)
    }

    /// 初始化表结构
    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        info!("检查数据库迁移");
        let result = sqlx::migrate!().run_direct(&mut conn).await;
        close(conn).await;
        Ok(result?)
    }

    /// 为描述计算向量并写入数据库，返回提交的记录数量
    ///
    /// 所有记录在同一个事务中写入，失败时整体回滚
    pub async fn store(
        &self,
        embedder: Arc<dyn TextEmbedder>,
        photos: &[CaptionedImage],
    ) -> Result<usize> {
        if photos.is_empty() {
            return Ok(0);
        }

        let captions = photos.iter().map(|p| p.caption.clone()).collect();
        let embeddings = embedding::embed_batch_blocking(embedder, captions).await?;
        if embeddings.len() != photos.len() {
            return Err(anyhow!(
                "embedding count mismatch: {} captions, {} vectors",
                photos.len(),
                embeddings.len()
            ));
        }
        let rows = dedup_by_link(photos.iter().zip(embeddings).collect());

        let mut conn = self.connect().await?;
        let result = upsert_in_transaction(&mut conn, &rows).await;
        close(conn).await;

        match result {
            Ok(affected) => {
                debug!("写入 {} 条记录，影响 {} 行", rows.len(), affected);
                Ok(photos.len())
            }
            Err(e) => Err(anyhow!("Database error: {e}")),
        }
    }

    /// 搜索与向量最相近的图片，按相似度从高到低排列
    ///
    /// `limit` 超过 [`MAX_SEARCH_LIMIT`] 时按上限处理
    pub async fn search(&self, embedding: Vec<f32>, limit: usize) -> Result<Vec<SearchResult>> {
        let limit = i64::try_from(limit.min(MAX_SEARCH_LIMIT))?;
        let mut conn = self.connect().await?;
        let result = crud::search_photos(&mut conn, embedding, limit).await;
        close(conn).await;
        result.map_err(|e| anyhow!("Search error: {e}"))
    }
}

async fn upsert_in_transaction(
    conn: &mut PgConnection,
    rows: &[(&CaptionedImage, Vec<f32>)],
) -> sqlx::Result<u64> {
    let mut tx = conn.begin().await?;
    let mut affected = 0;
    for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
        match crud::upsert_photos(&mut *tx, chunk).await {
            Ok(n) => affected += n,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        }
    }
    tx.commit().await?;
    Ok(affected)
}

async fn close(conn: PgConnection) {
    if let Err(e) = conn.close().await {
        warn!("关闭数据库连接失败: {e}");
    }
}

/// 同一批次中 drive_link 重复时只保留最后一条，顺序按首次出现的位置
fn dedup_by_link(rows: Vec<(&CaptionedImage, Vec<f32>)>) -> Vec<(&CaptionedImage, Vec<f32>)> {
    let mut position = HashMap::new();
    let mut result: Vec<(&CaptionedImage, Vec<f32>)> = Vec::with_capacity(rows.len());
    for row in rows {
        match position.get(row.0.drive_link.as_str()) {
            Some(&idx) => result[idx] = row,
            None => {
                position.insert(row.0.drive_link.as_str(), result.len());
                result.push(row);
            }
        }
    }
    result
}
