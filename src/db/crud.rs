use pgvector::Vector;
use sqlx::{PgConnection, Postgres, QueryBuilder, Result};

use super::SearchResult;
use crate::caption::CaptionedImage;

/// 批量写入图片记录，drive_link 冲突时更新描述和向量
pub async fn upsert_photos(
    conn: &mut PgConnection,
    photos: &[(&CaptionedImage, Vec<f32>)],
) -> Result<u64> {
    let mut query = QueryBuilder::<Postgres>::new(
        "INSERT INTO photos (file_name, drive_link, caption, embedding) ",
    );
    query.push_values(photos, |mut row, (photo, embedding)| {
        row.push_bind(&photo.file_name)
            .push_bind(&photo.drive_link)
            .push_bind(&photo.caption)
            .push_bind(Vector::from(embedding.clone()));
    });
    query.push(
        r#"
        ON CONFLICT (drive_link)
        DO UPDATE SET
            caption = EXCLUDED.caption,
            embedding = EXCLUDED.embedding,
            updated_at = now()
        "#,
    );

    let result = query.build().execute(conn).await?;
    Ok(result.rows_affected())
}

/// 按余弦距离查询最相近的图片
pub async fn search_photos(
    conn: &mut PgConnection,
    embedding: Vec<f32>,
    limit: i64,
) -> Result<Vec<SearchResult>> {
    sqlx::query_as::<_, SearchResult>(
        r#"
        SELECT
            id,
            file_name,
            drive_link,
            caption,
            1 - (embedding <=> $1) AS similarity,
            updated_at
        FROM photos
        WHERE embedding IS NOT NULL
        ORDER BY embedding <=> $1
        LIMIT $2
        "#,
    )
    .bind(Vector::from(embedding))
    .bind(limit)
    .fetch_all(conn)
    .await
}
