use insight_core::error::AppError;
use insight_core::models::{InsightRecord, InsightSource};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};

/// Repository for scraped insights in PostgreSQL.
#[derive(Clone)]
pub struct InsightRepository {
    pool: Pool<Postgres>,
}

impl InsightRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn exists(&self, id: &str) -> Result<bool, AppError> {
        let row: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM insights WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }

    /// Insert or overwrite the insight with the record's id.
    pub async fn upsert(&self, record: &InsightRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO insights (id, token_id, timestamp, title, content, source_count, sources)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                token_id = EXCLUDED.token_id,
                timestamp = EXCLUDED.timestamp,
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                source_count = EXCLUDED.source_count,
                sources = EXCLUDED.sources,
                updated_at = NOW()
            "#,
        )
        .bind(&record.id)
        .bind(&record.token_id)
        .bind(record.timestamp)
        .bind(&record.title)
        .bind(&record.content)
        .bind(record.source_count)
        .bind(Json(&record.sources))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Newest insights first by timestamp, ties by id.
    pub async fn latest(&self, limit: usize, offset: usize) -> Result<Vec<InsightRecord>, AppError> {
        let rows = sqlx::query_as::<_, InsightRow>(
            r#"
            SELECT id, token_id, timestamp, title, content, source_count, sources
            FROM insights
            ORDER BY timestamp DESC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        // Values past i64::MAX mean "no limit" / "skip everything" anyway.
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM insights")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct InsightRow {
    id: String,
    token_id: String,
    timestamp: i64,
    title: String,
    content: String,
    source_count: i32,
    sources: Json<Vec<InsightSource>>,
}

impl From<InsightRow> for InsightRecord {
    fn from(row: InsightRow) -> Self {
        InsightRecord {
            id: row.id,
            token_id: row.token_id,
            timestamp: row.timestamp,
            title: row.title,
            content: row.content,
            source_count: row.source_count,
            sources: row.sources.0,
        }
    }
}
