use chrono::{DateTime, Utc};
use insight_core::error::AppError;
use insight_core::models::{NewToken, Token};
use sqlx::{PgPool, Pool, Postgres};

/// Repository for tracked tokens in PostgreSQL.
#[derive(Clone)]
pub struct TokenRepository {
    pool: Pool<Postgres>,
}

impl TokenRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All tokens, ordered by id.
    pub async fn list(&self) -> Result<Vec<Token>, AppError> {
        let rows = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT id, name, enabled, scrape_interval_minutes, last_scraped_at
            FROM tokens
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_enabled(&self) -> Result<Vec<Token>, AppError> {
        let rows = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT id, name, enabled, scrape_interval_minutes, last_scraped_at
            FROM tokens
            WHERE enabled
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Enabled tokens that were never scraped or whose interval has fully
    /// elapsed at `now`. Never-scraped first, then oldest, ties by id.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Token>, AppError> {
        let rows = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT id, name, enabled, scrape_interval_minutes, last_scraped_at
            FROM tokens
            WHERE enabled
              AND (last_scraped_at IS NULL
                   OR last_scraped_at + make_interval(mins => scrape_interval_minutes) <= $1)
            ORDER BY last_scraped_at ASC NULLS FIRST, id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn get(&self, token_id: &str) -> Result<Option<Token>, AppError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT id, name, enabled, scrape_interval_minutes, last_scraped_at
            FROM tokens
            WHERE id = $1
            "#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    pub async fn mark_scraped(&self, token_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE tokens SET last_scraped_at = $2 WHERE id = $1")
            .bind(token_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Insert a new, enabled token. Fails if the id is taken.
    pub async fn create(&self, token: &NewToken) -> Result<Token, AppError> {
        token.validate()?;
        let interval = i32::try_from(token.scrape_interval_minutes).map_err(|_| {
            AppError::ConfigError(format!(
                "Scrape interval {} is too large",
                token.scrape_interval_minutes
            ))
        })?;

        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            INSERT INTO tokens (id, name, scrape_interval_minutes)
            VALUES ($1, $2, $3)
            RETURNING id, name, enabled, scrape_interval_minutes, last_scraped_at
            "#,
        )
        .bind(&token.id)
        .bind(&token.name)
        .bind(interval)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.into())
    }

    pub async fn delete(&self, token_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM tokens WHERE id = $1")
            .bind(token_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_enabled(&self, token_id: &str, enabled: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE tokens SET enabled = $2 WHERE id = $1")
            .bind(token_id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct TokenRow {
    id: String,
    name: String,
    enabled: bool,
    scrape_interval_minutes: i32,
    last_scraped_at: Option<DateTime<Utc>>,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: row.id,
            name: row.name,
            enabled: row.enabled,
            // The table constraint keeps this positive.
            scrape_interval_minutes: u32::try_from(row.scrape_interval_minutes).unwrap_or(1),
            last_scraped_at: row.last_scraped_at,
        }
    }
}
