use chrono::{DateTime, Utc};
use insight_core::AppError;
use insight_core::models::{InsightRecord, NewToken, Token};
use insight_core::traits::{InsightStore, StateStore, TokenRegistry};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::insight_repository::InsightRepository;
use crate::state_repository::StateRepository;
use crate::token_repository::TokenRepository;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends repository instances.
///
/// Implements every store trait by delegating to the repositories, so the
/// orchestrator can take a single handle.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    tokens: TokenRepository,
    insights: InsightRepository,
    state: StateRepository,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self::from_pool(pool))
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            tokens: TokenRepository::new(pool.clone()),
            insights: InsightRepository::new(pool.clone()),
            state: StateRepository::new(pool.clone()),
            pool,
        }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        tracing::debug!("Database migrations applied");
        Ok(())
    }

    pub fn token_repo(&self) -> &TokenRepository {
        &self.tokens
    }

    pub fn insight_repo(&self) -> &InsightRepository {
        &self.insights
    }

    pub fn state_repo(&self) -> &StateRepository {
        &self.state
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl TokenRegistry for Database {
    async fn list_tokens(&self) -> Result<Vec<Token>, AppError> {
        self.tokens.list().await
    }

    async fn list_enabled(&self) -> Result<Vec<Token>, AppError> {
        self.tokens.list_enabled().await
    }

    async fn due_tokens(&self, now: DateTime<Utc>) -> Result<Vec<Token>, AppError> {
        self.tokens.due(now).await
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Token>, AppError> {
        self.tokens.get(token_id).await
    }

    async fn mark_scraped(&self, token_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        self.tokens.mark_scraped(token_id, at).await
    }

    async fn create_token(&self, token: &NewToken) -> Result<Token, AppError> {
        self.tokens.create(token).await
    }

    async fn delete_token(&self, token_id: &str) -> Result<bool, AppError> {
        self.tokens.delete(token_id).await
    }

    async fn set_enabled(&self, token_id: &str, enabled: bool) -> Result<bool, AppError> {
        self.tokens.set_enabled(token_id, enabled).await
    }
}

impl InsightStore for Database {
    async fn insight_exists(&self, id: &str) -> Result<bool, AppError> {
        self.insights.exists(id).await
    }

    async fn upsert_insight(&self, record: &InsightRecord) -> Result<(), AppError> {
        self.insights.upsert(record).await
    }

    async fn latest_insights(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<InsightRecord>, AppError> {
        self.insights.latest(limit, offset).await
    }
}

impl StateStore for Database {
    async fn get_state(&self, key: &str) -> Result<Option<String>, AppError> {
        self.state.get(key).await
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.state.set(key, value).await
    }
}
