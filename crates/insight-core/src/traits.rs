use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::evasion::Fingerprint;
use crate::models::{InsightRecord, NewToken, Token};

/// Registry of tracked tokens and their scheduling bookkeeping.
pub trait TokenRegistry: Send + Sync + Clone {
    fn list_tokens(&self) -> impl Future<Output = Result<Vec<Token>, AppError>> + Send;

    fn list_enabled(&self) -> impl Future<Output = Result<Vec<Token>, AppError>> + Send;

    /// Enabled tokens due at `now`, never-scraped first, then oldest first.
    fn due_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Token>, AppError>> + Send;

    fn get_token(
        &self,
        token_id: &str,
    ) -> impl Future<Output = Result<Option<Token>, AppError>> + Send;

    /// Record that a pass over `token_id` finished at `at`.
    fn mark_scraped(
        &self,
        token_id: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn create_token(
        &self,
        token: &NewToken,
    ) -> impl Future<Output = Result<Token, AppError>> + Send;

    /// Returns false when no token had that id.
    fn delete_token(&self, token_id: &str)
    -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Returns false when no token had that id.
    fn set_enabled(
        &self,
        token_id: &str,
        enabled: bool,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Persists insight records. Writes are idempotent upserts keyed by id.
pub trait InsightStore: Send + Sync + Clone {
    fn insight_exists(&self, id: &str) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn upsert_insight(
        &self,
        record: &InsightRecord,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Newest insights first, by timestamp.
    fn latest_insights(
        &self,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<InsightRecord>, AppError>> + Send;
}

/// Small key/value store for scraper bookkeeping (e.g. the last run time).
pub trait StateStore: Send + Sync + Clone {
    fn get_state(&self, key: &str)
    -> impl Future<Output = Result<Option<String>, AppError>> + Send;

    fn set_state(
        &self,
        key: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Turns raw insight-page markup into structured records.
///
/// Implementations isolate failures per entry: a broken entry is logged
/// and skipped, never failing the whole page.
pub trait InsightParser: Send + Sync + Clone {
    fn parse(&self, token_id: &str, markup: &str, timestamp: i64) -> Vec<InsightRecord>;
}

// ---------------------------------------------------------------------------
// Browser automation seams
// ---------------------------------------------------------------------------

/// How an engine instance should be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    pub proxy: Option<String>,
    pub window_width: u32,
    pub window_height: u32,
    /// Extra command-line flags passed to the engine.
    pub args: Vec<String>,
}

/// Raw answer to an in-session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResponse {
    pub status: u16,
    pub body: String,
}

impl SessionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Launches browser engine instances.
pub trait BrowserLauncher: Send + Sync {
    type Engine: BrowserEngine;

    fn launch(
        &self,
        options: &LaunchOptions,
    ) -> impl Future<Output = Result<Self::Engine, AppError>> + Send;
}

/// A running engine able to host isolated sessions.
pub trait BrowserEngine: Send + Sync {
    type Session: BrowserSession;

    /// Create an isolated browsing context (own cookies and storage)
    /// presenting `fingerprint`.
    fn new_session(
        &self,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// One isolated browsing context holding at most one page.
pub trait BrowserSession: Send + Sync {
    /// Open the page every later call runs in.
    fn open_page(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mask automation markers for every document loaded from now on.
    fn hide_automation(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn navigate(&self, url: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    fn move_pointer(
        &self,
        x: f64,
        y: f64,
        steps: u32,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Issue a request from inside the page, carrying the session's cookies
    /// and fingerprint. Non-2xx statuses are returned, not raised.
    fn request(
        &self,
        url: &str,
        accept: Option<&str>,
    ) -> impl Future<Output = Result<SessionResponse, AppError>> + Send;

    /// Release the page and the browsing context.
    fn close(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Await `fut`, failing with [`AppError::Timeout`] once `limit` elapses.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(AppError::Timeout(limit.as_secs())),
    }
}
