use chrono::Utc;

use crate::backoff::RateLimitBackoff;
use crate::config::ScraperConfig;
use crate::error::AppError;
use crate::evasion::EvasionPolicy;
use crate::models::{InsightRecord, TimelineEntry, Token};
use crate::throttle::pause;
use crate::traits::{
    BrowserSession, InsightParser, InsightStore, SessionResponse, TokenRegistry, with_timeout,
};

/// Lifecycle of a [`TokenFetcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    Created,
    Initialized,
    Fetching,
    Done,
    Failed,
}

/// Collaborators shared by every fetcher of a batch.
pub struct ScrapeContext<'a, P, S, E> {
    pub config: &'a ScraperConfig,
    pub parser: &'a P,
    pub store: &'a S,
    pub evasion: &'a E,
    pub backoff: &'a RateLimitBackoff,
}

impl<P, S, E> Clone for ScrapeContext<'_, P, S, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, S, E> Copy for ScrapeContext<'_, P, S, E> {}

/// Drives one isolated session through a token's insight feed:
/// warm-up → timeline → per-cursor pages → parse → dedupe → persist.
///
/// Every network, parse and store call guards itself, so a failure on one
/// timeline entry never affects the entries after it. Only failing to open
/// a page at all is fatal for the token.
pub struct TokenFetcher<'a, B, P, S, E>
where
    B: BrowserSession,
    P: InsightParser,
    S: TokenRegistry + InsightStore,
    E: EvasionPolicy,
{
    token: &'a Token,
    session: B,
    ctx: ScrapeContext<'a, P, S, E>,
    state: FetcherState,
}

impl<'a, B, P, S, E> TokenFetcher<'a, B, P, S, E>
where
    B: BrowserSession,
    P: InsightParser,
    S: TokenRegistry + InsightStore,
    E: EvasionPolicy,
{
    pub fn new(token: &'a Token, session: B, ctx: ScrapeContext<'a, P, S, E>) -> Self {
        Self {
            token,
            session,
            ctx,
            state: FetcherState::Created,
        }
    }

    pub fn state(&self) -> FetcherState {
        self.state
    }

    fn label(&self) -> &str {
        self.token.label()
    }

    /// Open the page, mask automation markers, load the profile page and
    /// behave like a person for a moment.
    ///
    /// Navigation problems are tolerated: later calls are in-session
    /// requests that do not depend on the rendered page.
    pub async fn initialize(&mut self) -> Result<(), AppError> {
        let limit = self.ctx.config.navigation_timeout;
        if let Err(e) = with_timeout(limit, self.session.open_page()).await {
            self.state = FetcherState::Failed;
            return Err(e);
        }

        if self.ctx.evasion.hides_automation()
            && let Err(e) = self.session.hide_automation().await
        {
            tracing::warn!(token = %self.label(), error = %e, "Could not mask automation markers");
        }

        tracing::info!(token = %self.label(), "Opening profile page");
        let navigation = match self.ctx.config.site.profile_url(&self.token.id) {
            Ok(url) => {
                with_timeout(limit, self.session.navigate(&url)).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = navigation {
            tracing::warn!(token = %self.label(), error = %e, "Navigation warning");
        }

        self.jitter().await;
        pause(self.ctx.evasion.settle_delay()).await;

        self.state = FetcherState::Initialized;
        Ok(())
    }

    /// Simulated pointer movement. Best-effort: stops at the first error.
    async fn jitter(&self) {
        for step in self.ctx.evasion.pointer_path() {
            if let Err(e) = self.session.move_pointer(step.x, step.y, step.steps).await {
                tracing::debug!(token = %self.label(), error = %e, "Pointer jitter aborted");
                return;
            }
            pause(step.pause).await;
        }
    }

    async fn request(&self, url: &str, accept: Option<&str>) -> Result<SessionResponse, AppError> {
        with_timeout(
            self.ctx.config.request_timeout,
            self.session.request(url, accept),
        )
        .await
    }

    /// Fetch the token's insight timeline. Any failure yields an empty list.
    pub async fn fetch_timeline(&self) -> Vec<TimelineEntry> {
        tracing::info!(token = %self.label(), "Fetching timeline");
        self.jitter().await;

        let url = match self.ctx.config.site.timeline_url(&self.token.id) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(token = %self.label(), error = %e, "Cannot build timeline URL");
                return Vec::new();
            }
        };

        let response = match self.request(&url, Some("application/json")).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(token = %self.label(), error = %e, "Timeline request failed");
                return Vec::new();
            }
        };

        if !response.is_success() {
            tracing::error!(
                token = %self.label(),
                status = response.status,
                "Timeline request rejected"
            );
            return Vec::new();
        }

        match serde_json::from_str::<Vec<TimelineEntry>>(&response.body) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(token = %self.label(), error = %e, "Timeline payload is not a list of entries");
                Vec::new()
            }
        }
    }

    /// Fetch the markup of one insight page after the per-request delay.
    ///
    /// A 429 feeds the shared backoff, waits it out, and skips the entry.
    pub async fn fetch_insight_page(&self, cursor: &str) -> Option<String> {
        let url = match self.ctx.config.site.insight_url(&self.token.id, cursor) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(token = %self.label(), error = %e, "Cannot build insight URL");
                return None;
            }
        };

        let delay = self.ctx.evasion.request_delay();
        tracing::info!(
            token = %self.label(),
            cursor = %cursor_tail(cursor),
            delay_ms = delay.as_millis() as u64,
            "Fetching insight page"
        );
        pause(delay).await;

        match self.request(&url, None).await {
            Ok(response) if response.is_success() => Some(response.body),
            Ok(response) if response.status == 429 => {
                let wait = self.ctx.backoff.on_rate_limited();
                tracing::warn!(
                    token = %self.label(),
                    cursor = %cursor_tail(cursor),
                    backoff_secs = wait.as_secs_f64(),
                    "Rate limited, backing off"
                );
                pause(wait).await;
                None
            }
            Ok(response) => {
                tracing::error!(
                    token = %self.label(),
                    cursor = %cursor_tail(cursor),
                    status = response.status,
                    "Insight page rejected"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    token = %self.label(),
                    cursor = %cursor_tail(cursor),
                    error = %e,
                    "Insight page request failed"
                );
                None
            }
        }
    }

    /// Persist records not yet in the store. Returns how many were new.
    async fn persist_new(&self, records: Vec<InsightRecord>) -> usize {
        let mut inserted = 0;
        for record in records {
            match self.ctx.store.insight_exists(&record.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                // Upserts are idempotent, so writing through is safe.
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "Existence check failed");
                }
            }
            match self.ctx.store.upsert_insight(&record).await {
                Ok(()) => {
                    tracing::debug!(id = %record.id, "Saved insight");
                    inserted += 1;
                }
                Err(e) => tracing::error!(id = %record.id, error = %e, "Failed to save insight"),
            }
        }
        inserted
    }

    /// Run the full flow for this token. Returns the count of new insights.
    ///
    /// The token's last-scraped time is recorded exactly once, after every
    /// entry was processed (also when the timeline came back empty).
    pub async fn run(&mut self) -> Result<usize, AppError> {
        self.initialize().await?;
        self.state = FetcherState::Fetching;

        let mut timeline = self.fetch_timeline().await;
        if timeline.is_empty() {
            tracing::warn!(token = %self.label(), "Empty timeline");
        }
        timeline.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut inserted = 0;
        for entry in &timeline {
            let Some(cursor) = entry.cursor.as_deref().filter(|c| !c.is_empty()) else {
                continue;
            };
            let Some(markup) = self.fetch_insight_page(cursor).await else {
                continue;
            };
            let records = self
                .ctx
                .parser
                .parse(&self.token.id, &markup, entry.timestamp);
            inserted += self.persist_new(records).await;
        }

        if let Err(e) = self
            .ctx
            .store
            .mark_scraped(&self.token.id, Utc::now())
            .await
        {
            tracing::error!(token = %self.label(), error = %e, "Failed to update last-scraped time");
        }

        tracing::info!(token = %self.label(), inserted, "Token done");
        self.state = FetcherState::Done;
        Ok(inserted)
    }

    /// Release the page and session. Safe to call whatever `run` returned.
    pub async fn close(&mut self) {
        if let Err(e) = self.session.close().await {
            tracing::warn!(token = %self.label(), error = %e, "Failed to close session");
        }
    }
}

/// Last 8 characters of a cursor, enough to tell pages apart in logs.
fn cursor_tail(cursor: &str) -> &str {
    let start = cursor
        .char_indices()
        .rev()
        .nth(7)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &cursor[start..]
}
