use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::backoff::RateLimitBackoff;
use crate::config::ScraperConfig;
use crate::error::AppError;
use crate::evasion::EvasionPolicy;
use crate::models::Token;
use crate::session_pool::SessionPool;
use crate::throttle::pause;
use crate::token_fetcher::{ScrapeContext, TokenFetcher};
use crate::traits::{
    BrowserLauncher, InsightParser, InsightStore, StateStore, TokenRegistry, with_timeout,
};

/// State key holding the RFC 3339 time of the last completed pass.
pub const LAST_RUN_KEY: &str = "last_run";

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ScrapeEvent<'a> {
    BatchStarted {
        run_id: Uuid,
        selected: usize,
        deferred: usize,
    },
    TokenStarted {
        token_id: &'a str,
        position: usize,
        total: usize,
    },
    TokenRetrying {
        token_id: &'a str,
        attempt: u32,
        error: &'a str,
    },
    TokenSucceeded {
        token_id: &'a str,
        inserted: usize,
    },
    TokenFailed {
        token_id: &'a str,
        error: &'a str,
        skipped: bool,
    },
    Waiting {
        delay: Duration,
    },
    BatchFinished {
        summary: &'a BatchSummary,
    },
}

/// Trait for receiving orchestrator events (decoupled logging).
pub trait ScrapeReporter: Send + Sync {
    fn report(&self, event: ScrapeEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingScrapeReporter;

impl ScrapeReporter for TracingScrapeReporter {
    fn report(&self, event: ScrapeEvent<'_>) {
        match event {
            ScrapeEvent::BatchStarted {
                run_id,
                selected,
                deferred,
            } => {
                tracing::info!(%run_id, selected, deferred, "Starting scrape batch");
            }
            ScrapeEvent::TokenStarted {
                token_id,
                position,
                total,
            } => {
                tracing::info!(token = %token_id, position, total, "Processing token");
            }
            ScrapeEvent::TokenRetrying {
                token_id,
                attempt,
                error,
            } => {
                tracing::warn!(token = %token_id, attempt, %error, "Retrying token with a fresh session");
            }
            ScrapeEvent::TokenSucceeded { token_id, inserted } => {
                tracing::info!(token = %token_id, inserted, "Token succeeded");
            }
            ScrapeEvent::TokenFailed {
                token_id,
                error,
                skipped,
            } => {
                tracing::error!(token = %token_id, %error, skipped, "Token failed");
            }
            ScrapeEvent::Waiting { delay } => {
                tracing::info!(delay_ms = delay.as_millis() as u64, "Waiting before next token");
            }
            ScrapeEvent::BatchFinished { summary } => {
                tracing::info!(
                    run_id = %summary.run_id,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    inserted = summary.inserted,
                    "Scrape batch finished"
                );
            }
        }
    }
}

/// Outcome of one orchestrator pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    /// Tokens that were due.
    pub due: usize,
    /// Tokens processed in this pass.
    pub selected: usize,
    /// Due tokens left for a later pass by the batch cap.
    pub deferred: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// New insights persisted.
    pub inserted: usize,
}

impl BatchSummary {
    fn new(run_id: Uuid, selected: usize, deferred: usize) -> Self {
        Self {
            run_id,
            due: selected + deferred,
            selected,
            deferred,
            succeeded: 0,
            failed: 0,
            inserted: 0,
        }
    }
}

/// Cap an ordered due set to `limit`. Returns the batch and the number of
/// tokens deferred to a later pass.
pub fn select_batch(mut due: Vec<Token>, limit: usize) -> (Vec<Token>, usize) {
    let deferred = due.len().saturating_sub(limit);
    due.truncate(limit);
    (due, deferred)
}

/// Drives due tokens through the session pool one at a time.
///
/// The pool is started at the top of each pass and stopped on every exit
/// path, including an aborted batch.
pub struct Orchestrator<L, P, S, E>
where
    L: BrowserLauncher,
    P: InsightParser,
    S: TokenRegistry + InsightStore + StateStore,
    E: EvasionPolicy,
{
    pool: SessionPool<L>,
    parser: P,
    store: S,
    evasion: E,
    backoff: RateLimitBackoff,
    config: ScraperConfig,
}

impl<L, P, S, E> Orchestrator<L, P, S, E>
where
    L: BrowserLauncher,
    P: InsightParser,
    S: TokenRegistry + InsightStore + StateStore,
    E: EvasionPolicy,
{
    pub fn new(launcher: L, parser: P, store: S, evasion: E, config: ScraperConfig) -> Self {
        Self {
            pool: SessionPool::new(launcher, &config),
            parser,
            store,
            backoff: RateLimitBackoff::new(config.backoff.clone()),
            evasion,
            config,
        }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn backoff(&self) -> &RateLimitBackoff {
        &self.backoff
    }

    /// Scrape every due token, up to the batch cap.
    ///
    /// With `skip_on_failure` a failed token is logged, marked scraped and
    /// the batch continues. Otherwise the first failure aborts the batch
    /// and is returned.
    pub async fn run_all_due<R: ScrapeReporter>(
        &mut self,
        reporter: &R,
    ) -> Result<BatchSummary, AppError> {
        let run_id = Uuid::new_v4();
        let (due, registry_ok) = match self.store.due_tokens(Utc::now()).await {
            Ok(due) => (due, true),
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Failed to load due tokens");
                (Vec::new(), false)
            }
        };

        let (batch, deferred) = select_batch(due, self.config.tokens_per_batch);
        let mut summary = BatchSummary::new(run_id, batch.len(), deferred);
        reporter.report(ScrapeEvent::BatchStarted {
            run_id,
            selected: summary.selected,
            deferred,
        });

        if !batch.is_empty() {
            self.pool.start();
            let outcome = self.drive_batch(&batch, &mut summary, reporter).await;
            self.pool.stop().await;
            outcome?;
        }

        if registry_ok {
            self.record_last_run().await;
        }
        reporter.report(ScrapeEvent::BatchFinished { summary: &summary });
        Ok(summary)
    }

    /// Scrape a single token by id, outside batch selection. Disabled or
    /// not-yet-due tokens are scraped too. Returns the inserted count.
    pub async fn scrape_token<R: ScrapeReporter>(
        &mut self,
        token_id: &str,
        reporter: &R,
    ) -> Result<usize, AppError> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| AppError::Generic(format!("unknown token '{token_id}'")))?;

        reporter.report(ScrapeEvent::TokenStarted {
            token_id: &token.id,
            position: 1,
            total: 1,
        });

        self.pool.start();
        let strikes_before = self.backoff.strikes();
        let outcome = match self.pool.acquire_engine().await {
            Ok(engine) => self.scrape_with_retries(&engine, &token, reporter).await,
            Err(e) => Err(e),
        };
        self.pool.stop().await;

        match &outcome {
            Ok(inserted) => {
                self.reset_backoff_unless_throttled(strikes_before);
                reporter.report(ScrapeEvent::TokenSucceeded {
                    token_id: &token.id,
                    inserted: *inserted,
                });
            }
            Err(e) => reporter.report(ScrapeEvent::TokenFailed {
                token_id: &token.id,
                error: &e.to_string(),
                skipped: false,
            }),
        }
        outcome
    }

    async fn drive_batch<R: ScrapeReporter>(
        &mut self,
        batch: &[Token],
        summary: &mut BatchSummary,
        reporter: &R,
    ) -> Result<(), AppError> {
        // One engine for the whole batch; every token still gets its own
        // isolated session.
        let engine = self.pool.acquire_engine().await?;
        let total = batch.len();

        for (index, token) in batch.iter().enumerate() {
            reporter.report(ScrapeEvent::TokenStarted {
                token_id: &token.id,
                position: index + 1,
                total,
            });

            let strikes_before = self.backoff.strikes();
            match self.scrape_with_retries(&engine, token, reporter).await {
                Ok(inserted) => {
                    summary.succeeded += 1;
                    summary.inserted += inserted;
                    self.reset_backoff_unless_throttled(strikes_before);
                    reporter.report(ScrapeEvent::TokenSucceeded {
                        token_id: &token.id,
                        inserted,
                    });
                }
                Err(e) => {
                    summary.failed += 1;
                    let skip = self.config.skip_on_failure;
                    reporter.report(ScrapeEvent::TokenFailed {
                        token_id: &token.id,
                        error: &e.to_string(),
                        skipped: skip,
                    });
                    if !skip {
                        return Err(e);
                    }
                    if let Err(e) = self.store.mark_scraped(&token.id, Utc::now()).await {
                        tracing::error!(token = %token.label(), error = %e, "Failed to update last-scraped time");
                    }
                }
            }

            if index + 1 < total {
                let delay = self.evasion.token_delay();
                reporter.report(ScrapeEvent::Waiting { delay });
                pause(delay).await;
            }
        }
        Ok(())
    }

    /// Run a token, retrying retryable failures with a fresh session.
    async fn scrape_with_retries<R: ScrapeReporter>(
        &self,
        engine: &L::Engine,
        token: &Token,
        reporter: &R,
    ) -> Result<usize, AppError> {
        let mut attempt = 0;
        loop {
            match self.scrape_once(engine, token).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries_per_token => {
                    attempt += 1;
                    reporter.report(ScrapeEvent::TokenRetrying {
                        token_id: &token.id,
                        attempt,
                        error: &e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A token that hit a 429 keeps the escalated wait for the next one.
    fn reset_backoff_unless_throttled(&self, strikes_before: u32) {
        if self.backoff.strikes() <= strikes_before {
            self.backoff.reset();
        }
    }

    async fn scrape_once(&self, engine: &L::Engine, token: &Token) -> Result<usize, AppError> {
        let _slot = self.pool.acquire_slot().await?;
        let session = with_timeout(
            self.config.navigation_timeout,
            self.pool.new_session(engine, &self.evasion),
        )
        .await?;
        let ctx = ScrapeContext {
            config: &self.config,
            parser: &self.parser,
            store: &self.store,
            evasion: &self.evasion,
            backoff: &self.backoff,
        };

        let mut fetcher = TokenFetcher::new(token, session, ctx);
        let result = fetcher.run().await;
        fetcher.close().await;
        result
    }

    async fn record_last_run(&self) {
        let now = Utc::now().to_rfc3339();
        if let Err(e) = self.store.set_state(LAST_RUN_KEY, &now).await {
            tracing::error!(error = %e, "Failed to record last run time");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::backoff::BackoffState;
    use crate::evasion::PassiveEvasion;
    use crate::testutil::*;

    type TestOrchestrator = Orchestrator<MockLauncher, MockParser, MockStore, PassiveEvasion>;

    fn orchestrator(site: &MockSite, store: &MockStore, config: ScraperConfig) -> TestOrchestrator {
        Orchestrator::new(
            MockLauncher::new(site.clone()),
            MockParser,
            store.clone(),
            PassiveEvasion,
            config,
        )
    }

    /// Route a one-entry timeline whose page yields `lines`.
    fn route_token(site: &MockSite, config: &ScraperConfig, token: &str, lines: &str) {
        site.route(
            config.site.timeline_url(token).unwrap(),
            MockReply::ok(r#"[{"timestamp": 100, "latest_insight_cursor": "c1"}]"#),
        );
        site.route(
            config.site.insight_url(token, "c1").unwrap(),
            MockReply::ok(lines),
        );
    }

    #[tokio::test]
    async fn failed_token_is_skipped_and_batch_continues() {
        let config = fast_config();
        let site = MockSite::new();
        site.fail_page_opens(1);
        route_token(&site, &config, "b", "x");
        let store = MockStore::with_tokens(vec![make_token("a"), make_token("b")]);
        let reporter = MockReporter::new();

        let summary = orchestrator(&site, &store, config)
            .run_all_due(&reporter)
            .await
            .unwrap();

        assert_eq!(summary.selected, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.insight_ids(), vec!["b_x"]);
        // Each token marked exactly once, the failed one by the skip path.
        assert_eq!(store.scraped_ids(), vec!["a", "b"]);
        assert!(store.token("b").unwrap().last_scraped_at.is_some());
        assert_eq!(site.engines_closed(), 1);
        assert_eq!(
            reporter.events(),
            vec!["batch:2", "start:a", "failed:a", "wait", "start:b", "done:b:1", "finished:1/2"]
        );
    }

    #[tokio::test]
    async fn abort_mode_stops_batch_but_releases_pool() {
        let config = ScraperConfig {
            skip_on_failure: false,
            ..fast_config()
        };
        let site = MockSite::new();
        site.fail_page_opens(1);
        route_token(&site, &config, "b", "x");
        let store = MockStore::with_tokens(vec![make_token("a"), make_token("b")]);

        let err = orchestrator(&site, &store, config)
            .run_all_due(&MockReporter::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BrowserError(_)));
        assert!(store.scraped_ids().is_empty());
        assert!(store.insight_ids().is_empty());
        assert_eq!(site.engines_closed(), 1);
        assert_eq!(store.state_value(LAST_RUN_KEY), None);
    }

    #[tokio::test]
    async fn batch_cap_defers_the_most_recently_scraped() {
        let config = ScraperConfig {
            tokens_per_batch: 2,
            ..fast_config()
        };
        let site = MockSite::new();
        let now = Utc::now();
        let mut stale = make_token("a");
        stale.last_scraped_at = Some(now - ChronoDuration::hours(3));
        let mut recent = make_token("b");
        recent.last_scraped_at = Some(now - ChronoDuration::hours(2));
        let fresh = make_token("c");
        for id in ["a", "b", "c"] {
            route_token(&site, &config, id, "x");
        }
        let store = MockStore::with_tokens(vec![recent, stale, fresh]);
        let mut orchestrator = orchestrator(&site, &store, config);

        let first = orchestrator.run_all_due(&MockReporter::new()).await.unwrap();
        assert_eq!((first.due, first.selected, first.deferred), (3, 2, 1));
        assert_eq!(store.scraped_ids(), vec!["c", "a"]);

        // The deferred token is picked up next time.
        let second = orchestrator.run_all_due(&MockReporter::new()).await.unwrap();
        assert_eq!((second.selected, second.deferred), (1, 0));
        assert_eq!(store.scraped_ids(), vec!["c", "a", "b"]);
        assert_ne!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_fresh_session() {
        let config = ScraperConfig {
            max_retries_per_token: 1,
            ..fast_config()
        };
        let site = MockSite::new();
        site.fail_page_opens_transiently(1);
        route_token(&site, &config, "a", "x");
        let store = MockStore::with_tokens(vec![make_token("a")]);
        let reporter = MockReporter::new();

        let summary = orchestrator(&site, &store, config)
            .run_all_due(&reporter)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(site.sessions_opened(), 2);
        assert_eq!(site.sessions_closed(), 2);
        assert!(reporter.events().contains(&"retry:a:1".to_string()));
        assert_eq!(store.scraped_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn hanging_page_open_times_out_and_is_retried() {
        let config = ScraperConfig {
            max_retries_per_token: 1,
            ..fast_config()
        };
        let site = MockSite::new();
        site.stall_page_opens(1, std::time::Duration::from_secs(30));
        route_token(&site, &config, "a", "x");
        let store = MockStore::with_tokens(vec![make_token("a")]);
        let reporter = MockReporter::new();

        let summary = orchestrator(&site, &store, config)
            .run_all_due(&reporter)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(site.sessions_opened(), 2);
        assert!(reporter.events().contains(&"retry:a:1".to_string()));
    }

    #[tokio::test]
    async fn browser_errors_are_not_retried() {
        let config = ScraperConfig {
            max_retries_per_token: 2,
            ..fast_config()
        };
        let site = MockSite::new();
        site.fail_page_opens(1);
        let store = MockStore::with_tokens(vec![make_token("a")]);
        let reporter = MockReporter::new();

        orchestrator(&site, &store, config)
            .run_all_due(&reporter)
            .await
            .unwrap();

        assert_eq!(site.sessions_opened(), 1);
        assert_eq!(
            reporter.events(),
            vec!["batch:1", "start:a", "failed:a", "finished:0/1"]
        );
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let config = ScraperConfig {
            max_retries_per_token: 1,
            ..fast_config()
        };
        let site = MockSite::new();
        site.fail_page_opens_transiently(3);
        let store = MockStore::with_tokens(vec![make_token("a")]);

        let summary = orchestrator(&site, &store, config)
            .run_all_due(&MockReporter::new())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(site.sessions_opened(), 2);
        assert_eq!(store.scraped_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn registry_failure_yields_empty_run() {
        let site = MockSite::new();
        let store = MockStore::with_tokens(vec![make_token("a")]);
        store.fail_registry();

        let summary = orchestrator(&site, &store, fast_config())
            .run_all_due(&MockReporter::new())
            .await
            .unwrap();

        assert_eq!(summary.selected, 0);
        assert!(site.launches().is_empty());
        // A pass that never saw the registry is not a completed pass.
        assert_eq!(store.state_value(LAST_RUN_KEY), None);
    }

    #[tokio::test]
    async fn nothing_due_does_not_launch_engine() {
        let site = MockSite::new();
        let mut token = make_token("a");
        token.last_scraped_at = Some(Utc::now());
        let store = MockStore::with_tokens(vec![token]);

        let summary = orchestrator(&site, &store, fast_config())
            .run_all_due(&MockReporter::new())
            .await
            .unwrap();

        assert_eq!(summary.due, 0);
        assert!(site.launches().is_empty());
        assert!(store.state_value(LAST_RUN_KEY).is_some());
    }

    #[tokio::test]
    async fn success_resets_backoff_and_records_last_run() {
        let config = fast_config();
        let site = MockSite::new();
        route_token(&site, &config, "a", "x");
        let store = MockStore::with_tokens(vec![make_token("a")]);
        let mut orchestrator = orchestrator(&site, &store, config);
        orchestrator.backoff().on_rate_limited();

        orchestrator.run_all_due(&MockReporter::new()).await.unwrap();

        assert_eq!(orchestrator.backoff().state(), BackoffState::Normal);
        let last_run = store.state_value(LAST_RUN_KEY).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&last_run).is_ok());
    }

    #[tokio::test]
    async fn rate_limited_tokens_keep_backoff_escalating() {
        let config = fast_config();
        let site = MockSite::new();
        for id in ["a", "b", "c"] {
            site.route(
                config.site.timeline_url(id).unwrap(),
                MockReply::ok(r#"[{"timestamp": 100, "latest_insight_cursor": "c1"}]"#),
            );
            site.route(
                config.site.insight_url(id, "c1").unwrap(),
                MockReply::status(429, "slow down"),
            );
        }
        let store = MockStore::with_tokens(vec![make_token("a"), make_token("b"), make_token("c")]);
        let mut orchestrator = orchestrator(&site, &store, config);

        let summary = orchestrator.run_all_due(&MockReporter::new()).await.unwrap();

        assert_eq!(summary.succeeded, 3);
        assert_eq!(orchestrator.backoff().strikes(), 3);
        assert_eq!(
            orchestrator.backoff().current(),
            orchestrator.config().backoff.max
        );
    }

    #[tokio::test]
    async fn scrape_token_runs_one_token_by_id() {
        let config = fast_config();
        let site = MockSite::new();
        route_token(&site, &config, "a", "x\ny");
        let mut token = make_token("a");
        token.enabled = false;
        let store = MockStore::with_tokens(vec![token]);
        let mut orchestrator = orchestrator(&site, &store, config);

        let inserted = orchestrator.scrape_token("a", &MockReporter::new()).await.unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(site.engines_closed(), 1);

        let err = orchestrator
            .scrape_token("missing", &MockReporter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Generic(_)));
    }

    #[test]
    fn select_batch_keeps_prefix() {
        let due = vec![make_token("a"), make_token("b"), make_token("c")];
        let (batch, deferred) = select_batch(due, 2);
        let ids: Vec<_> = batch.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(deferred, 1);

        let (batch, deferred) = select_batch(vec![make_token("a")], 5);
        assert_eq!(batch.len(), 1);
        assert_eq!(deferred, 0);
    }
}
