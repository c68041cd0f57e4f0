//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::BackoffConfig;
use crate::config::ScraperConfig;
use crate::error::AppError;
use crate::evasion::Fingerprint;
use crate::models::{InsightRecord, NewToken, Token, insight_id, select_due};
use crate::orchestrator::{ScrapeEvent, ScrapeReporter};
use crate::throttle::DelayRange;
use crate::traits::{
    BrowserEngine, BrowserLauncher, BrowserSession, InsightParser, InsightStore, LaunchOptions,
    SessionResponse, StateStore, TokenRegistry,
};

// ---------------------------------------------------------------------------
// MockSite
// ---------------------------------------------------------------------------

/// Scripted answer for one in-session request.
#[derive(Debug, Clone)]
pub enum MockReply {
    Status { status: u16, body: String },
    NetworkError(String),
    /// Sleep before answering 200 with an empty body.
    Stall(Duration),
}

impl MockReply {
    pub fn ok(body: &str) -> Self {
        Self::Status {
            status: 200,
            body: body.to_string(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::Status {
            status,
            body: body.to_string(),
        }
    }

    pub fn network_error(message: &str) -> Self {
        Self::NetworkError(message.to_string())
    }

    pub fn stall(duration: Duration) -> Self {
        Self::Stall(duration)
    }
}

/// Scripted misbehaviour for one upcoming `open_page` call.
#[derive(Debug, Clone, Copy)]
enum OpenFailure {
    Broken,
    Transient,
    Stall(Duration),
}

#[derive(Default)]
struct SiteState {
    /// Per-URL reply queue. The last reply is sticky.
    routes: HashMap<String, Vec<MockReply>>,
    open_failures: Vec<OpenFailure>,
    navigation_fails: bool,
    navigation_stall: Option<Duration>,
    engine_close_fails: bool,
    launches: Vec<LaunchOptions>,
    fingerprints: Vec<Fingerprint>,
    requests: Vec<String>,
    navigations: Vec<String>,
    pointer_moves: usize,
    automation_hidden: usize,
    sessions_opened: usize,
    sessions_closed: usize,
    engines_closed: usize,
}

/// Fake upstream site shared by the mock launcher, engines and sessions.
#[derive(Clone, Default)]
pub struct MockSite {
    state: Arc<Mutex<SiteState>>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` for `url`. Unrouted URLs answer 404.
    pub fn route(&self, url: impl Into<String>, reply: MockReply) {
        self.state
            .lock()
            .unwrap()
            .routes
            .entry(url.into())
            .or_default()
            .push(reply);
    }

    fn queue_open_failures(&self, failure: OpenFailure, n: usize) {
        self.state
            .lock()
            .unwrap()
            .open_failures
            .extend(std::iter::repeat_n(failure, n));
    }

    /// Fail the next `n` page opens with a non-retryable error.
    pub fn fail_page_opens(&self, n: usize) {
        self.queue_open_failures(OpenFailure::Broken, n);
    }

    /// Fail the next `n` page opens with a retryable network error.
    pub fn fail_page_opens_transiently(&self, n: usize) {
        self.queue_open_failures(OpenFailure::Transient, n);
    }

    /// Make the next `n` page opens hang for `duration` before succeeding.
    pub fn stall_page_opens(&self, n: usize, duration: Duration) {
        self.queue_open_failures(OpenFailure::Stall(duration), n);
    }

    pub fn fail_navigation(&self) {
        self.state.lock().unwrap().navigation_fails = true;
    }

    /// Make every navigation hang for `duration` before completing.
    pub fn stall_navigation(&self, duration: Duration) {
        self.state.lock().unwrap().navigation_stall = Some(duration);
    }

    pub fn fail_engine_close(&self) {
        self.state.lock().unwrap().engine_close_fails = true;
    }

    pub fn launches(&self) -> Vec<LaunchOptions> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.state.lock().unwrap().fingerprints.clone()
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn pointer_moves(&self) -> usize {
        self.state.lock().unwrap().pointer_moves
    }

    pub fn automation_hidden(&self) -> usize {
        self.state.lock().unwrap().automation_hidden
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().unwrap().sessions_closed
    }

    pub fn engines_closed(&self) -> usize {
        self.state.lock().unwrap().engines_closed
    }

    fn next_reply(&self, url: &str) -> MockReply {
        let mut state = self.state.lock().unwrap();
        state.requests.push(url.to_string());
        match state.routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => MockReply::status(404, "not found"),
        }
    }
}

// ---------------------------------------------------------------------------
// MockLauncher / MockEngine / MockSession
// ---------------------------------------------------------------------------

pub fn test_launch_options() -> LaunchOptions {
    LaunchOptions {
        headless: true,
        proxy: None,
        window_width: 1280,
        window_height: 800,
        args: Vec::new(),
    }
}

#[derive(Clone)]
pub struct MockLauncher {
    site: MockSite,
}

impl MockLauncher {
    pub fn new(site: MockSite) -> Self {
        Self { site }
    }
}

impl BrowserLauncher for MockLauncher {
    type Engine = MockEngine;

    async fn launch(&self, options: &LaunchOptions) -> Result<MockEngine, AppError> {
        self.site.state.lock().unwrap().launches.push(options.clone());
        Ok(MockEngine {
            site: self.site.clone(),
        })
    }
}

pub struct MockEngine {
    site: MockSite,
}

impl BrowserEngine for MockEngine {
    type Session = MockSession;

    async fn new_session(&self, fingerprint: &Fingerprint) -> Result<MockSession, AppError> {
        let mut state = self.site.state.lock().unwrap();
        state.fingerprints.push(fingerprint.clone());
        state.sessions_opened += 1;
        Ok(MockSession {
            site: self.site.clone(),
            page_open: false,
        })
    }

    async fn close(&self) -> Result<(), AppError> {
        let mut state = self.site.state.lock().unwrap();
        state.engines_closed += 1;
        if state.engine_close_fails {
            return Err(AppError::BrowserError("engine refused to close".into()));
        }
        Ok(())
    }
}

pub struct MockSession {
    site: MockSite,
    page_open: bool,
}

impl MockSession {
    fn require_page(&self) -> Result<(), AppError> {
        if self.page_open {
            Ok(())
        } else {
            Err(AppError::BrowserError("no page open".into()))
        }
    }
}

impl BrowserSession for MockSession {
    async fn open_page(&mut self) -> Result<(), AppError> {
        let failure = {
            let mut state = self.site.state.lock().unwrap();
            if state.open_failures.is_empty() {
                None
            } else {
                Some(state.open_failures.remove(0))
            }
        };
        match failure {
            Some(OpenFailure::Transient) => {
                Err(AppError::NetworkError("browser connection dropped".into()))
            }
            Some(OpenFailure::Broken) => Err(AppError::BrowserError("page crashed on open".into())),
            Some(OpenFailure::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                self.page_open = true;
                Ok(())
            }
            None => {
                self.page_open = true;
                Ok(())
            }
        }
    }

    async fn hide_automation(&self) -> Result<(), AppError> {
        self.require_page()?;
        self.site.state.lock().unwrap().automation_hidden += 1;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), AppError> {
        self.require_page()?;
        let stall = {
            let mut state = self.site.state.lock().unwrap();
            state.navigations.push(url.to_string());
            if state.navigation_fails {
                return Err(AppError::NetworkError("navigation aborted".into()));
            }
            state.navigation_stall
        };
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }
        Ok(())
    }

    async fn move_pointer(&self, _x: f64, _y: f64, _steps: u32) -> Result<(), AppError> {
        self.require_page()?;
        self.site.state.lock().unwrap().pointer_moves += 1;
        Ok(())
    }

    async fn request(&self, url: &str, _accept: Option<&str>) -> Result<SessionResponse, AppError> {
        self.require_page()?;
        match self.site.next_reply(url) {
            MockReply::Status { status, body } => Ok(SessionResponse { status, body }),
            MockReply::NetworkError(message) => Err(AppError::NetworkError(message)),
            MockReply::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(SessionResponse {
                    status: 200,
                    body: String::new(),
                })
            }
        }
    }

    async fn close(&mut self) -> Result<(), AppError> {
        self.page_open = false;
        self.site.state.lock().unwrap().sessions_closed += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Every non-empty markup line becomes one insight with entry id = line.
#[derive(Clone, Default)]
pub struct MockParser;

impl InsightParser for MockParser {
    fn parse(&self, token_id: &str, markup: &str, timestamp: i64) -> Vec<InsightRecord> {
        markup
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| InsightRecord {
                id: insight_id(token_id, line),
                token_id: token_id.to_string(),
                timestamp,
                title: line.to_string(),
                content: format!("{line} body"),
                source_count: 0,
                sources: Vec::new(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreState {
    tokens: Vec<Token>,
    insights: BTreeMap<String, InsightRecord>,
    state: HashMap<String, String>,
    scraped: Vec<(String, DateTime<Utc>)>,
    fail_registry: bool,
    fail_exists: bool,
    fail_upserts: bool,
}

/// In-memory registry, insight store and state store in one.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: Vec<Token>) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().tokens = tokens;
        store
    }

    /// Make the due-token lookup (and other registry reads) fail.
    pub fn fail_registry(&self) {
        self.inner.lock().unwrap().fail_registry = true;
    }

    pub fn fail_exists_checks(&self) {
        self.inner.lock().unwrap().fail_exists = true;
    }

    pub fn fail_upserts(&self) {
        self.inner.lock().unwrap().fail_upserts = true;
    }

    /// Stored insight ids in sorted order.
    pub fn insight_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().insights.keys().cloned().collect()
    }

    pub fn insight(&self, id: &str) -> Option<InsightRecord> {
        self.inner.lock().unwrap().insights.get(id).cloned()
    }

    /// Token ids in the order they were marked scraped.
    pub fn scraped_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .scraped
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn token(&self, id: &str) -> Option<Token> {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn state_value(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().state.get(key).cloned()
    }

    fn registry_guard(&self) -> Result<(), AppError> {
        if self.inner.lock().unwrap().fail_registry {
            return Err(AppError::DatabaseError("registry unavailable".into()));
        }
        Ok(())
    }
}

impl TokenRegistry for MockStore {
    async fn list_tokens(&self) -> Result<Vec<Token>, AppError> {
        self.registry_guard()?;
        let mut tokens = self.inner.lock().unwrap().tokens.clone();
        tokens.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tokens)
    }

    async fn list_enabled(&self) -> Result<Vec<Token>, AppError> {
        let tokens = self.list_tokens().await?;
        Ok(tokens.into_iter().filter(|t| t.enabled).collect())
    }

    async fn due_tokens(&self, now: DateTime<Utc>) -> Result<Vec<Token>, AppError> {
        self.registry_guard()?;
        let tokens = self.inner.lock().unwrap().tokens.clone();
        Ok(select_due(tokens, now))
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Token>, AppError> {
        self.registry_guard()?;
        Ok(self.token(token_id))
    }

    async fn mark_scraped(&self, token_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(token) = inner.tokens.iter_mut().find(|t| t.id == token_id) {
            token.last_scraped_at = Some(at);
        }
        inner.scraped.push((token_id.to_string(), at));
        Ok(())
    }

    async fn create_token(&self, token: &NewToken) -> Result<Token, AppError> {
        token.validate()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.tokens.iter().any(|t| t.id == token.id) {
            return Err(AppError::DatabaseError(format!(
                "token '{}' already exists",
                token.id
            )));
        }
        let created = Token {
            id: token.id.clone(),
            name: token.name.clone(),
            enabled: true,
            scrape_interval_minutes: token.scrape_interval_minutes,
            last_scraped_at: None,
        };
        inner.tokens.push(created.clone());
        Ok(created)
    }

    async fn delete_token(&self, token_id: &str) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| t.id != token_id);
        Ok(inner.tokens.len() != before)
    }

    async fn set_enabled(&self, token_id: &str, enabled: bool) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tokens.iter_mut().find(|t| t.id == token_id) {
            Some(token) => {
                token.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl InsightStore for MockStore {
    async fn insight_exists(&self, id: &str) -> Result<bool, AppError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_exists {
            return Err(AppError::DatabaseError("exists check failed".into()));
        }
        Ok(inner.insights.contains_key(id))
    }

    async fn upsert_insight(&self, record: &InsightRecord) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_upserts {
            return Err(AppError::DatabaseError("write rejected".into()));
        }
        inner.insights.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn latest_insights(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<InsightRecord>, AppError> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .insights
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }
}

impl StateStore for MockStore {
    async fn get_state(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.state_value(key))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .state
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records every event as a short string such as `done:btc:2`.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ScrapeReporter for MockReporter {
    fn report(&self, event: ScrapeEvent<'_>) {
        let line = match event {
            ScrapeEvent::BatchStarted { selected, .. } => format!("batch:{selected}"),
            ScrapeEvent::TokenStarted { token_id, .. } => format!("start:{token_id}"),
            ScrapeEvent::TokenRetrying {
                token_id, attempt, ..
            } => format!("retry:{token_id}:{attempt}"),
            ScrapeEvent::TokenSucceeded { token_id, inserted } => {
                format!("done:{token_id}:{inserted}")
            }
            ScrapeEvent::TokenFailed { token_id, .. } => format!("failed:{token_id}"),
            ScrapeEvent::Waiting { .. } => "wait".to_string(),
            ScrapeEvent::BatchFinished { summary } => {
                format!("finished:{}/{}", summary.succeeded, summary.selected)
            }
        };
        self.events.lock().unwrap().push(line);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// An enabled, never-scraped token with a 60 minute interval.
pub fn make_token(id: &str) -> Token {
    Token {
        id: id.to_string(),
        name: id.to_uppercase(),
        enabled: true,
        scrape_interval_minutes: 60,
        last_scraped_at: None,
    }
}

/// Configuration with no human-like delays and millisecond backoff.
pub fn fast_config() -> ScraperConfig {
    ScraperConfig {
        request_delay: DelayRange::zero(),
        token_delay: DelayRange::zero(),
        page_load_delay: DelayRange::zero(),
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            multiplier: 2.0,
        },
        max_retries_per_token: 0,
        navigation_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}
