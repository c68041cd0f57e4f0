pub mod backoff;
pub mod config;
pub mod error;
pub mod evasion;
pub mod models;
pub mod orchestrator;
pub mod schedule;
pub mod session_pool;
pub mod throttle;
pub mod token_fetcher;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use backoff::{BackoffConfig, BackoffState, RateLimitBackoff};
pub use config::{ScraperConfig, SiteUrls, Viewport};
pub use error::AppError;
pub use evasion::{EvasionPolicy, Fingerprint, HumanizedEvasion, PassiveEvasion};
pub use models::{InsightRecord, InsightSource, NewToken, TimelineEntry, Token, compute_hash};
pub use orchestrator::{BatchSummary, Orchestrator, ScrapeReporter, TracingScrapeReporter};
pub use traits::{
    BrowserEngine, BrowserLauncher, BrowserSession, InsightParser, InsightStore, StateStore,
    TokenRegistry,
};
