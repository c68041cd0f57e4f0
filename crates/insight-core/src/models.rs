use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// A tracked market entity whose insight feed is scraped.
///
/// `id` is also the slug used in the source site's URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub scrape_interval_minutes: u32,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl Token {
    /// A token is due when it was never scraped, or when at least
    /// `scrape_interval_minutes` have elapsed since the last scrape.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_scraped_at {
            None => true,
            Some(last) => {
                now - last >= TimeDelta::minutes(i64::from(self.scrape_interval_minutes))
            }
        }
    }

    /// Display label for logs: the name, or the id when the name is blank.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Request to register a new token.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub id: String,
    pub name: String,
    pub scrape_interval_minutes: u32,
}

impl NewToken {
    pub fn new(id: impl Into<String>, name: impl Into<String>, interval_minutes: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            scrape_interval_minutes: interval_minutes,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::ConfigError("token id must not be empty".into()));
        }
        if self.scrape_interval_minutes == 0 {
            return Err(AppError::ConfigError(format!(
                "scrape interval for '{}' must be greater than zero",
                self.id
            )));
        }
        Ok(())
    }
}

/// Filter `tokens` down to the due set, ordered never-scraped first, then
/// by oldest `last_scraped_at`, ties broken by id.
pub fn select_due(tokens: Vec<Token>, now: DateTime<Utc>) -> Vec<Token> {
    let mut due: Vec<Token> = tokens
        .into_iter()
        .filter(|t| t.enabled && t.is_due(now))
        .collect();
    // `None` sorts before `Some`, so never-scraped tokens lead.
    due.sort_by(|a, b| {
        a.last_scraped_at
            .cmp(&b.last_scraped_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    due
}

/// One point on a token's insight timeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimelineEntry {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "latest_insight_cursor", default)]
    pub cursor: Option<String>,
}

/// An outbound link cited by an insight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightSource {
    pub url: String,
    pub title: String,
}

/// A persisted insight annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightRecord {
    /// `{token_id}_{entry_id}`, unique across tokens.
    pub id: String,
    pub token_id: String,
    pub timestamp: i64,
    pub title: String,
    pub content: String,
    pub source_count: i32,
    pub sources: Vec<InsightSource>,
}

/// Compose the store-wide record id for an entry of a token.
pub fn insight_id(token_id: &str, entry_id: &str) -> String {
    format!("{token_id}_{entry_id}")
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
