use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::backoff::BackoffConfig;
use crate::error::AppError;
use crate::throttle::DelayRange;

const DEFAULT_SITE_URL: &str = "https://www.coingecko.com";
const DEFAULT_SITE_HOST: &str = "www.coingecko.com";

const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:123.0) Gecko/20100101 Firefox/123.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_3) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

/// Browser viewport in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// URL layout of the source site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteUrls {
    base: String,
    host: String,
}

impl SiteUrls {
    pub fn new(base: &str) -> Result<Self, AppError> {
        let parsed = Url::parse(base)
            .map_err(|e| AppError::ConfigError(format!("Invalid site URL '{base}': {e}")))?;
        let host = match parsed.host_str() {
            Some(host) if !parsed.cannot_be_a_base() => host.to_string(),
            _ => {
                return Err(AppError::ConfigError(format!(
                    "Site URL '{base}' has no host"
                )));
            }
        };
        Ok(Self {
            base: parsed.to_string(),
            host,
        })
    }

    /// Host of the source site without a leading `www.`, used to recognise
    /// links pointing back at it.
    pub fn origin_host(&self) -> &str {
        self.host.strip_prefix("www.").unwrap_or(&self.host)
    }

    fn with_segments(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = Url::parse(&self.base)
            .map_err(|e| AppError::ConfigError(format!("Invalid site URL '{}': {e}", self.base)))?;
        url.path_segments_mut()
            .map_err(|_| AppError::ConfigError(format!("Site URL '{}' has no path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `{base}/en/coins/{slug}`
    pub fn profile_url(&self, slug: &str) -> Result<String, AppError> {
        Ok(self.with_segments(&["en", "coins", slug])?.to_string())
    }

    /// `{base}/price_charts/{slug}/insight_annotations?timeframe=d90`
    pub fn timeline_url(&self, slug: &str) -> Result<String, AppError> {
        let mut url = self.with_segments(&["price_charts", slug, "insight_annotations"])?;
        url.query_pairs_mut().append_pair("timeframe", "d90");
        Ok(url.to_string())
    }

    /// `{base}/en/coins/{slug}/insights?cursor={cursor}`
    pub fn insight_url(&self, slug: &str, cursor: &str) -> Result<String, AppError> {
        let mut url = self.with_segments(&["en", "coins", slug, "insights"])?;
        url.query_pairs_mut().append_pair("cursor", cursor);
        Ok(url.to_string())
    }
}

impl Default for SiteUrls {
    fn default() -> Self {
        Self {
            base: format!("{DEFAULT_SITE_URL}/"),
            host: DEFAULT_SITE_HOST.to_string(),
        }
    }
}

/// All scraper tunables.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Worker-pool capacity. Keep at 1 unless proxies are configured.
    pub max_concurrent_workers: usize,
    /// Maximum tokens processed per orchestrator pass.
    pub tokens_per_batch: usize,
    /// Interval assigned to newly registered tokens.
    pub default_scrape_interval_minutes: u32,
    /// Wait before each insight-page request.
    pub request_delay: DelayRange,
    /// Wait between two tokens of a batch.
    pub token_delay: DelayRange,
    /// Settle time after loading the profile page.
    pub page_load_delay: DelayRange,
    pub backoff: BackoffConfig,
    /// Extra attempts for a token failing with a retryable error.
    pub max_retries_per_token: u32,
    /// Log and continue on a failed token instead of aborting the batch.
    pub skip_on_failure: bool,
    pub headless: bool,
    pub navigation_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agents: Vec<String>,
    pub viewport: Viewport,
    pub device_scale_factors: Vec<f64>,
    pub locale: String,
    pub proxies: Vec<String>,
    pub site: SiteUrls,
    /// Use a content hash instead of a random suffix for entries without a
    /// source-provided id.
    pub stable_fallback_ids: bool,
    /// Maximum characters kept from a source link title.
    pub source_title_limit: usize,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 1,
            tokens_per_batch: 5,
            default_scrape_interval_minutes: 60,
            request_delay: DelayRange {
                min: Duration::from_secs(8),
                max: Duration::from_secs(15),
            },
            token_delay: DelayRange {
                min: Duration::from_secs(30),
                max: Duration::from_secs(60),
            },
            page_load_delay: DelayRange {
                min: Duration::from_secs(3),
                max: Duration::from_secs(6),
            },
            backoff: BackoffConfig::default(),
            max_retries_per_token: 2,
            skip_on_failure: true,
            headless: true,
            navigation_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            viewport: Viewport::default(),
            device_scale_factors: vec![1.0, 2.0],
            locale: "en-US".to_string(),
            proxies: Vec::new(),
            site: SiteUrls::default(),
            stable_fallback_ids: false,
            source_title_limit: 200,
        }
    }
}

impl ScraperConfig {
    /// Read configuration from environment variables, falling back to the
    /// defaults for anything unset.
    ///
    /// Delays and timeouts are given in (fractional) seconds. `PROXY_LIST`
    /// is comma separated, `USER_AGENTS` is `|` separated.
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let request_delay = env_range("REQUEST_DELAY", defaults.request_delay)?;
        let token_delay = env_range("TOKEN_DELAY", defaults.token_delay)?;
        let page_load_delay = env_range("PAGE_LOAD_DELAY", defaults.page_load_delay)?;

        let backoff = BackoffConfig {
            initial: env_secs("RATE_LIMIT_BACKOFF_INITIAL", defaults.backoff.initial)?,
            max: env_secs("RATE_LIMIT_BACKOFF_MAX", defaults.backoff.max)?,
            multiplier: env_parse("RATE_LIMIT_BACKOFF_MULTIPLIER", defaults.backoff.multiplier)?,
        };

        let proxies = std::env::var("PROXY_LIST")
            .map(|raw| split_list(&raw, ','))
            .unwrap_or_default();

        let user_agents = match std::env::var("USER_AGENTS") {
            Ok(raw) if !raw.trim().is_empty() => split_list(&raw, '|'),
            _ => defaults.user_agents,
        };

        let site = match std::env::var("INSIGHT_SITE_URL") {
            Ok(raw) => SiteUrls::new(raw.trim())?,
            Err(_) => defaults.site,
        };

        let config = Self {
            max_concurrent_workers: env_parse("MAX_WORKERS", defaults.max_concurrent_workers)?,
            tokens_per_batch: env_parse("TOKENS_PER_BATCH", defaults.tokens_per_batch)?,
            default_scrape_interval_minutes: env_parse(
                "SCRAPE_INTERVAL",
                defaults.default_scrape_interval_minutes,
            )?,
            request_delay,
            token_delay,
            page_load_delay,
            backoff,
            max_retries_per_token: env_parse(
                "MAX_RETRIES_PER_TOKEN",
                defaults.max_retries_per_token,
            )?,
            skip_on_failure: env_bool("SKIP_ON_FAILURE", defaults.skip_on_failure)?,
            headless: env_bool("HEADLESS", defaults.headless)?,
            navigation_timeout: env_secs("NAVIGATION_TIMEOUT", defaults.navigation_timeout)?,
            request_timeout: env_secs("REQUEST_TIMEOUT", defaults.request_timeout)?,
            user_agents,
            viewport: defaults.viewport,
            device_scale_factors: defaults.device_scale_factors,
            locale: defaults.locale,
            proxies,
            site,
            stable_fallback_ids: env_bool("STABLE_FALLBACK_IDS", defaults.stable_fallback_ids)?,
            source_title_limit: defaults.source_title_limit,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent_workers == 0 {
            return Err(AppError::ConfigError("MAX_WORKERS must be at least 1".into()));
        }
        if self.tokens_per_batch == 0 {
            return Err(AppError::ConfigError(
                "TOKENS_PER_BATCH must be at least 1".into(),
            ));
        }
        if self.default_scrape_interval_minutes == 0 {
            return Err(AppError::ConfigError(
                "SCRAPE_INTERVAL must be greater than zero".into(),
            ));
        }
        if self.backoff.multiplier < 1.0 || !self.backoff.multiplier.is_finite() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_BACKOFF_MULTIPLIER must be >= 1".into(),
            ));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_BACKOFF_INITIAL must not exceed RATE_LIMIT_BACKOFF_MAX".into(),
            ));
        }
        if self.user_agents.is_empty() {
            return Err(AppError::ConfigError(
                "at least one user agent is required".into(),
            ));
        }
        if self.device_scale_factors.is_empty() {
            return Err(AppError::ConfigError(
                "at least one device scale factor is required".into(),
            ));
        }
        if self.max_concurrent_workers > 1 && self.proxies.is_empty() {
            tracing::warn!(
                workers = self.max_concurrent_workers,
                "Running more than one worker without proxies raises the block risk"
            );
        }
        Ok(())
    }
}

fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}'"))
        }),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(AppError::ConfigError(format!(
                "Invalid {key} '{raw}': expected true or false"
            ))),
        },
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, AppError> {
    let secs: f64 = env_parse(key, default.as_secs_f64())?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(AppError::ConfigError(format!(
            "Invalid {key} '{secs}': must be non-negative seconds"
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn env_range(prefix: &str, default: DelayRange) -> Result<DelayRange, AppError> {
    let min = env_secs(&format!("{prefix}_MIN"), default.min)?;
    let max = env_secs(&format!("{prefix}_MAX"), default.max)?;
    DelayRange::new(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_conservative_profile() {
        let config = ScraperConfig::default();
        assert_eq!(config.max_concurrent_workers, 1);
        assert_eq!(config.tokens_per_batch, 5);
        assert_eq!(config.request_delay.min, Duration::from_secs(8));
        assert_eq!(config.request_delay.max, Duration::from_secs(15));
        assert_eq!(config.token_delay.max, Duration::from_secs(60));
        assert_eq!(config.backoff.initial, Duration::from_secs(60));
        assert_eq!(config.max_retries_per_token, 2);
        assert!(config.skip_on_failure);
        assert!(config.proxies.is_empty());
        assert_eq!(config.user_agents.len(), 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let config = ScraperConfig {
            tokens_per_batch: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut config = ScraperConfig::default();
        config.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn site_urls_follow_layout() {
        let site = SiteUrls::default();
        assert_eq!(
            site.profile_url("bitcoin").unwrap(),
            "https://www.coingecko.com/en/coins/bitcoin"
        );
        assert_eq!(
            site.timeline_url("bitcoin").unwrap(),
            "https://www.coingecko.com/price_charts/bitcoin/insight_annotations?timeframe=d90"
        );
        assert_eq!(
            site.insight_url("bitcoin", "abc").unwrap(),
            "https://www.coingecko.com/en/coins/bitcoin/insights?cursor=abc"
        );
        assert_eq!(site.origin_host(), "coingecko.com");
    }

    #[test]
    fn insight_url_encodes_cursor() {
        let site = SiteUrls::new("http://localhost:8080/").unwrap();
        let url = site.insight_url("eth", "a b&c=").unwrap();
        assert_eq!(
            url,
            "http://localhost:8080/en/coins/eth/insights?cursor=a+b%26c%3D"
        );
    }

    #[test]
    fn site_url_must_have_host() {
        assert!(SiteUrls::new("not a url").is_err());
        assert!(SiteUrls::new("mailto:someone@example.com").is_err());
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(
            split_list(" http://a:1 , ,http://b:2,", ','),
            vec!["http://a:1".to_string(), "http://b:2".to_string()]
        );
    }
}
