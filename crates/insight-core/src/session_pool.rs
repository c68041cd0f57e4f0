//! Engine and session lifecycle.
//!
//! The pool launches engine instances with evasion-oriented flags, rotates
//! through configured proxies, and vends isolated sessions. Concurrency is
//! bounded by a worker-slot semaphore; with the default capacity of 1 a
//! single engine and a single live session exist at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{ScraperConfig, Viewport};
use crate::error::AppError;
use crate::evasion::EvasionPolicy;
use crate::traits::{BrowserEngine, BrowserLauncher, LaunchOptions};

/// Session alias for a launcher's engine.
pub type SessionOf<L> = <<L as BrowserLauncher>::Engine as BrowserEngine>::Session;

pub struct SessionPool<L: BrowserLauncher> {
    launcher: L,
    headless: bool,
    window: Viewport,
    proxies: Vec<String>,
    proxy_cursor: AtomicUsize,
    capacity: usize,
    slots: Option<Arc<Semaphore>>,
    engines: Vec<Arc<L::Engine>>,
}

impl<L: BrowserLauncher> SessionPool<L> {
    pub fn new(launcher: L, config: &ScraperConfig) -> Self {
        Self {
            launcher,
            headless: config.headless,
            window: config.viewport,
            proxies: config.proxies.clone(),
            proxy_cursor: AtomicUsize::new(0),
            capacity: config.max_concurrent_workers.max(1),
            slots: None,
            engines: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.slots.is_some()
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Make the pool live. Calling it again while live is a no-op.
    pub fn start(&mut self) {
        if self.slots.is_some() {
            return;
        }
        self.slots = Some(Arc::new(Semaphore::new(self.capacity)));
        tracing::info!(capacity = self.capacity, "Session pool started");
    }

    /// Close every launched engine, then release the pool.
    ///
    /// Individual close failures are logged and ignored so one wedged
    /// engine never keeps the others alive.
    pub async fn stop(&mut self) {
        for engine in self.engines.drain(..) {
            if let Err(e) = engine.close().await {
                tracing::warn!(error = %e, "Failed to close browser engine");
            }
        }
        if let Some(slots) = self.slots.take() {
            slots.close();
        }
        tracing::info!("Session pool stopped");
    }

    /// Next proxy by round-robin, or `None` when running proxy-free.
    fn next_proxy(&self) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        let index = self.proxy_cursor.fetch_add(1, Ordering::Relaxed);
        Some(self.proxies[index % self.proxies.len()].clone())
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            headless: self.headless,
            proxy: self.next_proxy(),
            window_width: self.window.width,
            window_height: self.window.height,
            args: vec![
                "--disable-blink-features=AutomationControlled".to_string(),
                "--no-sandbox".to_string(),
                "--disable-infobars".to_string(),
                format!("--window-size={},{}", self.window.width, self.window.height),
            ],
        }
    }

    /// Launch a new engine instance, bound to the next proxy if any.
    pub async fn acquire_engine(&mut self) -> Result<Arc<L::Engine>, AppError> {
        if !self.is_running() {
            return Err(AppError::BrowserError(
                "session pool is not started".to_string(),
            ));
        }

        let options = self.launch_options();
        match &options.proxy {
            Some(proxy) => {
                let shown: String = proxy.chars().take(30).collect();
                tracing::info!(proxy = %shown, "Launching browser with proxy");
            }
            None => tracing::info!("Launching browser without proxy"),
        }

        let engine = Arc::new(self.launcher.launch(&options).await?);
        self.engines.push(Arc::clone(&engine));
        Ok(engine)
    }

    /// Create an isolated session on `engine` with a fresh fingerprint.
    pub async fn new_session<E: EvasionPolicy>(
        &self,
        engine: &L::Engine,
        evasion: &E,
    ) -> Result<SessionOf<L>, AppError> {
        let fingerprint = evasion.fingerprint();
        tracing::debug!(
            user_agent = %fingerprint.user_agent,
            scale = fingerprint.device_scale_factor,
            "Creating browser session"
        );
        engine.new_session(&fingerprint).await
    }

    /// Wait for a free worker slot. The slot is held until the permit drops.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, AppError> {
        let slots = self
            .slots
            .as_ref()
            .ok_or_else(|| AppError::BrowserError("session pool is not started".to_string()))?;
        Arc::clone(slots)
            .acquire_owned()
            .await
            .map_err(|_| AppError::BrowserError("session pool was stopped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evasion::PassiveEvasion;
    use crate::testutil::{MockLauncher, MockSite};

    fn config_with_proxies(proxies: &[&str]) -> ScraperConfig {
        ScraperConfig {
            proxies: proxies.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acquire_engine_requires_start() {
        let site = MockSite::new();
        let mut pool = SessionPool::new(MockLauncher::new(site), &ScraperConfig::default());
        assert!(pool.acquire_engine().await.is_err());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let site = MockSite::new();
        let mut pool = SessionPool::new(MockLauncher::new(site), &ScraperConfig::default());
        pool.start();
        let _slot = pool.acquire_slot().await.unwrap();
        pool.start();
        // The second start must not have replaced the semaphore.
        let again = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            pool.acquire_slot(),
        )
        .await;
        assert!(again.is_err(), "capacity-1 pool handed out a second slot");
    }

    #[tokio::test]
    async fn launch_flags_hide_automation() {
        let site = MockSite::new();
        let mut pool = SessionPool::new(MockLauncher::new(site.clone()), &ScraperConfig::default());
        pool.start();
        pool.acquire_engine().await.unwrap();

        let launches = site.launches();
        assert_eq!(launches.len(), 1);
        let options = &launches[0];
        assert!(options.headless);
        assert!(options.proxy.is_none());
        assert!(
            options
                .args
                .contains(&"--disable-blink-features=AutomationControlled".to_string())
        );
        assert!(options.args.contains(&"--window-size=1280,800".to_string()));
    }

    #[tokio::test]
    async fn proxies_rotate_round_robin() {
        let site = MockSite::new();
        let config = config_with_proxies(&["http://p1:8080", "http://p2:8080"]);
        let mut pool = SessionPool::new(MockLauncher::new(site.clone()), &config);
        pool.start();
        for _ in 0..3 {
            pool.acquire_engine().await.unwrap();
        }

        let proxies: Vec<_> = site.launches().into_iter().map(|o| o.proxy).collect();
        assert_eq!(
            proxies,
            vec![
                Some("http://p1:8080".to_string()),
                Some("http://p2:8080".to_string()),
                Some("http://p1:8080".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn stop_closes_engines_despite_errors() {
        let site = MockSite::new();
        site.fail_engine_close();
        let mut pool = SessionPool::new(MockLauncher::new(site.clone()), &ScraperConfig::default());
        pool.start();
        pool.acquire_engine().await.unwrap();
        pool.acquire_engine().await.unwrap();

        pool.stop().await;

        assert_eq!(site.engines_closed(), 2);
        assert_eq!(pool.engine_count(), 0);
        assert!(!pool.is_running());
        assert!(pool.acquire_slot().await.is_err());
    }

    #[tokio::test]
    async fn new_session_uses_policy_fingerprint() {
        let site = MockSite::new();
        let mut pool = SessionPool::new(MockLauncher::new(site.clone()), &ScraperConfig::default());
        pool.start();
        let engine = pool.acquire_engine().await.unwrap();
        let _session = pool.new_session(&engine, &PassiveEvasion).await.unwrap();

        let fingerprints = site.fingerprints();
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(fingerprints[0].user_agent, "insight-scraper/0.1");
    }
}
