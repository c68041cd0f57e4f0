//! Evasion policy: fingerprint randomisation, humanised timing, pointer
//! jitter, and automation-marker suppression.
//!
//! Orchestration code only ever talks to the [`EvasionPolicy`] trait, so the
//! humanised behaviour can be swapped for [`PassiveEvasion`] in tests or when
//! debugging against a local fixture server.

use std::time::Duration;

use rand::Rng;
use rand::seq::IndexedRandom;

use crate::config::{ScraperConfig, Viewport};
use crate::throttle::DelayRange;

/// Browser identity presented by one isolated session.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport: Viewport,
    pub device_scale_factor: f64,
    pub locale: String,
}

/// A single simulated pointer movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerMove {
    pub x: f64,
    pub y: f64,
    /// Intermediate points the pointer travels through.
    pub steps: u32,
    /// Pause after the move completes.
    pub pause: Duration,
}

/// Techniques reducing detection by the source site's defenses.
pub trait EvasionPolicy: Send + Sync {
    /// Identity for a fresh session.
    fn fingerprint(&self) -> Fingerprint;

    /// Whether pages should have automation markers (`navigator.webdriver`
    /// and friends) masked before any script runs.
    fn hides_automation(&self) -> bool;

    /// Wait after the profile page has loaded.
    fn settle_delay(&self) -> Duration;

    /// Wait before each insight-page request.
    fn request_delay(&self) -> Duration;

    /// Wait between two tokens of a batch.
    fn token_delay(&self) -> Duration;

    /// Pointer moves performed before API-like calls.
    fn pointer_path(&self) -> Vec<PointerMove>;
}

/// Randomised behaviour driven by [`ScraperConfig`].
#[derive(Debug, Clone)]
pub struct HumanizedEvasion {
    user_agents: Vec<String>,
    viewport: Viewport,
    device_scale_factors: Vec<f64>,
    locale: String,
    request_delay: DelayRange,
    token_delay: DelayRange,
    page_load_delay: DelayRange,
}

impl HumanizedEvasion {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            user_agents: config.user_agents.clone(),
            viewport: config.viewport,
            device_scale_factors: config.device_scale_factors.clone(),
            locale: config.locale.clone(),
            request_delay: config.request_delay,
            token_delay: config.token_delay,
            page_load_delay: config.page_load_delay,
        }
    }
}

impl EvasionPolicy for HumanizedEvasion {
    fn fingerprint(&self) -> Fingerprint {
        let mut rng = rand::rng();
        let user_agent = self
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_default();
        let device_scale_factor = self
            .device_scale_factors
            .choose(&mut rng)
            .copied()
            .unwrap_or(1.0);

        Fingerprint {
            user_agent,
            viewport: self.viewport,
            device_scale_factor,
            locale: self.locale.clone(),
        }
    }

    fn hides_automation(&self) -> bool {
        true
    }

    fn settle_delay(&self) -> Duration {
        self.page_load_delay.sample()
    }

    fn request_delay(&self) -> Duration {
        self.request_delay.sample()
    }

    fn token_delay(&self) -> Duration {
        self.token_delay.sample()
    }

    fn pointer_path(&self) -> Vec<PointerMove> {
        let mut rng = rand::rng();
        let moves: usize = rng.random_range(2..=4);
        (0..moves)
            .map(|_| PointerMove {
                x: f64::from(rng.random_range(100..=1000u32)),
                y: f64::from(rng.random_range(100..=600u32)),
                steps: rng.random_range(5..=15),
                pause: Duration::from_millis(rng.random_range(100..=300)),
            })
            .collect()
    }
}

/// No delays, no pointer jitter, a fixed fingerprint, markers untouched.
#[derive(Debug, Clone, Default)]
pub struct PassiveEvasion;

impl EvasionPolicy for PassiveEvasion {
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            user_agent: "insight-scraper/0.1".to_string(),
            viewport: Viewport::default(),
            device_scale_factor: 1.0,
            locale: "en-US".to_string(),
        }
    }

    fn hides_automation(&self) -> bool {
        false
    }

    fn settle_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn request_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn token_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn pointer_path(&self) -> Vec<PointerMove> {
        Vec::new()
    }
}
