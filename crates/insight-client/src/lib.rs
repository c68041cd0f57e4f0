#[cfg(feature = "browser")]
pub mod browser;
pub mod extractor;

#[cfg(feature = "browser")]
pub use browser::{ChromiumEngine, ChromiumLauncher, ChromiumSession};
pub use extractor::GeckoInsightExtractor;
