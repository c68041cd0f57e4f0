/// Smoke-test for `ChromiumLauncher`.
///
/// Launches Chromium, opens an isolated session with a humanised
/// fingerprint, issues an in-page request to <https://example.com>, and
/// verifies the body contains the expected `<h1>`.
///
/// Run with:
///   cargo run --example browser_smoke --features browser
use insight_client::ChromiumLauncher;
use insight_core::config::ScraperConfig;
use insight_core::evasion::{EvasionPolicy, HumanizedEvasion};
use insight_core::traits::{BrowserEngine, BrowserLauncher, BrowserSession, LaunchOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = ScraperConfig::default();
    let evasion = HumanizedEvasion::from_config(&config);

    println!("Launching headless browser…");
    let engine = ChromiumLauncher::new()
        .launch(&LaunchOptions {
            headless: true,
            proxy: None,
            window_width: config.viewport.width,
            window_height: config.viewport.height,
            args: vec!["--disable-blink-features=AutomationControlled".to_string()],
        })
        .await?;

    let mut session = engine.new_session(&evasion.fingerprint()).await?;
    session.open_page().await?;
    session.hide_automation().await?;

    let url = "https://example.com";
    println!("Navigating to {url} …");
    session.navigate(url).await?;
    session.move_pointer(400.0, 300.0, 10).await?;

    let response = session.request(url, None).await?;
    assert_eq!(response.status, 200, "unexpected status");
    assert!(
        response.body.contains("<h1>Example Domain</h1>"),
        "Expected <h1> not found in response body"
    );

    println!("OK: got {} bytes", response.body.len());
    session.close().await?;
    engine.close().await?;
    Ok(())
}
