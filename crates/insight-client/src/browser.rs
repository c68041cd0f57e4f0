use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use insight_core::error::AppError;
use insight_core::evasion::Fingerprint;
use insight_core::traits::{
    BrowserEngine, BrowserLauncher, BrowserSession, LaunchOptions, SessionResponse,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Masks the markers headless Chromium exposes to page scripts.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Maps a CDP failure onto the error taxonomy.
///
/// Transport trouble between us and the browser (dropped websocket, closed
/// channel, lost or late responses) is transient and retried with a fresh
/// session. Protocol errors reported by Chrome itself are not.
fn cdp_error(context: &str, e: CdpError) -> AppError {
    match &e {
        CdpError::Timeout
        | CdpError::NoResponse
        | CdpError::Ws(_)
        | CdpError::Io(_)
        | CdpError::ChannelSendError(_) => AppError::NetworkError(format!("{context}: {e}")),
        _ => AppError::BrowserError(format!("{context}: {e}")),
    }
}

/// Launches Chromium over the Chrome DevTools Protocol.
///
/// Requires a Chromium / Chrome binary reachable via `$CHROME_BIN`, one of
/// the well-known install paths, or the default lookup of `chromiumoxide`.
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    executable: Option<PathBuf>,
}

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self {
            executable: Self::find_chrome_binary(),
        }
    }

    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(path.into()),
        }
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// On systems where Chromium is installed via **snap**, the wrapper at
    /// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode.
    /// We look for the real binary inside the snap first, then fall back to
    /// well-known system paths.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            // Snap (Ubuntu default)
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            // Flatpak
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl BrowserLauncher for ChromiumLauncher {
    type Engine = ChromiumEngine;

    async fn launch(&self, options: &LaunchOptions) -> Result<ChromiumEngine, AppError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .disable_default_args()
            .window_size(options.window_width, options.window_height);

        if let Some(bin) = &self.executable {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        builder = if options.headless {
            builder.arg("--headless=new")
        } else {
            builder.with_head()
        };
        if let Some(proxy) = &options.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        for arg in &options.args {
            builder = builder.arg(arg);
        }

        let config = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::BrowserError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(ChromiumEngine {
            browser: Arc::new(Mutex::new(browser)),
            handler: StdMutex::new(Some(handler_task)),
        })
    }
}

/// One running Chromium process.
pub struct ChromiumEngine {
    browser: Arc<Mutex<Browser>>,
    handler: StdMutex<Option<JoinHandle<()>>>,
}

impl BrowserEngine for ChromiumEngine {
    type Session = ChromiumSession;

    async fn new_session(&self, fingerprint: &Fingerprint) -> Result<ChromiumSession, AppError> {
        let context = self
            .browser
            .lock()
            .await
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| cdp_error("Failed to create context", e))?;

        Ok(ChromiumSession {
            browser: Arc::clone(&self.browser),
            context_id: Some(context.result.browser_context_id),
            fingerprint: fingerprint.clone(),
            page: None,
            pointer: StdMutex::new((0.0, 0.0)),
        })
    }

    async fn close(&self) -> Result<(), AppError> {
        let result = {
            let mut browser = self.browser.lock().await;
            match browser.close().await {
                Ok(_) => {
                    let _ = browser.wait().await;
                    Ok(())
                }
                Err(e) => Err(AppError::BrowserError(format!("Failed to close browser: {e}"))),
            }
        };

        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handler) = handler {
            handler.abort();
        }
        result
    }
}

#[derive(Deserialize)]
struct FetchOutcome {
    status: u16,
    body: String,
}

/// An isolated browser context (own cookies and storage) with one page.
pub struct ChromiumSession {
    browser: Arc<Mutex<Browser>>,
    context_id: Option<BrowserContextId>,
    fingerprint: Fingerprint,
    page: Option<Page>,
    pointer: StdMutex<(f64, f64)>,
}

impl ChromiumSession {
    fn page(&self) -> Result<&Page, AppError> {
        self.page
            .as_ref()
            .ok_or_else(|| AppError::BrowserError("no page open".into()))
    }

    async fn apply_fingerprint(&self, page: &Page) -> Result<(), AppError> {
        let fp = &self.fingerprint;
        let user_agent = SetUserAgentOverrideParams::builder()
            .user_agent(fp.user_agent.clone())
            .accept_language(fp.locale.clone())
            .build()
            .map_err(|e| AppError::BrowserError(format!("Invalid user agent override: {e}")))?;
        page.execute(user_agent)
            .await
            .map_err(|e| cdp_error("Failed to set user agent", e))?;

        let metrics = SetDeviceMetricsOverrideParams::new(
            i64::from(fp.viewport.width),
            i64::from(fp.viewport.height),
            fp.device_scale_factor,
            false,
        );
        page.execute(metrics)
            .await
            .map_err(|e| cdp_error("Failed to set viewport", e))?;
        Ok(())
    }
}

impl BrowserSession for ChromiumSession {
    async fn open_page(&mut self) -> Result<(), AppError> {
        let mut target = CreateTargetParams::builder().url("about:blank");
        if let Some(id) = &self.context_id {
            target = target.browser_context_id(id.clone());
        }
        let target = target
            .build()
            .map_err(|e| AppError::BrowserError(format!("Invalid target: {e}")))?;

        let page = self
            .browser
            .lock()
            .await
            .new_page(target)
            .await
            .map_err(|e| cdp_error("Failed to open page", e))?;

        self.apply_fingerprint(&page).await?;
        self.page = Some(page);
        Ok(())
    }

    async fn hide_automation(&self) -> Result<(), AppError> {
        self.page()?
            .evaluate_on_new_document(AddScriptToEvaluateOnNewDocumentParams::new(STEALTH_SCRIPT))
            .await
            .map_err(|e| cdp_error("Failed to install init script", e))?;
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), AppError> {
        self.page()?
            .goto(url)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to navigate to {url}: {e}")))?;
        Ok(())
    }

    async fn move_pointer(&self, x: f64, y: f64, steps: u32) -> Result<(), AppError> {
        let page = self.page()?;
        let (from_x, from_y) = *self
            .pointer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let steps = steps.max(1);
        for i in 1..=steps {
            let t = f64::from(i) / f64::from(steps);
            let point = DispatchMouseEventParams::new(
                DispatchMouseEventType::MouseMoved,
                from_x + (x - from_x) * t,
                from_y + (y - from_y) * t,
            );
            page.execute(point)
                .await
                .map_err(|e| cdp_error("Pointer move failed", e))?;
            tokio::time::sleep(Duration::from_millis(8)).await;
        }

        *self
            .pointer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = (x, y);
        Ok(())
    }

    async fn request(&self, url: &str, accept: Option<&str>) -> Result<SessionResponse, AppError> {
        let page = self.page()?;
        let url_js = serde_json::to_string(url)?;
        let headers_js = match accept {
            Some(accept) => format!("{{ 'Accept': {} }}", serde_json::to_string(accept)?),
            None => "{}".to_string(),
        };
        let expression = format!(
            "(async () => {{
                const r = await fetch({url_js}, {{ credentials: 'include', headers: {headers_js} }});
                return {{ status: r.status, body: await r.text() }};
            }})()"
        );

        let params = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(|e| AppError::BrowserError(format!("Invalid evaluation: {e}")))?;

        let outcome: FetchOutcome = page
            .evaluate_expression(params)
            .await
            .map_err(|e| AppError::NetworkError(format!("In-page request to {url} failed: {e}")))?
            .into_value()?;

        Ok(SessionResponse {
            status: outcome.status,
            body: outcome.body,
        })
    }

    async fn close(&mut self) -> Result<(), AppError> {
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            tracing::debug!(error = %e, "Failed to close page");
        }

        if let Some(id) = self.context_id.take() {
            self.browser
                .lock()
                .await
                .execute(DisposeBrowserContextParams::new(id))
                .await
                .map_err(|e| cdp_error("Failed to dispose context", e))?;
        }
        Ok(())
    }
}
