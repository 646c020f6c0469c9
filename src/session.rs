use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::json;
use tracing::{debug, info};

use crate::types::{RawFragment, StepOutcome, StepPayload};

/// A live browsing session, reliable at the primitive level. One session is
/// acquired per task and released when the task ends, whatever the outcome.
#[async_trait]
pub trait BrowsingSession: Send {
    async fn goto(&mut self, url: &str, timeout: Duration) -> StepOutcome;
    async fn click(&mut self, selector: &str, timeout: Duration) -> StepOutcome;
    async fn fill(&mut self, selector: &str, value: &str, timeout: Duration) -> StepOutcome;
    async fn extract(&mut self, selector: &str, multiple: bool, timeout: Duration) -> StepOutcome;
    async fn wait(&mut self, seconds: u64) -> StepOutcome;
    async fn screenshot(&mut self, name: Option<&str>) -> StepOutcome;
    async fn close(&mut self) -> Result<()>;
}

/// Opens a fresh session for each task.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowsingSession>>;
}

/// JavaScript injected to collect matched elements as JSON fragments.
/// `__SELECTOR__` and `__MULTIPLE__` are substituted before evaluation.
const COLLECT_JS: &str = r#"
(() => {
  const sel = '__SELECTOR__';
  const multiple = __MULTIPLE__;
  let nodes;
  if (multiple) {
    nodes = Array.from(document.querySelectorAll(sel));
  } else {
    const one = document.querySelector(sel);
    nodes = one ? [one] : [];
  }
  const out = nodes.map(el => {
    const attrs = {};
    for (const a of el.attributes) attrs[a.name] = a.value;
    const link = el.querySelector('a[href]');
    if (link && !attrs.href) attrs.href = link.getAttribute('href');
    const img = el.querySelector('img[src]');
    if (img && !attrs.src) attrs.src = img.getAttribute('src');
    return {
      text: (el.innerText || el.textContent || '').trim().slice(0, 2000),
      html: el.innerHTML ? el.innerHTML.slice(0, 4000) : null,
      tag: el.tagName.toLowerCase(),
      attributes: attrs,
    };
  });
  return JSON.stringify(out);
})()
"#;

pub struct ChromeSessionProvider {
    headless: bool,
    artifacts_dir: PathBuf,
}

impl ChromeSessionProvider {
    pub fn new(headless: bool, artifacts_dir: PathBuf) -> Self {
        Self {
            headless,
            artifacts_dir,
        }
    }
}

#[async_trait]
impl SessionProvider for ChromeSessionProvider {
    async fn open(&self) -> Result<Box<dyn BrowsingSession>> {
        let headless = self.headless;
        let artifacts_dir = self.artifacts_dir.clone();
        // Launching Chrome can take a while; keep it off the async runtime.
        let session = tokio::task::spawn_blocking(move || ChromeSession::launch(headless, artifacts_dir))
            .await
            .context("browser launch task panicked")??;
        Ok(Box::new(session))
    }
}

/// Browsing session driven over the Chrome DevTools protocol.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    artifacts_dir: PathBuf,
}

impl ChromeSession {
    fn launch(headless: bool, artifacts_dir: PathBuf) -> Result<Self> {
        let options = LaunchOptions {
            headless,
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
            ],
            idle_browser_timeout: Duration::from_secs(120),
            ..Default::default()
        };

        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        std::fs::create_dir_all(&artifacts_dir)?;
        info!(headless, "chrome session ready");

        Ok(Self {
            _browser: browser,
            tab,
            artifacts_dir,
        })
    }

    /// Run a blocking CDP call on a cloned tab handle, mapping both the call
    /// error and a join panic into a failed outcome.
    async fn blocking<F>(&self, action: &'static str, f: F) -> StepOutcome
    where
        F: FnOnce(Arc<Tab>) -> Result<StepOutcome> + Send + 'static,
    {
        let tab = self.tab.clone();
        match tokio::task::spawn_blocking(move || f(tab)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                StepOutcome::failure(format!("{err:#}")).with_meta("action", json!(action))
            }
            Err(err) => StepOutcome::failure(format!("{action} task panicked: {err}"))
                .with_meta("action", json!(action)),
        }
    }
}

fn escape_selector(selector: &str) -> String {
    selector.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl BrowsingSession for ChromeSession {
    async fn goto(&mut self, url: &str, timeout: Duration) -> StepOutcome {
        let url = url.to_string();
        self.blocking("goto", move |tab| {
            tab.navigate_to(&url)?;
            tab.wait_for_element_with_custom_timeout("body", timeout)?;
            // Give scripts a moment to settle after load.
            std::thread::sleep(Duration::from_millis(1500));
            Ok(StepOutcome::ok(Some(StepPayload::Info(json!({"url": url}))))
                .with_meta("action", json!("goto")))
        })
        .await
    }

    async fn click(&mut self, selector: &str, timeout: Duration) -> StepOutcome {
        let selector = selector.to_string();
        self.blocking("click", move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            element.click()?;
            std::thread::sleep(Duration::from_millis(500));
            Ok(StepOutcome::ok(Some(StepPayload::Info(json!({"selector": selector}))))
                .with_meta("action", json!("click")))
        })
        .await
    }

    async fn fill(&mut self, selector: &str, value: &str, timeout: Duration) -> StepOutcome {
        let selector = selector.to_string();
        let value = value.to_string();
        self.blocking("fill", move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            element.click()?;
            let escaped = escape_selector(&selector);
            tab.evaluate(
                &format!("document.querySelector('{escaped}').value = ''"),
                false,
            )?;
            tab.type_str(&value)?;
            Ok(StepOutcome::ok(Some(StepPayload::Info(
                json!({"selector": selector, "value": value}),
            )))
            .with_meta("action", json!("fill")))
        })
        .await
    }

    async fn extract(&mut self, selector: &str, multiple: bool, timeout: Duration) -> StepOutcome {
        let selector = selector.to_string();
        self.blocking("extract", move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            let script = COLLECT_JS
                .replace("__SELECTOR__", &escape_selector(&selector))
                .replace("__MULTIPLE__", if multiple { "true" } else { "false" });
            let result = tab.evaluate(&script, false)?;
            let raw = result
                .value
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| "[]".to_string());
            let fragments: Vec<RawFragment> = serde_json::from_str(&raw)?;
            debug!(selector = %selector, count = fragments.len(), "extracted fragments");

            let payload = if multiple {
                StepPayload::Fragments(fragments)
            } else {
                match fragments.into_iter().next() {
                    Some(fragment) => StepPayload::Fragment(fragment),
                    None => anyhow::bail!("element not found: {selector}"),
                }
            };
            Ok(StepOutcome::ok(Some(payload)).with_meta("action", json!("extract")))
        })
        .await
    }

    async fn wait(&mut self, seconds: u64) -> StepOutcome {
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        StepOutcome::ok(Some(StepPayload::Info(json!({"waited": seconds}))))
            .with_meta("action", json!("wait"))
    }

    async fn screenshot(&mut self, name: Option<&str>) -> StepOutcome {
        let filename = name
            .map(|n| format!("{n}.png"))
            .unwrap_or_else(|| format!("screenshot_{}.png", chrono::Utc::now().timestamp()));
        let path = self.artifacts_dir.join(filename);
        let target = path.clone();
        let outcome = self
            .blocking("screenshot", move |tab| {
                let png =
                    tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
                std::fs::write(&target, png)?;
                Ok(StepOutcome::ok(None).with_meta("action", json!("screenshot")))
            })
            .await;
        if outcome.success {
            StepOutcome {
                artifact: Some(path),
                ..outcome
            }
        } else {
            outcome
        }
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the Browser handle tears the process down; nothing else
        // to release explicitly.
        debug!("closing chrome session");
        Ok(())
    }
}
