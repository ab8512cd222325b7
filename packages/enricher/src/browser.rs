//! chromiumoxide-backed implementation of the pool's browser traits.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::ResetPermissionsParams;
use chromiumoxide::cdp::browser_protocol::network::{
    ClearBrowserCookiesParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::performance::{
    EnableParams as PerformanceEnableParams, GetMetricsParams,
};
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use tracing::{debug, warn};
use url::Url;

use crate::config::BrowserLaunchConfig;
use crate::pool::{BrowserDriver, BrowserInstance, FetchedPage, InstanceSample};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Common Chromium executable locations, probed in order.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Resolves past `document.readyState` without navigating twice; falls back
/// to a timer on pages that never fire DOMContentLoaded.
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

/// Launches headless Chromium processes for the pool.
pub struct ChromiumDriver {
    config: BrowserLaunchConfig,
}

impl ChromiumDriver {
    pub fn new(config: BrowserLaunchConfig) -> Self {
        Self { config }
    }

    fn find_chrome(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.executable {
            return Ok(path.clone());
        }

        for path in CHROME_PATHS {
            let p = std::path::Path::new(path);
            if p.exists() {
                return Ok(p.to_path_buf());
            }
        }

        for cmd in &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
            if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path.is_empty() {
                        return Ok(PathBuf::from(path));
                    }
                }
            }
        }

        Err(anyhow!(
            "Chrome/Chromium not found; install it or set BROWSER_EXECUTABLE"
        ))
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    type Instance = ChromiumInstance;

    async fn launch(&self) -> Result<ChromiumInstance> {
        let chrome_path = self.find_chrome()?;
        debug!(path = %chrome_path.display(), headless = self.config.headless, "launching browser");

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);
        if !self.config.headless {
            builder = builder.with_head();
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--no-sandbox")
            .arg("--disable-gpu");
        for arg in &self.config.extra_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(ChromiumInstance {
            browser,
            handler_task,
        })
    }
}

/// One live Chromium process driven over CDP.
pub struct ChromiumInstance {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl BrowserInstance for ChromiumInstance {
    async fn fetch_page(&self, url: &Url, timeout: Duration) -> Result<FetchedPage> {
        let page = self.browser.new_page("about:blank").await?;
        page.execute(SetUserAgentOverrideParams::new(USER_AGENT.to_string()))
            .await?;

        let nav = NavigateParams::builder()
            .url(url.as_str())
            .build()
            .map_err(|e| anyhow!("invalid navigation url: {}", e))?;
        page.execute(nav).await?;

        match tokio::time::timeout(timeout, page.evaluate(WAIT_FOR_READY_SCRIPT.to_string())).await
        {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                // non-HTML documents reject script evaluation, keep going
                debug!(url = %url, error = %err, "could not check page ready state");
            }
            Err(_) => {
                warn!(url = %url, "timed out waiting for page ready state");
            }
        }
        // small grace period for late-loading scripts
        tokio::time::sleep(Duration::from_millis(500)).await;

        let final_url = page
            .url()
            .await?
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string());
        let html = page.content().await?;

        let _ = page.close().await;

        Ok(FetchedPage { final_url, html })
    }

    async fn reset_session(&self) -> Result<()> {
        let mut pages = self.browser.pages().await?.into_iter();
        let keeper = match pages.next() {
            Some(page) => page,
            None => self.browser.new_page("about:blank").await?,
        };
        for extra in pages {
            let _ = extra.close().await;
        }

        keeper.execute(ClearBrowserCookiesParams::default()).await?;
        // best-effort, some Chromium builds reject the browser-scoped command
        let _ = keeper.execute(ResetPermissionsParams::default()).await;
        keeper.goto("about:blank").await?;
        Ok(())
    }

    async fn sample(&self) -> Result<InstanceSample> {
        let pages = self.browser.pages().await?;
        let open_pages = pages.len();

        let memory_mb = match pages.first() {
            Some(page) => {
                page.execute(PerformanceEnableParams::default()).await?;
                let metrics = page.execute(GetMetricsParams::default()).await?;
                metrics
                    .result
                    .metrics
                    .iter()
                    .find(|m| m.name == "JSHeapUsedSize")
                    .map(|m| m.value / (1024.0 * 1024.0))
                    .unwrap_or(0.0)
            }
            None => 0.0,
        };

        Ok(InstanceSample {
            memory_mb,
            open_pages,
        })
    }

    async fn close(mut self) -> Result<()> {
        self.browser.close().await?;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }
}
