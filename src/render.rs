use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio::process::Command;
use tokio::time::timeout;
use url::Url;

use crate::config::HarvestConfig;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("browser exited with {status}: {stderr}")]
    Navigation { status: String, stderr: String },
    #[error("rendering {0} timed out")]
    Timeout(String),
}

/// Loads a page in a browser and returns the DOM after scripts have run.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &Url, wait_for: Option<&str>) -> Result<String, RenderError>;
}

/// Headless Chromium driven through `--dump-dom`, one fresh incognito process per page.
pub struct ChromeRenderer {
    binary: PathBuf,
    timeout: Duration,
}

impl ChromeRenderer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &HarvestConfig) -> Self {
        Self::new(
            &config.chrome_binary,
            Duration::from_secs(config.render_timeout_secs),
        )
    }

    async fn dump_dom(&self, url: &Url, budget: Duration) -> Result<String, RenderError> {
        let child = Command::new(&self.binary)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--incognito")
            .arg("--no-first-run")
            .arg(format!("--virtual-time-budget={}", budget.as_millis()))
            .arg("--dump-dom")
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RenderError::Launch(err.to_string()))?;

        // Wall-clock guard on top of the virtual time budget.
        let output = timeout(self.timeout + budget, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(url.to_string()))?
            .map_err(|err| RenderError::Launch(err.to_string()))?;

        if !output.status.success() {
            return Err(RenderError::Navigation {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&self, url: &Url, wait_for: Option<&str>) -> Result<String, RenderError> {
        tracing::debug!(%url, ?wait_for, "rendering page");
        let dom = self.dump_dom(url, self.timeout / 2).await?;

        let Some(selector) = wait_for else {
            return Ok(dom);
        };
        if contains_selector(&dom, selector) {
            return Ok(dom);
        }

        // The element may need longer to appear; give the page its full budget
        // once and accept whatever comes back.
        match self.dump_dom(url, self.timeout).await {
            Ok(second) => {
                if !contains_selector(&second, selector) {
                    tracing::debug!(%url, selector, "selector never appeared");
                }
                Ok(second)
            }
            Err(err) => {
                tracing::debug!(%url, selector, error = %err, "selector wait failed, keeping first render");
                Ok(dom)
            }
        }
    }
}

fn contains_selector(dom: &str, selector: &str) -> bool {
    match Selector::parse(selector) {
        Ok(parsed) => Html::parse_document(dom).select(&parsed).next().is_some(),
        Err(_) => true,
    }
}
