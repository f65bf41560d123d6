//! Scraping-engine abstraction and the Browserless-backed implementation.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::EngineError;

static LOCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,3}(-[A-Z]{2})?$").expect("valid locale regex"));

/// Browser viewport in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1366,
            height: 768,
        }
    }
}

/// Settings an engine instance is launched with.
///
/// Handles are single-configuration for their lifetime: the pool only hands
/// out an idle handle whose config compares equal to the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Enable anti-detection evasions.
    pub stealth: bool,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    /// Skip images, media and fonts while rendering.
    pub block_resources: bool,
    /// BCP 47 tag sent as Accept-Language, e.g. `en-US`.
    pub locale: Option<String>,
    pub navigation_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stealth: false,
            user_agent: None,
            viewport: Viewport::default(),
            block_resources: true,
            locale: None,
            navigation_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Check the configuration, returning every problem found.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();
        if !(320..=7680).contains(&self.viewport.width) {
            problems.push(format!(
                "viewport.width must be 320..=7680, got {}",
                self.viewport.width
            ));
        }
        if !(240..=4320).contains(&self.viewport.height) {
            problems.push(format!(
                "viewport.height must be 240..=4320, got {}",
                self.viewport.height
            ));
        }
        if !(1..=300).contains(&self.navigation_timeout_secs) {
            problems.push(format!(
                "navigation_timeout_secs must be 1..=300, got {}",
                self.navigation_timeout_secs
            ));
        }
        if let Some(ua) = &self.user_agent
            && ua.trim().is_empty()
        {
            problems.push("user_agent must not be blank".to_string());
        }
        if let Some(locale) = &self.locale
            && !LOCALE_RE.is_match(locale)
        {
            problems.push(format!("locale '{}' is not a language tag like en-US", locale));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// A rendered page.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
}

/// One live scraping-engine instance.
#[async_trait]
pub trait ScrapeEngine: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, EngineError>;

    /// Release engine-side resources. Called once when the pool destroys the handle.
    async fn shutdown(&self) {}
}

/// Creates engine instances for the pool.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, config: &EngineConfig) -> Result<Box<dyn ScrapeEngine>, EngineError>;
}

/// Launches engines backed by a Browserless deployment.
pub struct BrowserlessLauncher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessLauncher {
    pub fn new(
        base_url: &str,
        token: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Launch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        match &self.token {
            Some(token) => format!("{}{}?token={}", self.base_url, path, token),
            None => format!("{}{}", self.base_url, path),
        }
    }
}

#[async_trait]
impl EngineLauncher for BrowserlessLauncher {
    async fn launch(&self, config: &EngineConfig) -> Result<Box<dyn ScrapeEngine>, EngineError> {
        let resp = self
            .client
            .get(self.endpoint("/json/version"))
            .send()
            .await
            .map_err(|e| EngineError::Launch(format!("Browserless unreachable: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(Box::new(BrowserlessEngine {
            client: self.client.clone(),
            endpoint: self.endpoint("/content"),
            config: config.clone(),
        }))
    }
}

struct BrowserlessEngine {
    client: reqwest::Client,
    endpoint: String,
    config: EngineConfig,
}

impl BrowserlessEngine {
    fn request_body(&self, url: &str) -> serde_json::Value {
        let mut body = json!({
            "url": url,
            "gotoOptions": {
                "timeout": self.config.navigation_timeout_secs * 1000,
                "waitUntil": "networkidle2",
            },
            "viewport": {
                "width": self.config.viewport.width,
                "height": self.config.viewport.height,
            },
        });
        if let Some(ua) = &self.config.user_agent {
            body["userAgent"] = json!(ua);
        }
        if self.config.block_resources {
            body["rejectResourceTypes"] = json!(["image", "media", "font"]);
        }
        if let Some(locale) = &self.config.locale {
            body["setExtraHTTPHeaders"] = json!({ "Accept-Language": locale });
        }
        body
    }
}

#[async_trait]
impl ScrapeEngine for BrowserlessEngine {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, EngineError> {
        let mut request = self.client.post(&self.endpoint).json(&self.request_body(url));
        if self.config.stealth {
            request = request.query(&[("stealth", "true")]);
        }
        let resp = request.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(FetchedPage {
            url: url.to_string(),
            html: resp.text().await?,
        })
    }
}
