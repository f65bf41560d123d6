//! Extraction: render the company's key pages through a pooled browser.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::html::summarize_page;
use super::{PhaseContext, PhaseOutput, PhaseWorker};
use crate::phase::Phase;
use crate::pool::{EngineConfig, ScraperPool};

/// Which pages to fetch and how much text to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSettings {
    pub paths: Vec<String>,
    pub max_text_chars: usize,
    pub engine: EngineConfig,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            paths: ["/", "/about", "/products", "/pricing", "/team"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_text_chars: 4000,
            engine: EngineConfig::default(),
        }
    }
}

/// Leases one browser for the whole phase and fetches every configured path.
///
/// Accepted input keys: `engine` (an [`EngineConfig`] object overriding the
/// default) and `paths` (array of paths overriding the configured list).
pub struct ExtractionWorker {
    pool: ScraperPool,
    settings: ExtractionSettings,
}

impl ExtractionWorker {
    pub fn new(pool: ScraperPool, settings: ExtractionSettings) -> Self {
        Self { pool, settings }
    }

    fn engine_for(&self, input: &Value) -> Result<EngineConfig> {
        match input.get("engine") {
            Some(raw) if !raw.is_null() => {
                serde_json::from_value(raw.clone()).context("Invalid engine configuration")
            }
            _ => Ok(self.settings.engine.clone()),
        }
    }

    fn paths_for(&self, input: &Value) -> Result<Vec<String>> {
        match input.get("paths") {
            Some(raw) if !raw.is_null() => {
                let paths: Vec<String> =
                    serde_json::from_value(raw.clone()).context("`paths` must be an array of strings")?;
                if paths.is_empty() {
                    bail!("`paths` must not be empty");
                }
                Ok(paths)
            }
            _ => Ok(self.settings.paths.clone()),
        }
    }
}

fn page_url(domain: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("https://{}{}", domain, path)
    } else {
        format!("https://{}/{}", domain, path)
    }
}

#[async_trait]
impl PhaseWorker for ExtractionWorker {
    fn phase(&self) -> Phase {
        Phase::Extraction
    }

    async fn run(&self, ctx: PhaseContext) -> Result<PhaseOutput> {
        let engine = self.engine_for(&ctx.input)?;
        let paths = self.paths_for(&ctx.input)?;
        let domain = ctx.session.domain.clone();

        ctx.progress.progress(
            "lease",
            "waiting for a browser",
            json!({"stealth": engine.stealth}),
        );
        let mut lease = self.pool.acquire(&engine).await?;
        let handle_id = lease.id();
        tracing::debug!(session_id = %ctx.session.id, handle_id, "extraction leased browser");

        let total = paths.len();
        let mut pages = Vec::new();
        let mut failed = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            let url = page_url(&domain, path);
            match lease.fetch(&url).await {
                Ok(page) => {
                    let summary = summarize_page(&page.url, &page.html, self.settings.max_text_chars);
                    ctx.progress.progress(
                        "page",
                        format!("fetched {}", url),
                        json!({"page": i + 1, "of": total, "words": summary.word_count}),
                    );
                    pages.push(summary);
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "page fetch failed");
                    ctx.progress.progress(
                        "page_failed",
                        format!("failed {}", url),
                        json!({"page": i + 1, "of": total, "error": e.to_string()}),
                    );
                    failed.push(json!({"url": url, "error": e.to_string()}));
                }
            }
        }
        drop(lease);

        if pages.is_empty() {
            bail!("All {} page fetches failed for {}", total, domain);
        }

        let title = pages.iter().find_map(|p| p.title.clone());
        let description = pages.iter().find_map(|p| p.description.clone());
        let total_words: usize = pages.iter().map(|p| p.word_count).sum();

        let data = json!({
            "domain": domain,
            "title": title,
            "description": description,
            "total_words": total_words,
            "pages": pages,
            "failed": failed,
        });

        let mut metadata = Map::new();
        metadata.insert("provider".into(), json!("browserless"));
        metadata.insert("handle_id".into(), json!(handle_id));
        metadata.insert("pages_fetched".into(), json!(pages.len()));
        metadata.insert("pages_failed".into(), json!(failed.len()));
        metadata.insert("engine".into(), serde_json::to_value(&engine)?);

        Ok(PhaseOutput { data, metadata })
    }
}
