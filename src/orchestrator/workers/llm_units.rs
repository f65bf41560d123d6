//! LLM-backed work units: enrichment and document generation.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{PhaseContext, PhaseOutput, PhaseWorker};
use crate::llm::{LlmClient, LlmRequest, LlmResponse};
use crate::phase::Phase;

const ENRICHMENT_SYSTEM: &str = "You are a company research analyst. Using only the supplied \
website extracts, respond with a JSON object with the keys: company_name (string), summary \
(string, 2-4 sentences), industry (string), products (array of strings), competitors (array of \
strings), key_people (array of objects with name and role). Use empty values when unknown.";

const GENERATION_SYSTEM: &str = "You are a business writer. Using the supplied company profile, \
respond with a JSON object with the keys: executive_summary (string) and documents (array of \
objects with kind, title and content). Produce exactly one document per requested kind.";

const DEFAULT_DOCUMENTS: [&str; 3] = ["company_profile", "competitive_landscape", "outreach_brief"];

/// Limit on extract text per page included in prompts.
const PROMPT_PAGE_CHARS: usize = 1500;

fn llm_metadata(llm: &dyn LlmClient, response: &LlmResponse) -> Result<Map<String, Value>> {
    let mut metadata = Map::new();
    metadata.insert("provider".into(), json!(llm.provider()));
    metadata.insert("model".into(), json!(response.model));
    metadata.insert("usage".into(), serde_json::to_value(response.usage)?);
    Ok(metadata)
}

fn require_object(value: Value, what: &str) -> Result<Value> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(anyhow!("{} response was not a JSON object", what))
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

/// Turns extraction output into a structured company profile.
pub struct EnrichmentWorker {
    llm: Arc<dyn LlmClient>,
}

impl EnrichmentWorker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(domain: &str, extraction: &Value) -> String {
        let mut prompt = format!("Company website: {}\n", domain);
        if let Some(title) = extraction.get("title").and_then(Value::as_str) {
            prompt.push_str(&format!("Site title: {}\n", title));
        }
        if let Some(desc) = extraction.get("description").and_then(Value::as_str) {
            prompt.push_str(&format!("Site description: {}\n", desc));
        }
        for page in extraction
            .get("pages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let url = page.get("url").and_then(Value::as_str).unwrap_or("?");
            let text = page.get("text").and_then(Value::as_str).unwrap_or("");
            prompt.push_str(&format!("\n## {}\n{}\n", url, truncate(text, PROMPT_PAGE_CHARS)));
        }
        prompt
    }
}

#[async_trait]
impl PhaseWorker for EnrichmentWorker {
    fn phase(&self) -> Phase {
        Phase::Enrichment
    }

    async fn run(&self, ctx: PhaseContext) -> Result<PhaseOutput> {
        let extraction = ctx
            .prior
            .as_ref()
            .context("Enrichment requires an extraction result")?;
        let prompt = Self::prompt(&ctx.session.domain, &extraction.data);

        ctx.progress.progress(
            "llm_request",
            "building company profile",
            json!({"model": self.llm.model()}),
        );
        let response = self
            .llm
            .complete(&LlmRequest::json(ENRICHMENT_SYSTEM, prompt))
            .await
            .context("Enrichment LLM call failed")?;
        let data = require_object(response.json_value()?, "Enrichment")?;
        ctx.progress.progress(
            "llm_response",
            "company profile received",
            json!({"total_tokens": response.usage.total_tokens}),
        );

        Ok(PhaseOutput {
            metadata: llm_metadata(self.llm.as_ref(), &response)?,
            data,
        })
    }
}

/// Writes the final documents from the merged knowledge base.
///
/// Accepted input key: `documents`, an array of document kinds.
pub struct GenerationWorker {
    llm: Arc<dyn LlmClient>,
}

impl GenerationWorker {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn requested_documents(input: &Value) -> Result<Vec<String>> {
        match input.get("documents") {
            Some(raw) if !raw.is_null() => {
                let kinds: Vec<String> = serde_json::from_value(raw.clone())
                    .context("`documents` must be an array of strings")?;
                if kinds.is_empty() {
                    bail!("`documents` must not be empty");
                }
                Ok(kinds)
            }
            _ => Ok(DEFAULT_DOCUMENTS.iter().map(|s| s.to_string()).collect()),
        }
    }
}

#[async_trait]
impl PhaseWorker for GenerationWorker {
    fn phase(&self) -> Phase {
        Phase::Generation
    }

    async fn run(&self, ctx: PhaseContext) -> Result<PhaseOutput> {
        let profile = ctx
            .prior
            .as_ref()
            .context("Generation requires an enrichment result")?;
        let kinds = Self::requested_documents(&ctx.input)?;

        let site_title = ctx
            .session
            .merged_data
            .get("extraction")
            .and_then(|e| e.get("title"))
            .cloned()
            .unwrap_or(Value::Null);
        let prompt = format!(
            "Company website: {}\nSite title: {}\nRequested documents: {}\n\nCompany profile:\n{}",
            ctx.session.domain,
            site_title,
            kinds.join(", "),
            serde_json::to_string_pretty(&profile.data)?,
        );

        ctx.progress.progress(
            "llm_request",
            format!("writing {} documents", kinds.len()),
            json!({"model": self.llm.model(), "documents": kinds}),
        );
        let response = self
            .llm
            .complete(&LlmRequest::json(GENERATION_SYSTEM, prompt).with_max_tokens(4096))
            .await
            .context("Generation LLM call failed")?;
        let data = require_object(response.json_value()?, "Generation")?;
        ctx.progress.progress(
            "llm_response",
            "documents received",
            json!({"total_tokens": response.usage.total_tokens}),
        );

        let mut metadata = llm_metadata(self.llm.as_ref(), &response)?;
        metadata.insert("requested_documents".into(), json!(kinds));
        Ok(PhaseOutput { data, metadata })
    }
}
