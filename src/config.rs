//! Configuration for dossier.
//!
//! Settings are read from `dossier.toml` and layered: file → environment →
//! CLI flags. Every section rejects unknown keys so typos fail loudly at
//! startup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3150
//!
//! [store]
//! db_path = ".dossier/sessions.db"   # or "memory"
//!
//! [orchestrator]
//! phase_timeout_secs = 600
//! allow_rerun_approved = true
//!
//! [progress]
//! ping_interval_secs = 30
//! max_backlog = 2000
//!
//! [pool]
//! max_size = 5
//! acquire_timeout_secs = 30
//!
//! [engine]
//! browserless_url = "http://localhost:3000"
//!
//! [extraction]
//! paths = ["/", "/about"]
//!
//! [llm]
//! endpoint = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//!
//! [gates.extraction]
//! threshold = 60
//!
//! [[gates.extraction.fields]]
//! path = "pages"
//! weight = 4.0
//! min = 2
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gate::GateConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::orchestrator::workers::ExtractionSettings;
use crate::pool::{EngineConfig, PoolConfig};
use crate::progress::HubConfig;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "dossier.toml";

/// Sentinel `db_path` selecting the in-memory store.
pub const MEMORY_STORE: &str = "memory";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3150
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// SQLite file, or `"memory"`.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    ".dossier/sessions.db".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StoreSection {
    pub fn is_memory(&self) -> bool {
        self.db_path == MEMORY_STORE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorSection {
    #[serde(default = "default_phase_timeout_secs")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub allow_rerun_approved: bool,
}

fn default_phase_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            phase_timeout_secs: default_phase_timeout_secs(),
            allow_rerun_approved: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressSection {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,
    #[serde(default = "default_ended_grace_secs")]
    pub ended_grace_secs: u64,
    #[serde(default = "default_idle_session_ttl_secs")]
    pub idle_session_ttl_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_max_backlog() -> usize {
    2000
}

fn default_ended_grace_secs() -> u64 {
    300
}

fn default_idle_session_ttl_secs() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    15
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            max_backlog: default_max_backlog(),
            ended_grace_secs: default_ended_grace_secs(),
            idle_session_ttl_secs: default_idle_session_ttl_secs(),
            max_sessions: default_max_sessions(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    #[serde(default = "default_pool_size")]
    pub max_size: usize,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_launch_attempts")]
    pub launch_attempts: u32,
    #[serde(default = "default_launch_backoff_ms")]
    pub launch_backoff_ms: u64,
}

fn default_pool_size() -> usize {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_failures() -> u32 {
    3
}

fn default_launch_attempts() -> u32 {
    2
}

fn default_launch_backoff_ms() -> u64 {
    250
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_failures: default_max_failures(),
            launch_attempts: default_launch_attempts(),
            launch_backoff_ms: default_launch_backoff_ms(),
        }
    }
}

/// Browserless endpoint plus the default per-acquisition engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_browserless_url")]
    pub browserless_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub defaults: EngineConfig,
}

fn default_browserless_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            browserless_url: default_browserless_url(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            defaults: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionSection {
    #[serde(default = "default_paths")]
    pub paths: Vec<String>,
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
}

fn default_paths() -> Vec<String> {
    ExtractionSettings::default().paths
}

fn default_max_text_chars() -> usize {
    4000
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            paths: default_paths(),
            max_text_chars: default_max_text_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmSection {
    /// Base URL of an OpenAI-compatible API. Empty disables the LLM phases.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            model: default_model(),
            request_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Emit JSON log lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

/// Root of `dossier.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DossierConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub progress: ProgressSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub extraction: ExtractionSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub gates: GateConfig,
}

impl DossierConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dossier configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from file, then apply environment overrides from the process.
    pub fn resolve(path: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `DOSSIER_*` overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DOSSIER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("DOSSIER_PORT must be a port number, got '{}'", port))?;
        }
        if let Some(path) = lookup("DOSSIER_DB_PATH") {
            self.store.db_path = path;
        }
        if let Some(url) = lookup("DOSSIER_BROWSERLESS_URL") {
            self.engine.browserless_url = url;
        }
        if let Some(token) = lookup("DOSSIER_BROWSERLESS_TOKEN") {
            self.engine.token = Some(token);
        }
        if let Some(endpoint) = lookup("DOSSIER_LLM_URL") {
            self.llm.endpoint = endpoint;
        }
        if let Some(key) = lookup("DOSSIER_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = lookup("DOSSIER_LLM_MODEL") {
            self.llm.model = model;
        }
        Ok(())
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        (!self.store.is_memory()).then(|| PathBuf::from(&self.store.db_path))
    }

    pub fn hub_config(&self) -> HubConfig {
        let p = &self.progress;
        HubConfig {
            ping_interval: Duration::from_secs(p.ping_interval_secs),
            max_backlog: p.max_backlog,
            ended_grace: Duration::from_secs(p.ended_grace_secs),
            idle_session_ttl: Duration::from_secs(p.idle_session_ttl_secs),
            max_sessions: p.max_sessions,
            sweep_interval: Duration::from_secs(p.sweep_interval_secs),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let p = &self.pool;
        PoolConfig {
            max_size: p.max_size,
            acquire_timeout: Duration::from_secs(p.acquire_timeout_secs),
            idle_timeout: Duration::from_secs(p.idle_timeout_secs),
            max_failures: p.max_failures,
            launch_attempts: p.launch_attempts,
            launch_backoff: Duration::from_millis(p.launch_backoff_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_phase_timeout(Duration::from_secs(self.orchestrator.phase_timeout_secs))
            .with_allow_rerun_approved(self.orchestrator.allow_rerun_approved)
    }

    pub fn extraction_settings(&self) -> ExtractionSettings {
        ExtractionSettings {
            paths: self.extraction.paths.clone(),
            max_text_chars: self.extraction.max_text_chars,
            engine: self.engine.defaults.clone(),
        }
    }

    /// Serialize back to TOML, with secrets masked.
    pub fn to_display_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.engine.token.is_some() {
            shown.engine.token = Some("********".into());
        }
        if shown.llm.api_key.is_some() {
            shown.llm.api_key = Some("********".into());
        }
        toml::to_string_pretty(&shown).context("Failed to serialize configuration")
    }

    /// Every problem that would stop the service from working.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.store.db_path.trim().is_empty() {
            errors.push("store.db_path must not be empty".to_string());
        }
        if self.orchestrator.phase_timeout_secs == 0 {
            errors.push("orchestrator.phase_timeout_secs must be greater than 0".to_string());
        }
        if self.progress.ping_interval_secs == 0 {
            errors.push("progress.ping_interval_secs must be greater than 0".to_string());
        }
        if self.progress.max_backlog == 0 {
            errors.push("progress.max_backlog must be greater than 0".to_string());
        }
        if self.progress.max_sessions == 0 {
            errors.push("progress.max_sessions must be greater than 0".to_string());
        }
        if self.pool.max_size == 0 {
            errors.push("pool.max_size must be at least 1".to_string());
        }
        if self.pool.launch_attempts == 0 {
            errors.push("pool.launch_attempts must be at least 1".to_string());
        }
        if self.pool.acquire_timeout_secs == 0 {
            errors.push("pool.acquire_timeout_secs must be greater than 0".to_string());
        }
        if !self.engine.browserless_url.starts_with("http://")
            && !self.engine.browserless_url.starts_with("https://")
        {
            errors.push(format!(
                "engine.browserless_url must be an http(s) URL, got '{}'",
                self.engine.browserless_url
            ));
        }
        if let Err(e) = self.engine.defaults.validate() {
            errors.push(format!("engine.defaults: {}", e));
        }
        if self.extraction.paths.is_empty() {
            errors.push("extraction.paths must list at least one path".to_string());
        }
        if self.extraction.max_text_chars == 0 {
            errors.push("extraction.max_text_chars must be greater than 0".to_string());
        }
        errors.extend(self.gates.validate());

        errors
    }

    /// Non-fatal observations, shown by `dossier config validate`.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.llm.endpoint.trim().is_empty() {
            warnings.push(
                "llm.endpoint is not set: enrichment and generation phases are disabled".to_string(),
            );
        }
        if self.pool.acquire_timeout_secs > self.orchestrator.phase_timeout_secs {
            warnings.push(format!(
                "pool.acquire_timeout_secs ({}) exceeds orchestrator.phase_timeout_secs ({})",
                self.pool.acquire_timeout_secs, self.orchestrator.phase_timeout_secs
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = DossierConfig::parse("").unwrap();
        assert_eq!(config, DossierConfig::default());
        assert_eq!(config.server.port, 3150);
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.progress.ping_interval_secs, 30);
        assert!(config.orchestrator.allow_rerun_approved);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = DossierConfig::parse(
            r#"
[pool]
max_size = 2

[gates.enrichment]
threshold = 80
"#,
        )
        .unwrap();
        assert_eq!(config.pool.max_size, 2);
        assert_eq!(config.pool.acquire_timeout_secs, 30);
        assert_eq!(config.gates.enrichment.threshold, 80);
        assert!(config.gates.enrichment.fields.is_empty());
        assert_eq!(config.gates.extraction, GateConfig::default().extraction);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = DossierConfig::parse("[pool]\nmax_sise = 3\n").unwrap_err();
        assert!(format!("{:#}", err).contains("max_sise"));
        assert!(DossierConfig::parse("[nonsense]\n").is_err());
        assert!(DossierConfig::parse("[engine.defaults]\nheadless = true\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = DossierConfig::parse("[server]\nport = 9000\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("DOSSIER_PORT", "9100"),
            ("DOSSIER_DB_PATH", "memory"),
            ("DOSSIER_LLM_MODEL", "local-model"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9100);
        assert!(config.store.is_memory());
        assert!(config.db_path().is_none());
        assert_eq!(config.llm.model, "local-model");
    }

    #[test]
    fn test_bad_env_port_is_an_error() {
        let mut config = DossierConfig::default();
        let result = config.apply_env(|k| (k == "DOSSIER_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_collects_problems() {
        let mut config = DossierConfig::default();
        config.pool.max_size = 0;
        config.extraction.paths.clear();
        config.engine.browserless_url = "localhost:3000".into();
        config.gates.generation.threshold = 120;
        let errors = config.validate();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("pool.max_size")));
        assert!(errors.iter().any(|e| e.contains("gates.generation.threshold")));
    }

    #[test]
    fn test_warnings_flag_missing_llm() {
        let config = DossierConfig::default();
        assert!(config.warnings().iter().any(|w| w.contains("llm.endpoint")));
    }

    #[test]
    fn test_runtime_configs_follow_sections() {
        let mut config = DossierConfig::default();
        config.progress.ping_interval_secs = 5;
        config.pool.launch_backoff_ms = 10;
        config.orchestrator.phase_timeout_secs = 42;
        assert_eq!(config.hub_config().ping_interval, Duration::from_secs(5));
        assert_eq!(config.pool_config().launch_backoff, Duration::from_millis(10));
        assert_eq!(
            config.orchestrator_config().phase_timeout,
            Duration::from_secs(42)
        );
    }

    #[test]
    fn test_display_masks_secrets_and_reparses() {
        let mut config = DossierConfig::default();
        config.llm.api_key = Some("sk-secret".into());
        let shown = config.to_display_toml().unwrap();
        assert!(!shown.contains("sk-secret"));
        let reparsed = DossierConfig::parse(&shown).unwrap();
        assert_eq!(reparsed.pool, config.pool);
    }

    #[test]
    fn test_load_or_default_reads_file_when_present() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        assert_eq!(
            DossierConfig::load_or_default(&path).unwrap(),
            DossierConfig::default()
        );
        std::fs::write(&path, "[server]\nport = 4000\n").unwrap();
        assert_eq!(DossierConfig::load_or_default(&path).unwrap().server.port, 4000);
    }
}
