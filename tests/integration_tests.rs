//! Integration tests for dossier
//!
//! These tests drive the real phase workers, quality gate, progress hub and
//! scraper pool together, with the network edges (browser engine and LLM)
//! replaced by in-process fakes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use async_trait::async_trait;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

use dossier::errors::{EngineError, LlmError, OrchestratorError, PoolError};
use dossier::gate::{GateConfig, QualityGate};
use dossier::llm::{LlmClient, LlmRequest, LlmResponse, Usage};
use dossier::orchestrator::workers::{
    EnrichmentWorker, ExtractionSettings, ExtractionWorker, GenerationWorker,
};
use dossier::orchestrator::{
    InvocationStatus, OrchestratorConfig, PhaseContext, PhaseOutput, PhaseService, PhaseWorker,
    Pipeline, WorkerRegistry,
};
use dossier::phase::Phase;
use dossier::pool::{
    EngineConfig, EngineLauncher, FetchedPage, PoolConfig, ReleaseOutcome, ScrapeEngine,
    ScraperPool,
};
use dossier::progress::{EventType, HubConfig, ProgressHub};
use dossier::session::{SessionStatus, SessionStore, SqliteSessionStore};

/// Helper to create a dossier Command
fn dossier() -> Command {
    cargo_bin_cmd!("dossier")
}

// =============================================================================
// Fakes for the network edges
// =============================================================================

struct StaticSite;

#[async_trait]
impl ScrapeEngine for StaticSite {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, EngineError> {
        if url.ends_with("/missing") {
            return Err(EngineError::Api {
                status: 404,
                message: "not found".into(),
            });
        }
        let body = "Acme forges industrial anvils for demanding customers. ".repeat(10);
        Ok(FetchedPage {
            url: url.to_string(),
            html: format!(
                "<html><head><title>Acme Anvils</title>\
                 <meta name=\"description\" content=\"Industrial anvils since 1949\"></head>\
                 <body><p>{}</p></body></html>",
                body
            ),
        })
    }
}

#[derive(Default)]
struct StaticLauncher {
    launches: AtomicUsize,
}

#[async_trait]
impl EngineLauncher for StaticLauncher {
    async fn launch(&self, _config: &EngineConfig) -> Result<Box<dyn ScrapeEngine>, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StaticSite))
    }
}

/// Answers enrichment and generation prompts with canned JSON.
#[derive(Default)]
struct CannedLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for CannedLlm {
    fn provider(&self) -> &str {
        "canned"
    }

    fn model(&self) -> &str {
        "canned-1"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = if request.system.contains("business writer") {
            json!({
                "executive_summary": "Acme is a long-established maker of industrial anvils \
                    serving foundries and workshops, with a reputation for durable products.",
                "documents": [
                    {"kind": "company_profile", "title": "Acme profile", "content": "..."}
                ],
            })
        } else {
            json!({
                "company_name": "Acme",
                "summary": "Acme manufactures industrial anvils and related forging tools.",
                "industry": "Manufacturing",
                "products": ["Anvils"],
                "competitors": ["Globex"],
                "key_people": [{"name": "W. Coyote", "role": "Customer"}],
            })
        };
        Ok(LlmResponse {
            content: content.to_string(),
            model: "canned-1".into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
                total_tokens: 20,
            },
        })
    }
}

struct Harness {
    service: PhaseService,
    store: Arc<SqliteSessionStore>,
    hub: Arc<ProgressHub>,
    llm: Arc<CannedLlm>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteSessionStore::open(&dir.path().join("sessions.db")).unwrap());
    let hub = Arc::new(ProgressHub::new(HubConfig::default()));
    let pool = ScraperPool::new(PoolConfig::default(), Arc::new(StaticLauncher::default())).unwrap();
    let llm = Arc::new(CannedLlm::default());

    let workers = WorkerRegistry::new()
        .with(Arc::new(ExtractionWorker::new(pool, ExtractionSettings::default())))
        .with(Arc::new(EnrichmentWorker::new(llm.clone())))
        .with(Arc::new(GenerationWorker::new(llm.clone())));
    let pipeline = Pipeline::new(
        store.clone(),
        Arc::new(QualityGate::new(GateConfig::default())),
        Arc::clone(&hub),
        workers,
        OrchestratorConfig::default(),
    );
    Harness {
        service: PhaseService::new(pipeline),
        store,
        hub,
        llm,
        _dir: dir,
    }
}

// =============================================================================
// Pipeline scenarios
// =============================================================================

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_full_run_persists_every_phase() {
        let h = harness();
        let session = h.store.get_or_create_session("u1", "https://acme.test").await.unwrap();

        let extraction = h
            .service
            .invoke(&session.id, "u1", Phase::Extraction, Value::Null)
            .await
            .unwrap();
        assert_eq!(extraction.status, InvocationStatus::Completed);
        assert!(extraction.review.score >= 85);
        assert_eq!(extraction.next_phase, Some(Phase::Enrichment));

        let enrichment = h
            .service
            .invoke(&session.id, "u1", Phase::Enrichment, Value::Null)
            .await
            .unwrap();
        assert_eq!(enrichment.status, InvocationStatus::Completed);

        let generation = h
            .service
            .invoke(&session.id, "u1", Phase::Generation, json!({"documents": ["company_profile"]}))
            .await
            .unwrap();
        assert_eq!(generation.status, InvocationStatus::Completed);
        assert!(!generation.can_proceed);
        assert_eq!(generation.next_phase, None);

        let stored = h.store.get_session(&session.id, "u1").await.unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        for phase in Phase::ALL {
            assert!(stored.is_approved(phase), "{} not approved", phase);
        }
        assert_eq!(stored.merged_data["extraction"]["title"], "Acme Anvils");
        assert_eq!(stored.merged_data["enrichment"]["company_name"], "Acme");
        assert_eq!(
            stored.result(Phase::Extraction).unwrap().metadata["provider"],
            "browserless"
        );
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_weak_extraction_blocks_enrichment_without_running_it() {
        let h = harness();
        let session = h.store.get_or_create_session("u1", "acme.test").await.unwrap();

        let extraction = h
            .service
            .invoke(&session.id, "u1", Phase::Extraction, json!({"paths": ["/", "/missing"]}))
            .await
            .unwrap();
        assert_eq!(extraction.status, InvocationStatus::Blocked);
        assert_eq!(extraction.review.score, 40);
        assert!(!extraction.can_proceed);

        let err = h
            .service
            .invoke(&session.id, "u1", Phase::Enrichment, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PhaseBlocked {
                phase: Phase::Enrichment,
                predecessor: Phase::Extraction,
                ..
            }
        ));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);

        let stored = h.store.get_session(&session.id, "u1").await.unwrap();
        assert_eq!(stored.status, SessionStatus::Blocked);
        assert!(stored.result(Phase::Enrichment).is_none());
    }

    #[tokio::test]
    async fn test_rerun_after_block_unlocks_next_phase() {
        let h = harness();
        let session = h.store.get_or_create_session("u1", "acme.test").await.unwrap();
        h.service
            .invoke(&session.id, "u1", Phase::Extraction, json!({"paths": ["/"]}))
            .await
            .unwrap();

        let retry = h
            .service
            .invoke(&session.id, "u1", Phase::Extraction, Value::Null)
            .await
            .unwrap();
        assert_eq!(retry.status, InvocationStatus::Completed);
        assert!(
            h.service
                .invoke(&session.id, "u1", Phase::Enrichment, Value::Null)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_weak_rerun_revokes_downstream_approval() {
        let h = harness();
        let session = h.store.get_or_create_session("u1", "acme.test").await.unwrap();
        for phase in [Phase::Extraction, Phase::Enrichment] {
            let inv = h
                .service
                .invoke(&session.id, "u1", phase, Value::Null)
                .await
                .unwrap();
            assert_eq!(inv.status, InvocationStatus::Completed);
        }

        let rerun = h
            .service
            .invoke(&session.id, "u1", Phase::Extraction, json!({"paths": ["/", "/missing"]}))
            .await
            .unwrap();
        assert_eq!(rerun.status, InvocationStatus::Blocked);

        let err = h
            .service
            .invoke(&session.id, "u1", Phase::Generation, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PhaseBlocked {
                phase: Phase::Generation,
                predecessor: Phase::Extraction,
                ..
            }
        ));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);

        let stored = h.store.get_session(&session.id, "u1").await.unwrap();
        assert_eq!(stored.status, SessionStatus::Blocked);
        assert!(!stored.is_approved(Phase::Enrichment));
        assert!(stored.result(Phase::Generation).is_none());
    }

    #[tokio::test]
    async fn test_progress_log_brackets_each_phase() {
        let h = harness();
        let session = h.store.get_or_create_session("u1", "acme.test").await.unwrap();
        h.service
            .invoke(&session.id, "u1", Phase::Extraction, Value::Null)
            .await
            .unwrap();

        let mut sub = h.hub.subscribe(&session.id, 0);
        let mut events = Vec::new();
        while let Some(event) = sub.next_event().await {
            events.push(event);
        }
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_index, i as u64);
        }
        assert_eq!(events[0].data["stage"], "phase_started");
        let pages = events
            .iter()
            .filter(|e| e.data["stage"] == "page")
            .count();
        assert_eq!(pages, ExtractionSettings::default().paths.len());
        assert_eq!(events.last().unwrap().event_type, EventType::End);
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency {
    use super::*;
    use dossier::session::MemorySessionStore;
    use tokio::sync::Notify;

    /// Blocks until released so two executions overlap.
    struct HeldWorker {
        started: Arc<Notify>,
        release: Arc<Notify>,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PhaseWorker for HeldWorker {
        fn phase(&self) -> Phase {
            Phase::Extraction
        }

        async fn run(&self, _ctx: PhaseContext) -> anyhow::Result<PhaseOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(PhaseOutput::default())
        }
    }

    #[tokio::test]
    async fn test_same_session_executes_one_phase_at_a_time() {
        let store = Arc::new(MemorySessionStore::new());
        let session = store.get_or_create_session("u1", "acme.test").await.unwrap();
        let worker = Arc::new(HeldWorker {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            runs: AtomicUsize::new(0),
        });
        let pipeline = Pipeline::new(
            store,
            Arc::new(QualityGate::new(GateConfig::default())),
            Arc::new(ProgressHub::new(HubConfig::default())),
            WorkerRegistry::new().with(worker.clone()),
            OrchestratorConfig::default(),
        );

        let mut first = pipeline.orchestrator();
        first.load_session(&session.id, "u1").await.unwrap();
        let mut second = pipeline.orchestrator();
        second.load_session(&session.id, "u1").await.unwrap();

        let running = tokio::spawn(async move { first.execute_phase(Phase::Extraction, Value::Null).await });
        worker.started.notified().await;

        let err = second
            .execute_phase(Phase::Extraction, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PhaseInProgress { .. }));

        worker.release.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert!(!outcome.review.approved);
        assert_eq!(worker.runs.load(Ordering::SeqCst), 1);
        assert!(pipeline.in_flight().is_empty());
    }
}

// =============================================================================
// Scraper pool capacity
// =============================================================================

mod pool_capacity {
    use super::*;

    fn pool(acquire_timeout: Duration) -> ScraperPool {
        let config = PoolConfig {
            acquire_timeout,
            ..PoolConfig::default()
        };
        ScraperPool::new(config, Arc::new(StaticLauncher::default())).unwrap()
    }

    #[tokio::test]
    async fn test_sixth_acquire_waits_for_a_release() {
        let pool = pool(Duration::from_secs(5));
        let engine = EngineConfig::default();
        let mut leases = Vec::new();
        for _ in 0..5 {
            leases.push(pool.acquire(&engine).await.unwrap());
        }
        assert_eq!(pool.stats().in_use, 5);

        let waiter = {
            let pool = pool.clone();
            let engine = engine.clone();
            tokio::spawn(async move { pool.acquire(&engine).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        leases.pop().unwrap().release(ReleaseOutcome::Success);
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(pool.stats().in_use, 5);
        assert!(pool.stats().in_use <= pool.config().max_size);
        drop(lease);
    }

    #[tokio::test]
    async fn test_sixth_acquire_times_out() {
        let pool = pool(Duration::from_millis(50));
        let engine = EngineConfig::default();
        let mut leases = Vec::new();
        for _ in 0..5 {
            leases.push(pool.acquire(&engine).await.unwrap());
        }
        let err = pool.acquire(&engine).await.err().unwrap();
        assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    }

    #[tokio::test]
    async fn test_lease_is_returned_when_caller_fails() {
        let pool = pool(Duration::from_secs(1));
        let engine = EngineConfig::default();

        let result: Result<(), EngineError> = async {
            let mut lease = pool.acquire(&engine).await.unwrap();
            lease.fetch("https://acme.test/missing").await?;
            Ok(())
        }
        .await;
        assert!(result.is_err());

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 1);
    }
}

// =============================================================================
// Progress hub
// =============================================================================

mod progress {
    use super::*;

    #[tokio::test]
    async fn test_mid_session_subscriber_sees_tail_then_end() {
        let hub = Arc::new(ProgressHub::new(HubConfig::default()));
        for n in 0..5 {
            hub.publish("s1", EventType::Progress, json!({"n": n}));
        }

        let mut sub = hub.subscribe("s1", 3);
        let publisher = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                hub.publish("s1", EventType::Progress, json!({"n": 5}));
                hub.mark_ended("s1");
            })
        };

        let mut indexes = Vec::new();
        let mut last = None;
        while let Some(event) = sub.next_event().await {
            indexes.push(event.sequence_index);
            last = Some(event.event_type);
        }
        publisher.await.unwrap();

        assert_eq!(indexes, vec![3, 4, 5, 6]);
        assert_eq!(last, Some(EventType::End));
    }
}

// =============================================================================
// CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_dossier_help() {
        dossier()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("run"));
    }

    #[test]
    fn test_dossier_version() {
        dossier().arg("--version").assert().success();
    }

    #[test]
    fn test_config_init_then_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dossier.toml");

        dossier()
            .args(["--config", path.to_str().unwrap(), "config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(path.exists());

        dossier()
            .args(["--config", path.to_str().unwrap(), "config", "validate"])
            .env_remove("DOSSIER_LLM_URL")
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dossier.toml");
        std::fs::write(&path, "[pool]\nmax_size = 0\n").unwrap();

        dossier()
            .args(["--config", path.to_str().unwrap(), "config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("pool.max_size"));
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dossier.toml");
        std::fs::write(&path, "[pool]\nsize = 3\n").unwrap();

        dossier()
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .failure();
    }

    #[test]
    fn test_run_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dossier.toml");
        std::fs::write(&path, "[extraction]\npaths = []\n").unwrap();

        dossier()
            .args(["--config", path.to_str().unwrap(), "run", "acme.test"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("extraction.paths"));
    }
}
