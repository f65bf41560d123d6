//! In-process pipeline run: `dossier run <domain>`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use dossier::config::DossierConfig;
use dossier::orchestrator::InvocationStatus;
use dossier::phase::Phase;
use dossier::server::{AppState, open_store};
use dossier::ui::RunUI;

pub struct RunOptions {
    pub domain: String,
    pub user: String,
    /// Last phase to run.
    pub through: Phase,
    pub documents: Vec<String>,
    pub output: Option<PathBuf>,
    pub verbose: bool,
}

fn phase_input(phase: Phase, opts: &RunOptions) -> Value {
    match phase {
        Phase::Generation if !opts.documents.is_empty() => json!({"documents": opts.documents}),
        _ => Value::Null,
    }
}

pub async fn cmd_run(config: DossierConfig, opts: RunOptions) -> Result<()> {
    super::ensure_valid(&config)?;
    let store = open_store(&config)?;
    let state = Arc::new(AppState::from_config(&config, store)?);
    let service = &state.service;

    let session = service
        .pipeline()
        .store()
        .get_or_create_session(&opts.user, &opts.domain)
        .await
        .context("Failed to open session")?;
    println!("Session {} for {}", session.id, session.domain);

    let phases: Vec<Phase> = Phase::ALL
        .iter()
        .copied()
        .filter(|p| *p <= opts.through)
        .collect();
    let ui = Arc::new(RunUI::new(phases.len() as u64, opts.verbose));
    let mut completed = true;

    for phase in phases {
        if session.is_approved(phase) && phase < session.phase {
            tracing::info!(%phase, "phase already approved, skipping");
            continue;
        }
        ui.start_phase(phase.as_str());

        let from = state.hub.create_or_get_session(&session.id).next_index;
        let subscription = state.hub.subscribe(&session.id, from);
        let renderer = {
            let ui = Arc::clone(&ui);
            tokio::spawn(async move {
                let mut subscription = subscription;
                while let Some(event) = subscription.next_event().await {
                    ui.show_event(&event);
                }
            })
        };

        let result = service
            .invoke(&session.id, &opts.user, phase, phase_input(phase, &opts))
            .await;
        // Closes the stream when the phase failed before publishing anything.
        state.hub.mark_ended(&session.id);
        if let Err(e) = renderer.await {
            tracing::debug!(error = %e, "progress renderer stopped");
        }

        match result {
            Ok(invocation) if invocation.status == InvocationStatus::Completed => {
                ui.phase_approved(phase.as_str(), &invocation.review);
            }
            Ok(invocation) => {
                ui.phase_blocked(phase.as_str(), &invocation.review);
                completed = false;
                break;
            }
            Err(e) => {
                ui.phase_failed(phase.as_str(), &e.to_string());
                completed = false;
                break;
            }
        }
    }
    ui.finish(completed);

    let session = service
        .pipeline()
        .store()
        .get_session(&session.id, &opts.user)
        .await
        .context("Failed to reload session")?;
    if let Some(path) = &opts.output {
        let json = serde_json::to_string_pretty(&session)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote session to {}", path.display());
    }

    state.hub.close();
    state.pool.shutdown().await;

    if !completed {
        anyhow::bail!(
            "Run stopped at phase {} (session {}, status {})",
            session.phase,
            session.id,
            session.status
        );
    }
    Ok(())
}
