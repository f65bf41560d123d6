//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `run`    | `Run`            |
//! | `config` | `Config`         |

pub mod config;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use run::cmd_run;
pub use serve::cmd_serve;

use anyhow::Result;
use dossier::config::DossierConfig;

/// Refuse to start with a configuration that cannot work.
pub fn ensure_valid(config: &DossierConfig) -> Result<()> {
    let errors = config.validate();
    if errors.is_empty() {
        return Ok(());
    }
    let list: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
    anyhow::bail!(
        "Invalid configuration:\n{}\nRun 'dossier config validate' for details.",
        list.join("\n")
    )
}
