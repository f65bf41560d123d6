//! HTTP service: `dossier serve`.

use anyhow::Result;
use dossier::config::DossierConfig;

pub async fn cmd_serve(mut config: DossierConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    super::ensure_valid(&config)?;
    dossier::server::start_server(config).await
}
