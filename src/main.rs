use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dossier::config::{CONFIG_FILE, DossierConfig};
use dossier::phase::Phase;

mod cmd;

#[derive(Parser)]
#[command(name = "dossier")]
#[command(version, about = "Company intelligence pipeline with quality-gated phases")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = CONFIG_FILE, env = "DOSSIER_CONFIG")]
    pub config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service
    Serve {
        /// Bind address (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the pipeline for one domain in this process
    Run {
        /// Company domain or URL
        domain: String,

        /// Owner of the session
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Stop after this phase
        #[arg(long, default_value = "generation")]
        through: Phase,

        /// Document kinds for the generation phase (comma-separated)
        #[arg(long, value_delimiter = ',')]
        documents: Vec<String>,

        /// Write the final session as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default dossier.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Config { command } => {
            dossier::telemetry::init_tracing(cli.log_json);
            cmd::cmd_config(&cli.config, command)?;
        }
        Commands::Serve { host, port } => {
            let config = DossierConfig::resolve(&cli.config)?;
            dossier::telemetry::init_tracing(cli.log_json || config.logging.json);
            cmd::cmd_serve(config, host, port).await?;
        }
        Commands::Run {
            domain,
            user,
            through,
            documents,
            output,
        } => {
            let config = DossierConfig::resolve(&cli.config)?;
            dossier::telemetry::init_tracing(cli.log_json || config.logging.json);
            let opts = cmd::run::RunOptions {
                domain,
                user,
                through,
                documents,
                output,
                verbose: cli.verbose,
            };
            cmd::cmd_run(config, opts).await?;
        }
    }

    Ok(())
}
