//! Tender Pipeline - daily tender matching service.
//!
//! Scrapes tender feeds, analyzes the announcements, scores them against
//! every registered enterprise and sends each enterprise its digest.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tender_common::config::Config;
use tender_common::logging::init_logging;
use tender_common::ShutdownHandle;
use tender_pipeline::PipelineService;

/// Daily tender matching pipeline.
#[derive(Parser, Debug)]
#[command(name = "tender-pipeline")]
#[command(version)]
#[command(about = "Match procurement tenders against enterprise profiles.", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.tender-matcher/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daily scheduler until interrupted
    Serve,

    /// Run one full cycle now and print its report
    RunOnce,

    /// Import enterprise profiles from a JSON array file
    ImportEnterprises {
        /// Path to the JSON file
        file: PathBuf,
    },

    /// Print the ranked matches of an enterprise
    Matches {
        /// Enterprise id
        enterprise_id: i64,

        /// Number of matches to print
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let Some(path) = path else {
        return Config::load_and_validate();
    };

    let mut config = Config::load_from(path)?;
    config.apply_env_overrides();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

/// Trigger `shutdown` on Ctrl-C.
fn shutdown_on_ctrl_c(shutdown: ShutdownHandle) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C, shutting down");
                shutdown.shutdown();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_config(cli.config.as_ref())?;

    // Initialize logging
    init_logging(&config.observability);

    tracing::info!("Tender Pipeline v{}", env!("CARGO_PKG_VERSION"));

    let service = PipelineService::new(config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            shutdown_on_ctrl_c(service.shutdown_handle());
            service.serve().await
        }

        Commands::RunOnce => {
            shutdown_on_ctrl_c(service.shutdown_handle());
            let report = service.run_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        Commands::ImportEnterprises { file } => {
            let imported = service.import_enterprises(&file).await?;
            println!("Imported {} enterprises from {}", imported, file.display());
            Ok(())
        }

        Commands::Matches {
            enterprise_id,
            limit,
        } => {
            let (matches, report) = service
                .coordinator()
                .matches_for(enterprise_id, limit)
                .await?
                .with_context(|| format!("Enterprise {} not found", enterprise_id))?;
            let matches: Vec<serde_json::Value> = matches
                .iter()
                .enumerate()
                .map(|(idx, m)| {
                    serde_json::json!({
                        "rank": idx + 1,
                        "tender": m,
                        "details": m.result.details(),
                    })
                })
                .collect();
            let output = serde_json::json!({
                "enterprise_id": enterprise_id,
                "report": report,
                "matches": matches,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
    }
}
