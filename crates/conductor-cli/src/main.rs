mod cancel_cmd;
mod config;
mod migrate_cmd;
mod reactivations_cmd;
mod resolve;
mod serve_cmd;
mod status_cmd;
mod sweep_cmd;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use conductor_core::broker::LocalBroker;
use conductor_core::clock::SystemClock;
use conductor_core::handler;
use conductor_core::notify::TracingNotifier;
use conductor_core::orchestrator::OrchestratorContext;
use conductor_core::reactivation::PayloadClassifier;
use conductor_db::pool;

use config::ConductorConfig;

#[derive(Parser)]
#[command(name = "conductor", about = "Workflow orchestrator for AI-assisted code changes")]
struct Cli {
    /// Database URL (overrides CONDUCTOR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook intake, dispatcher, and sweepers
    Serve {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Apply schema migrations and seed/verify the status registry
    Migrate,
    /// Force-run a sweeper pass once
    Sweep {
        /// Sweep stale locks only
        #[arg(long)]
        locks: bool,
    },
    /// Reactivation inspection
    Reactivations {
        #[command(subcommand)]
        command: ReactivationCommands,
    },
    /// Cancel a ticket's active run and pending queue entries
    Cancel {
        /// Ticket ID (UUID or external tracker ID)
        ticket_id: String,
    },
    /// Show ticket status (omit the ID to list all tickets)
    Status {
        /// Ticket ID (UUID or external tracker ID)
        ticket_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReactivationCommands {
    /// Print the reactivation tree for a ticket
    Show {
        /// Ticket ID (UUID or external tracker ID)
        ticket_id: String,
    },
}

/// Build the full orchestrator bundle with production collaborators.
async fn build_context(resolved: &ConductorConfig) -> Result<Arc<OrchestratorContext>> {
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    if let Some(url) = &resolved.broker_url {
        // External brokers plug in here; until one is configured the local
        // in-process broker dispatches to this node's worker pool.
        tracing::info!(broker_url = %url, "external broker configured; using local dispatch");
    }
    let broker = Arc::new(LocalBroker::new(db_pool.clone()));

    OrchestratorContext::new(
        db_pool,
        handler::passthrough_defaults(),
        broker,
        Arc::new(TracingNotifier),
        Arc::new(SystemClock),
        Arc::new(PayloadClassifier),
        resolved.settings.clone(),
    )
    .await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let resolved = ConductorConfig::resolve(cli.database_url.as_deref())?;

    match cli.command {
        Commands::Serve { bind, port } => {
            let ctx = build_context(&resolved).await?;
            serve_cmd::run_serve(ctx, &bind, port).await?;
        }
        Commands::Migrate => {
            let code = migrate_cmd::run_migrate(&resolved.db_config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Sweep { locks } => {
            let ctx = build_context(&resolved).await?;
            sweep_cmd::run_sweep(&ctx, locks).await?;
        }
        Commands::Reactivations {
            command: ReactivationCommands::Show { ticket_id },
        } => {
            let ctx = build_context(&resolved).await?;
            let code = reactivations_cmd::run_show(&ctx, &ticket_id).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Cancel { ticket_id } => {
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let code = cancel_cmd::run_cancel(&db_pool, &ticket_id).await?;
            db_pool.close().await;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { ticket_id } => {
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, ticket_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
