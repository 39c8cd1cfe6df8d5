use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recall_sidecar::hooks;
use recall_sidecar::lifecycle::Lifecycle;

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server exposing the gateway hooks
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value = "7373")]
        port: String,
    },
    /// Run a sync pass against the note store and exit
    Sync {
        /// Force a full initial sync even if one has already run
        #[arg(long, action, default_value = "false")]
        force_initial: bool,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a TOML config file (defaults apply if absent)
    #[arg(long, default_value = "./recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{}=debug,tower_http=debug,axum::rejection=trace", env!("CARGO_CRATE_NAME")).into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Cli::parse();

    match args.command {
        Some(Command::Serve { host, port }) => {
            let lifecycle = Lifecycle::register(Some(&args.config), None).await?;
            let app = hooks::router(lifecycle);
            let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
            tracing::info!(addr = %listener.local_addr()?, "recall-sidecar listening");
            axum::serve(listener, app).await?;
        }
        Some(Command::Sync { force_initial }) => {
            let lifecycle = Lifecycle::register(Some(&args.config), None).await?;
            lifecycle.ensure_initialized().await;
            if force_initial {
                tracing::info!("forcing a full initial sync");
                lifecycle.force_initial_sync().await?;
            } else {
                lifecycle.run_incremental_sync().await?;
            }
            let stats = lifecycle.store().stats().await?;
            println!(
                "indexed_docs={} indexed_blocks={} last_sync={:?}",
                stats.total_docs, stats.total_blocks, stats.last_sync
            );
        }
        None => {
            let lifecycle = Lifecycle::register(Some(&args.config), None).await?;
            let app = hooks::router(lifecycle);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:7373").await?;
            tracing::info!(addr = %listener.local_addr()?, "recall-sidecar listening");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
