// CC-Proxy - Claude-compatible proxy for OpenAI and Anthropic backends
//
// Sits between a Claude client (notably the Claude Code CLI) and upstream
// model providers. For each messages request it validates the caller,
// routes the model through a tiered mapping, translates between the Claude
// and OpenAI wire formats where needed, runs the transformer pipeline,
// streams the answer back as SSE, and records the exchange in SQLite.
//
// Architecture:
// - server (axum): request orchestration and the JSON API
// - translate: Claude <-> OpenAI conversion and the streaming state machine
// - transform: per-provider request/response fixups
// - upstream (reqwest): OpenAI-compatible and native Anthropic calls
// - history (rusqlite): append-only request log behind a writer thread

mod cli;
mod config;
mod history;
mod protocol;
mod router;
mod server;
mod startup;
mod tokens;
mod transform;
mod translate;
mod upstream;

use anyhow::Context;
use clap::Parser;
use config::Config;
use history::{HistoryQuery, HistoryStore};
use router::ModelRouter;
use server::AppState;
use std::sync::Arc;
use transform::TransformerRegistry;
use upstream::UpstreamClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    if cli::handle_command(&args)? {
        return Ok(());
    }

    // A broken config file is a startup failure, not something to paper
    // over with defaults
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = &args.bind {
        config.bind_addr = bind.parse().context("invalid --bind address")?;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("ccproxy={},tower_http=info", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // Optional rotated file log next to stdout; the guard must outlive main
    let _file_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ccproxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    };

    startup::print_startup(&config);
    startup::log_startup(&config);

    // History store first: the router restores persisted selections from it
    let (history, history_writer) =
        HistoryStore::open(&config.db_path).context("failed to open history database")?;
    let query = Arc::new(HistoryQuery::new(&config.db_path)?);

    let persisted = query.tier_selections().unwrap_or_default();
    let config = Arc::new(config);
    let router = Arc::new(ModelRouter::new(config.clone(), persisted));
    let transformers = Arc::new(TransformerRegistry::from_config(&config.transformers));
    let upstream = Arc::new(UpstreamClient::new(
        config.request_timeout_secs,
        config.upstream_retries,
    )?);

    let state = AppState {
        config: config.clone(),
        router,
        transformers,
        upstream,
        history,
        query,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let mut server_task = tokio::spawn(server::serve(state, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            let _ = shutdown_tx.send(());
            match (&mut server_task).await {
                Ok(result) => result?,
                Err(e) => tracing::error!("Server task panicked: {e}"),
            }
        }
        // Bind failure or server error surfaces here as a non-zero exit
        result = &mut server_task => {
            result.context("server task failed")??;
        }
    }

    // Flush pending history writes before exit
    history_writer.shutdown();

    tracing::info!("Shutdown complete");
    Ok(())
}
