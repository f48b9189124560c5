//! Application entry point for the `riverflow-live` service.
//!
//! This binary orchestrates the full startup sequence for the live
//! water-level pipeline:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Creating a lazy PostgreSQL pool and the schema (non-fatal if the
//!   database is down; durable writes are best-effort)
//! - Restoring live state from the last snapshot
//! - Mounting all API routes via the `routes` gateway
//! - Serving until SIGINT/SIGTERM, then draining durable writes and
//!   flushing the final live snapshot
//!
//! # Environment Variables
//! See [`config::load_from_env`] for the pipeline settings. Logging is
//! controlled by:
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – force ANSI colours on or off
//!
//! Binding the listener is the only fatal failure once configuration is valid.
use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

mod alert;
mod config;
mod confirm;
mod hub;
mod live_store;
mod models;
mod routes;
mod schema;
mod session;
mod store;
mod throttle;

// Re-exported so routes/*.rs and the pipeline modules depend on their
// parent module rather than on each other's file layout.
pub use config::Config;
pub use session::Session;

use live_store::LiveStore;
use store::{DurableStore, PgStore};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let pool = PgPoolOptions::new()
        .max_connections(cfg.db_pool_max)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy(&cfg.db_url)
        .context("Invalid DATABASE_URL")?;

    match schema::create_schema(&pool).await {
        Ok(()) => tracing::info!("Database schema ready"),
        Err(e) => tracing::warn!(
            "Database unavailable at startup, durable writes will retry: {:#}",
            e
        ),
    }

    let store: Arc<dyn DurableStore> = Arc::new(PgStore::new(pool));
    let live = Arc::new(LiveStore::load(&cfg.live_snapshot_path, cfg.history_len));
    let session = Arc::new(Session::new(&cfg, store, Arc::clone(&live)));
    session.preload_thresholds().await;

    let snapshot_writer =
        live_store::spawn_snapshot_writer(Arc::clone(&live), cfg.live_snapshot_path.clone());

    // Build app from routes gateway
    let app: Router = routes::router(Arc::clone(&session));

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
    tracing::info!("Listening on {}", cfg.listen_addr);
    tracing::info!("  POST /reading   ingestion");
    tracing::info!("  GET  /live      live state");
    tracing::info!("  GET  /ws        live push channel");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    session.shutdown(cfg.shutdown_grace).await;
    snapshot_writer.abort();
    match live.save_snapshot(&cfg.live_snapshot_path).await {
        Ok(()) => tracing::info!("Final live snapshot written"),
        Err(e) => tracing::warn!("Failed to write final live snapshot: {}", e),
    }

    Ok(())
}

// ---

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// - Color output controlled by TTY detection and `FORCE_COLOR`:
///   `1|true|yes` forces colors on, `0|false|no` forces them off
/// - Span event emission mode controlled by `AXUM_SPAN_EVENTS`:
///   `"full"` for ENTER/EXIT/CLOSE, `"enter_exit"` for ENTER/EXIT,
///   otherwise CLOSE only
/// - `RUST_LOG` wins if set; otherwise the level comes from `AXUM_LOG_LEVEL`
///
/// Called once at startup before any logging macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,hyper=info"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
