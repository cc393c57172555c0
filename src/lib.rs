//! Rental settlement service.
//!
//! Reconciles returned rental items against what was delivered, routes each
//! unit to stock, laundry or the archive, computes damage and loss fees
//! against the deposit, and records exactly one settlement and invoice per
//! booking. Served over HTTP by [`run`].

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod bookings;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod fees;
pub mod http;
pub mod inventory;
pub mod invoice_renderer;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod returns;
pub mod settlement;

use config::AppConfig;
use invoice_renderer::{HtmlInvoiceRenderer, InvoiceRenderer};
use notify::{DisabledNotifier, Notifier, WatiNotifier};

// ============================================================================
// Entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    init_logging(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        "Starting rental settlement service"
    );

    let db = db::init(&config.data_dir)
        .map_err(anyhow::Error::msg)
        .context("database initialization failed")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(serve(config, Arc::new(db)))
}

fn init_logging(config: &AppConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rental_settlement_lib=debug"));

    diagnostics::prune_old_logs(&config.log_dir);
    std::fs::create_dir_all(&config.log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Dropping the guard flushes and stops the writer; it lives until exit.
    std::mem::forget(guard);
}

fn build_notifier(config: &AppConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.wati {
        Some(wati) => {
            let notifier = WatiNotifier::new(&wati.base_url, wati.api_token.clone())
                .context("failed to create WhatsApp notifier")?;
            info!(base_url = %wati.base_url, "WhatsApp invoice notifications enabled");
            Ok(Arc::new(notifier))
        }
        None => {
            info!("WhatsApp provider not configured, invoice notifications disabled");
            Ok(Arc::new(DisabledNotifier))
        }
    }
}

async fn serve(config: AppConfig, db: Arc<db::DbState>) -> anyhow::Result<()> {
    let renderer: Arc<dyn InvoiceRenderer> = Arc::new(HtmlInvoiceRenderer::new(&config.invoice_dir));
    let notifier = build_notifier(&config)?;

    match settlement::resume_pending(db.clone(), renderer.as_ref(), notifier.clone()).await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "resumed settlement post-commit steps"),
        Err(e) => warn!(error = %e, "could not resume pending settlements"),
    }

    let app = http::router(http::AppState {
        db,
        renderer,
        notifier,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!(address = %config.bind_address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
