use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use ticket_intake::channels::{ImapMailbox, LogNotifier, Notifier, SmtpNotifier};
use ticket_intake::config::IngestConfig;
use ticket_intake::pipeline::{EngineSettings, IngestionEngine, spawn_ingestion_worker};
use ticket_intake::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let config = IngestConfig::from_env().context("invalid email intake configuration")?;
    let _log_guard = init_tracing(config.as_ref().and_then(|c| c.log_dir.as_deref()));

    let Some(config) = config else {
        info!(
            "Email intake disabled: set HELPDESK_IMAP_HOST, HELPDESK_IMAP_USERNAME and \
             HELPDESK_IMAP_PASSWORD to enable it"
        );
        return Ok(());
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.mailbox.host,
        mailbox = %config.mailbox.mailbox,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Ticket intake starting"
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Notifications ────────────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => {
            info!(host = %smtp.host, from = %smtp.from_address, "SMTP notifications enabled");
            Arc::new(SmtpNotifier::new(smtp).context("invalid SMTP configuration")?)
        }
        None => {
            info!("SMTP not configured, confirmations will only be logged");
            Arc::new(LogNotifier)
        }
    };

    // ── Worker ───────────────────────────────────────────────────────────
    let engine = Arc::new(IngestionEngine::new(
        ImapMailbox::new(config.mailbox.clone()),
        store.clone(),
        store,
        notifier,
        EngineSettings::from_config(&config),
    ));
    let (worker, shutdown) = spawn_ingestion_worker(engine, config.poll_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing in-flight message");
    shutdown.shutdown();
    worker.await.context("ingestion worker panicked")?;

    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
///
/// The returned guard flushes the file writer on drop and must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ticket-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
