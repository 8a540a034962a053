//! Background worker: runs an ingestion cycle at startup and then on a
//! fixed interval until shut down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::channels::mailbox::MailboxClient;
use crate::pipeline::engine::{CycleOutcome, IngestionEngine};

/// Create a linked shutdown handle and signal.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// Requests shutdown. Dropping it without calling `shutdown` does not stop
/// the worker.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal observing this handle.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes a `ShutdownHandle`.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the handle was
    /// dropped without requesting it.
    pub async fn wait(&mut self) {
        let closed = self.rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Spawn the ingestion worker.
///
/// The first cycle runs immediately. Ticks that fire while a cycle is still
/// draining are skipped, not queued. After `shutdown`, the in-flight message
/// finishes, the session closes and the task exits.
pub fn spawn_ingestion_worker<M>(
    engine: Arc<IngestionEngine<M>>,
    interval: Duration,
) -> (JoinHandle<()>, ShutdownHandle)
where
    M: MailboxClient + 'static,
{
    let (handle, mut signal) = shutdown_channel();

    let task = tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Email ingestion worker started"
        );

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = signal.wait() => break,
                _ = tick.tick() => {}
            }

            match engine.run_cycle(&signal).await {
                CycleOutcome::Completed(report) if report.interrupted => break,
                CycleOutcome::Completed(_) => {}
                CycleOutcome::Aborted { reason } => {
                    warn!(reason = %reason, "Ingestion cycle aborted");
                }
                CycleOutcome::Skipped => {
                    info!("Previous ingestion cycle still running, tick skipped");
                }
            }
        }

        info!("Email ingestion worker stopped");
    });

    (task, handle)
}
