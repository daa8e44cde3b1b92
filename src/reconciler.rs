//! Periodic merge of the OS connection table into the connection table

use crate::backends::connections::{ConnectionKind, ConnectionProvider};
use crate::error::TraceError;
use crate::table::{ConnectionTable, PidFilter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Transient records survive this many poll periods without being seen
const EXPIRY_PERIODS: u32 = 2;

pub(crate) struct Reconciler {
    pub provider: Arc<dyn ConnectionProvider>,
    pub table: Arc<ConnectionTable>,
    pub filter: PidFilter,
    pub period: Duration,
    pub errors: mpsc::Sender<TraceError>,
}

impl Reconciler {
    /// Poll every `period` until cancelled. The first poll happens one period
    /// after start.
    pub async fn run(self, cancel: CancellationToken) {
        let expiry = self.period * EXPIRY_PERIODS;
        let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Polling {} every {:?} for {:?}",
            self.provider.name(),
            self.period,
            self.filter
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let provider = Arc::clone(&self.provider);
            let polled = tokio::task::spawn_blocking(move || provider.connections(ConnectionKind::All)).await;

            match polled {
                Ok(Ok(connections)) => {
                    let stats = self.table.reconcile(&connections, self.filter, expiry);
                    log::trace!(
                        "Reconciled {} sockets: {:?}, {} records",
                        connections.len(),
                        stats,
                        self.table.len()
                    );
                }
                Ok(Err(e)) => report(&self.errors, &cancel, e).await,
                Err(e) => {
                    report(
                        &self.errors,
                        &cancel,
                        TraceError::ConnectionPoll(format!("poll task failed: {}", e)),
                    )
                    .await
                }
            }
        }

        log::debug!("Connection reconciler stopped");
    }
}

/// Hand a fault to the session's error channel.
///
/// Waits while the channel is full, giving up on cancellation. A dropped
/// receiver is not a fault.
pub(crate) async fn report(
    errors: &mpsc::Sender<TraceError>,
    cancel: &CancellationToken,
    error: TraceError,
) {
    log::warn!("{}", error);

    tokio::select! {
        _ = cancel.cancelled() => {}
        sent = errors.send(error) => {
            if sent.is_err() {
                log::debug!("Error receiver dropped");
            }
        }
    }
}
