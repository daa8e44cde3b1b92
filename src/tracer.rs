//! Tracing session: wires capture, reconciliation and queries together

use crate::backends::capture::{CaptureBackend, select_capture_backend};
use crate::backends::connections::{ConnectionProvider, select_connection_provider};
use crate::config::TracerConfig;
use crate::dispatcher::Dispatcher;
use crate::endpoint::{IoCounters, Pid};
use crate::error::TraceError;
use crate::reconciler::{Reconciler, report};
use crate::table::{ConnectionTable, InterfaceCounters, PidFilter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-process network I/O tracer.
///
/// Traffic is counted per local endpoint from captured packets; the OS
/// connection table says which process owns each endpoint. Connections that
/// open and close between two polls are attributed by remote endpoint, which
/// misattributes traffic when several processes talk to the same peer.
pub struct NetTracer {
    table: Arc<ConnectionTable>,
    config: TracerConfig,
    capture: Option<Arc<dyn CaptureBackend>>,
    provider: Option<Arc<dyn ConnectionProvider>>,
    started: AtomicBool,
}

impl NetTracer {
    /// Tracer using the configured (or best available) backends, selected
    /// when tracing starts
    pub fn new(config: TracerConfig) -> Self {
        Self {
            table: Arc::new(ConnectionTable::new()),
            config,
            capture: None,
            provider: None,
            started: AtomicBool::new(false),
        }
    }

    /// Tracer over explicit backends
    pub fn with_backends(
        config: TracerConfig,
        capture: Arc<dyn CaptureBackend>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            capture: Some(capture),
            provider: Some(provider),
            ..Self::new(config)
        }
    }

    /// Start capture and OS polling in the background.
    ///
    /// Must be called from within a tokio runtime. `poll_interval` is
    /// overridden by the configured interval, if any. Returns the channel on
    /// which the workers report faults; tracing continues with whatever still
    /// works after a fault. Both workers stop when `cancel` fires.
    ///
    /// # Panics
    ///
    /// When called a second time on the same tracer.
    pub fn start(
        &self,
        cancel: CancellationToken,
        filter: PidFilter,
        poll_interval: Duration,
    ) -> mpsc::Receiver<TraceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            panic!("Repeated tracing of process network I/O is not supported");
        }

        let (errors, receiver) = mpsc::channel(self.config.error_channel_capacity.max(1));
        let period = self.config.poll_interval_or(poll_interval);

        log::info!("Starting network tracing for {:?}, poll period {:?}", filter, period);

        let reconciler = {
            let provider = self.provider.clone();
            let preference = self.config.preferred_connection_provider.clone();
            let table = Arc::clone(&self.table);
            let errors = errors.clone();
            let cancel = cancel.clone();
            async move {
                let provider = match provider {
                    Some(provider) => provider,
                    None => match select_connection_provider(preference.as_deref()) {
                        Ok(provider) => Arc::from(provider),
                        Err(e) => return report(&errors, &cancel, e).await,
                    },
                };
                Reconciler {
                    provider,
                    table,
                    filter,
                    period,
                    errors,
                }
                .run(cancel)
                .await
            }
        };

        let dispatcher = {
            let backend = self.capture.clone();
            let table = Arc::clone(&self.table);
            let config = self.config.clone();
            async move {
                let backend = match backend {
                    Some(backend) => backend,
                    None => match select_capture_backend(config.preferred_capture_backend.as_deref()) {
                        Ok(backend) => Arc::from(backend),
                        Err(e) => return report(&errors, &cancel, e).await,
                    },
                };
                Dispatcher {
                    backend,
                    table,
                    config,
                    errors,
                }
                .run(cancel)
                .await
            }
        };

        tokio::spawn(reconciler);
        tokio::spawn(dispatcher);

        receiver
    }

    /// Traffic of `pid` summed over all its connections
    pub fn process_net_io_counters(&self, pid: Pid) -> Result<IoCounters, TraceError> {
        self.table.process_counters(pid)
    }

    /// Traffic of `pid` per capture interface
    pub fn process_net_io_counters_by_interface(
        &self,
        pid: Pid,
    ) -> Result<Vec<InterfaceCounters>, TraceError> {
        self.table.counters_by_interface(pid)
    }
}
