// Error types shared by the capture and reconciliation workers

use crate::endpoint::Pid;

/// Faults reported by a tracing session.
///
/// Background workers never return these; they push them onto the session's
/// error channel and keep running with whatever still works.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("network device enumeration failed: {0}")]
    DeviceEnumeration(String),
    #[error("no active network devices found")]
    NoActiveDevices,
    #[error("cannot open capture on {device}: {source}")]
    CaptureOpen {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot apply capture filter on {device}: {reason}")]
    CaptureFilter { device: String, reason: String },
    #[error("no capture backend available: {0}")]
    CaptureUnavailable(String),
    #[error("connection poll failed: {0}")]
    ConnectionPoll(String),
    #[error("no connection provider available: {0}")]
    ProviderUnavailable(String),
    #[error("no net counters for pid {pid}")]
    NoData { pid: Pid },
    #[error("config error: {0}")]
    Config(String),
}

impl TraceError {
    /// Whether this is the query-miss case rather than a worker fault
    pub fn is_no_data(&self) -> bool {
        matches!(self, TraceError::NoData { .. })
    }
}
