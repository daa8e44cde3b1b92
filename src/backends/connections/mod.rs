// OS connection table backends

use super::{BackendCapabilities, BackendInfo, BackendPriority};
use crate::endpoint::{Endpoint, Pid};
use crate::error::TraceError;
use serde::Serialize;
use std::fmt;

#[cfg(target_os = "linux")]
pub mod procfs;

/// Which sockets a poll returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    All,
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
}

impl ConnectionKind {
    pub fn includes_tcp4(self) -> bool {
        matches!(self, Self::All | Self::Tcp | Self::Tcp4)
    }

    pub fn includes_tcp6(self) -> bool {
        matches!(self, Self::All | Self::Tcp | Self::Tcp6)
    }

    pub fn includes_udp4(self) -> bool {
        matches!(self, Self::All | Self::Udp | Self::Udp4)
    }

    pub fn includes_udp6(self) -> bool {
        matches!(self, Self::All | Self::Udp | Self::Udp6)
    }
}

/// Socket state as reported by the OS, netstat vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStatus {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Closed,
    Delete,
    /// Stateless sockets (UDP)
    None,
}

impl ConnectionStatus {
    /// States whose sockets no longer carry traffic for their process
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Close | Self::TimeWait | Self::Delete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Established => "ESTABLISHED",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::FinWait1 => "FIN_WAIT1",
            Self::FinWait2 => "FIN_WAIT2",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::Listen => "LISTEN",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Delete => "DELETE",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One socket from the OS connection table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsConnection {
    pub local: Endpoint,
    pub remote: Endpoint,
    pub pid: Pid,
    pub status: ConnectionStatus,
}

/// Source of the OS connection table
pub trait ConnectionProvider: Send + Sync {
    /// Backend name (e.g., "procfs")
    fn name(&self) -> &'static str;

    /// Backend priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Every socket of `kind` that has an owning process
    fn connections(&self, kind: ConnectionKind) -> Result<Vec<OsConnection>, TraceError>;
}

/// Detect all connection providers for this platform
pub fn detect_connection_providers() -> Vec<BackendInfo> {
    #[allow(unused_mut)]
    let mut providers = Vec::new();

    #[cfg(target_os = "linux")]
    {
        providers.push(BackendInfo {
            name: "procfs",
            priority: BackendPriority::Best,
            available: procfs::ProcfsConnections::is_available(),
            capabilities: procfs::ProcfsConnections.capabilities(),
        });
    }

    providers
}

/// Auto-select best available connection provider
pub fn select_connection_provider(
    preference: Option<&str>,
) -> Result<Box<dyn ConnectionProvider>, TraceError> {
    if let Some(name) = preference {
        return create_connection_provider(name);
    }

    detect_connection_providers()
        .iter()
        .filter(|p| p.available)
        .max_by_key(|p| p.priority)
        .and_then(|info| create_connection_provider(info.name).ok())
        .ok_or_else(|| {
            TraceError::ProviderUnavailable("no connection provider for this platform".to_string())
        })
}

fn create_connection_provider(name: &str) -> Result<Box<dyn ConnectionProvider>, TraceError> {
    match name {
        #[cfg(target_os = "linux")]
        "procfs" => Ok(Box::new(procfs::ProcfsConnections::new()?)),

        _ => Err(TraceError::ProviderUnavailable(format!(
            "unknown connection provider: {}",
            name
        ))),
    }
}
