// Linux procfs connection provider

use super::{ConnectionKind, ConnectionProvider, ConnectionStatus, OsConnection};
use crate::backends::{BackendCapabilities, BackendPriority};
use crate::endpoint::{Endpoint, Pid};
use crate::error::TraceError;
use procfs::net::{TcpNetEntry, TcpState, UdpNetEntry};
use procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;

/// Connection provider using the Linux /proc filesystem
///
/// Sockets come from /proc/net/{tcp,tcp6,udp,udp6}; owners are found by
/// matching socket inodes against /proc/[pid]/fd/.
pub struct ProcfsConnections;

impl ProcfsConnections {
    pub fn new() -> Result<Self, TraceError> {
        if !Self::is_available() {
            return Err(TraceError::ProviderUnavailable(
                "procfs not available (is /proc mounted?)".to_string(),
            ));
        }
        Ok(Self)
    }

    /// Socket inode -> owning PID
    fn socket_owners() -> Result<HashMap<u64, Pid>, TraceError> {
        let mut owners = HashMap::new();

        let processes = all_processes()
            .map_err(|e| TraceError::ConnectionPoll(format!("cannot list processes: {}", e)))?;

        // Processes vanish and fd tables deny access all the time, skip those
        for process in processes.flatten() {
            let pid = process.pid();
            let Ok(fds) = process.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let FDTarget::Socket(inode) = fd.target {
                    owners.insert(inode, pid);
                }
            }
        }

        Ok(owners)
    }

    fn tcp_status(state: &TcpState) -> ConnectionStatus {
        #[allow(unreachable_patterns)]
        match state {
            TcpState::Established => ConnectionStatus::Established,
            TcpState::SynSent => ConnectionStatus::SynSent,
            TcpState::SynRecv | TcpState::NewSynRecv => ConnectionStatus::SynRecv,
            TcpState::FinWait1 => ConnectionStatus::FinWait1,
            TcpState::FinWait2 => ConnectionStatus::FinWait2,
            TcpState::TimeWait => ConnectionStatus::TimeWait,
            TcpState::Close => ConnectionStatus::Close,
            TcpState::CloseWait => ConnectionStatus::CloseWait,
            TcpState::LastAck => ConnectionStatus::LastAck,
            TcpState::Listen => ConnectionStatus::Listen,
            TcpState::Closing => ConnectionStatus::Closing,
            _ => ConnectionStatus::None,
        }
    }

    fn collect_tcp(
        entries: procfs::ProcResult<Vec<TcpNetEntry>>,
        owners: &HashMap<u64, Pid>,
        out: &mut Vec<OsConnection>,
    ) -> Result<(), TraceError> {
        let entries = entries
            .map_err(|e| TraceError::ConnectionPoll(format!("cannot read tcp table: {}", e)))?;

        out.extend(entries.iter().filter_map(|entry| {
            owners.get(&entry.inode).map(|&pid| OsConnection {
                local: Endpoint::from(entry.local_address),
                remote: Endpoint::from(entry.remote_address),
                pid,
                status: Self::tcp_status(&entry.state),
            })
        }));
        Ok(())
    }

    fn collect_udp(
        entries: procfs::ProcResult<Vec<UdpNetEntry>>,
        owners: &HashMap<u64, Pid>,
        out: &mut Vec<OsConnection>,
    ) -> Result<(), TraceError> {
        let entries = entries
            .map_err(|e| TraceError::ConnectionPoll(format!("cannot read udp table: {}", e)))?;

        out.extend(entries.iter().filter_map(|entry| {
            owners.get(&entry.inode).map(|&pid| OsConnection {
                local: Endpoint::from(entry.local_address),
                remote: Endpoint::from(entry.remote_address),
                pid,
                status: ConnectionStatus::None,
            })
        }));
        Ok(())
    }
}

impl ConnectionProvider for ProcfsConnections {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: true,
            per_process: true,
            kernel_filter: false,
        }
    }

    fn connections(&self, kind: ConnectionKind) -> Result<Vec<OsConnection>, TraceError> {
        let owners = Self::socket_owners()?;
        let mut connections = Vec::new();

        if kind.includes_tcp4() {
            Self::collect_tcp(procfs::net::tcp(), &owners, &mut connections)?;
        }
        // tcp6/udp6 are missing when IPv6 is disabled
        if kind.includes_tcp6() && std::path::Path::new("/proc/net/tcp6").exists() {
            Self::collect_tcp(procfs::net::tcp6(), &owners, &mut connections)?;
        }
        if kind.includes_udp4() {
            Self::collect_udp(procfs::net::udp(), &owners, &mut connections)?;
        }
        if kind.includes_udp6() && std::path::Path::new("/proc/net/udp6").exists() {
            Self::collect_udp(procfs::net::udp6(), &owners, &mut connections)?;
        }

        log::trace!(
            "procfs poll: {} owned sockets, {} inodes",
            connections.len(),
            owners.len()
        );
        Ok(connections)
    }
}
