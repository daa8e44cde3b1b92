// Backend trait definitions and core types

pub mod capture;
pub mod connections;

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Fallback = 1, // Works but limited (shelling out, polling)
    Good = 2,     // Solid implementation (raw sockets)
    Better = 3,   // Kernel-side filtering
    Best = 4,     // Native APIs
}

/// Capabilities that a backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    pub ipv4_support: bool,
    pub ipv6_support: bool,
    /// Connections carry the owning PID
    pub per_process: bool,
    /// Protocol filtering happens in the kernel rather than in the reader
    pub kernel_filter: bool,
}

impl BackendCapabilities {
    /// Short feature list for `--list-backends`, e.g. `IPv4, IPv6, per-process`
    pub fn summary(&self) -> String {
        let features = [
            (self.ipv4_support, "IPv4"),
            (self.ipv6_support, "IPv6"),
            (self.per_process, "per-process"),
            (self.kernel_filter, "kernel filter"),
        ];
        features
            .iter()
            .filter(|(supported, _)| *supported)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Backend metadata for selection and `--list-backends`
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
    pub capabilities: BackendCapabilities,
}
