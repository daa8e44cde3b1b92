// Packet capture backend trait, device model and device selection

use super::{BackendCapabilities, BackendInfo, BackendPriority};
use crate::config::CaptureConfig;
use crate::decode::{LinkType, Transport};
use crate::error::TraceError;
use std::io;
use std::net::IpAddr;

#[cfg(feature = "capture-pnet")]
pub mod pnet;

// Interface flag bits, libpcap PCAP_IF_* layout
pub const IF_LOOPBACK: u32 = 0x0000_0001;
pub const IF_UP: u32 = 0x0000_0002;
pub const IF_RUNNING: u32 = 0x0000_0004;
pub const IF_WIRELESS: u32 = 0x0000_0008;
pub const IF_CONNECTION_STATUS: u32 = 0x0000_0030;
pub const IF_CONNECTION_STATUS_UNKNOWN: u32 = 0x0000_0000;
pub const IF_CONNECTION_STATUS_CONNECTED: u32 = 0x0000_0010;
pub const IF_CONNECTION_STATUS_DISCONNECTED: u32 = 0x0000_0020;
pub const IF_CONNECTION_STATUS_NOT_APPLICABLE: u32 = 0x0000_0030;

/// Link state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Unknown,
    Connected,
    Disconnected,
    /// Devices without a physical link, e.g. loopback
    NotApplicable,
}

impl LinkStatus {
    /// Whether traffic can flow. Links without a notion of state count as
    /// connected.
    pub fn is_connected(self) -> bool {
        matches!(self, LinkStatus::Connected | LinkStatus::NotApplicable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFlags {
    pub loopback: bool,
    pub up: bool,
    pub running: bool,
    pub wireless: bool,
    pub link: LinkStatus,
}

impl DeviceFlags {
    pub fn from_bits(bits: u32) -> Self {
        let link = match bits & IF_CONNECTION_STATUS {
            IF_CONNECTION_STATUS_CONNECTED => LinkStatus::Connected,
            IF_CONNECTION_STATUS_DISCONNECTED => LinkStatus::Disconnected,
            IF_CONNECTION_STATUS_NOT_APPLICABLE => LinkStatus::NotApplicable,
            _ => LinkStatus::Unknown,
        };

        Self {
            loopback: bits & IF_LOOPBACK != 0,
            up: bits & IF_UP != 0,
            running: bits & IF_RUNNING != 0,
            wireless: bits & IF_WIRELESS != 0,
            link,
        }
    }
}

/// An address configured on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
    pub ip: IpAddr,
    /// `None` is a host address (full-length mask)
    pub netmask: Option<IpAddr>,
}

impl DeviceAddress {
    /// Masked comparison of `ip` against this address. Address families must
    /// agree; mapped IPv4-in-IPv6 forms are not converted.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.ip, ip, self.netmask) {
            (IpAddr::V4(own), IpAddr::V4(other), None) => own == other,
            (IpAddr::V6(own), IpAddr::V6(other), None) => own == other,
            (IpAddr::V4(own), IpAddr::V4(other), Some(IpAddr::V4(mask))) => {
                let mask = u32::from(mask);
                u32::from(own) & mask == u32::from(other) & mask
            }
            (IpAddr::V6(own), IpAddr::V6(other), Some(IpAddr::V6(mask))) => {
                let mask = u128::from(mask);
                u128::from(own) & mask == u128::from(other) & mask
            }
            _ => false,
        }
    }
}

/// A network interface as seen by a capture backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub name: String,
    pub flags: DeviceFlags,
    pub addresses: Vec<DeviceAddress>,
    pub link_type: LinkType,
}

impl CaptureDevice {
    /// Up, running, connected and address-bearing
    pub fn is_active(&self) -> bool {
        self.flags.up
            && self.flags.running
            && self.flags.link.is_connected()
            && !self.addresses.is_empty()
    }
}

/// Keep only devices traffic can be captured and attributed on
pub fn select_active_devices(devices: Vec<CaptureDevice>) -> Vec<CaptureDevice> {
    devices.into_iter().filter(CaptureDevice::is_active).collect()
}

/// Protocol filter applied to a capture session.
///
/// Accepts the small subset of the pcap filter language this crate needs:
/// `tcp`, `udp`, joined with `||` or `or`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFilter {
    pub tcp: bool,
    pub udp: bool,
}

impl CaptureFilter {
    pub const TCP_OR_UDP: CaptureFilter = CaptureFilter { tcp: true, udp: true };

    pub fn parse(expression: &str) -> Result<Self, String> {
        let mut filter = CaptureFilter {
            tcp: false,
            udp: false,
        };

        for token in expression.split_whitespace() {
            match token.to_ascii_lowercase().as_str() {
                "tcp" => filter.tcp = true,
                "udp" => filter.udp = true,
                "||" | "or" => {}
                other => return Err(format!("unsupported filter term '{}'", other)),
            }
        }

        if !filter.tcp && !filter.udp {
            return Err(format!("filter '{}' selects no protocol", expression));
        }
        Ok(filter)
    }

    pub fn accepts(&self, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => self.tcp,
            Transport::Udp => self.udp,
        }
    }
}

/// An open capture session on one device
pub trait FrameReader: Send {
    /// Next captured frame; `Ok(None)` when the read timed out
    fn read_frame(&mut self) -> io::Result<Option<&[u8]>>;
}

/// Packet capture backend trait
pub trait CaptureBackend: Send + Sync {
    /// Backend name (e.g., "pnet")
    fn name(&self) -> &'static str;

    /// Backend priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Enumerate all interfaces with their flags and addresses
    fn devices(&self) -> Result<Vec<CaptureDevice>, TraceError>;

    /// Open a live session on `device`.
    ///
    /// Backends reporting `kernel_filter` install `filter` on the session;
    /// the others return every frame and leave filtering to the caller.
    fn open(
        &self,
        device: &CaptureDevice,
        config: &CaptureConfig,
        filter: CaptureFilter,
    ) -> Result<Box<dyn FrameReader>, TraceError>;
}

/// Detect all capture backends compiled in
pub fn detect_capture_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "capture-pnet")]
    {
        backends.push(BackendInfo {
            name: "pnet",
            priority: BackendPriority::Good,
            available: pnet::PnetCapture::is_available(),
            capabilities: pnet::PnetCapture.capabilities(),
        });
    }

    backends
}

/// Auto-select best available capture backend
pub fn select_capture_backend(preference: Option<&str>) -> Result<Box<dyn CaptureBackend>, TraceError> {
    if let Some(name) = preference {
        return create_capture_backend(name);
    }

    detect_capture_backends()
        .iter()
        .filter(|b| b.available)
        .max_by_key(|b| b.priority)
        .and_then(|info| create_capture_backend(info.name).ok())
        .ok_or_else(|| TraceError::CaptureUnavailable("no capture backend available".to_string()))
}

fn create_capture_backend(name: &str) -> Result<Box<dyn CaptureBackend>, TraceError> {
    match name {
        #[cfg(feature = "capture-pnet")]
        "pnet" => Ok(Box::new(pnet::PnetCapture::new())),

        _ => Err(TraceError::CaptureUnavailable(format!(
            "unknown capture backend: {}",
            name
        ))),
    }
}
