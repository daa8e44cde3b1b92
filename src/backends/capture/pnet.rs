// pnet datalink capture backend

use super::{
    CaptureBackend, CaptureDevice, CaptureFilter, DeviceAddress, DeviceFlags, FrameReader,
    LinkStatus,
};
use crate::backends::{BackendCapabilities, BackendPriority};
use crate::config::CaptureConfig;
use crate::decode::LinkType;
use crate::error::TraceError;
use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use std::io;

// Kernel interface flags (IFF_*), identical on Linux and the BSDs
const IFF_UP: u32 = 0x1;
const IFF_POINTOPOINT: u32 = 0x10;
const IFF_RUNNING: u32 = 0x40;
#[cfg(target_os = "linux")]
const IFF_LOWER_UP: u32 = 0x1_0000;

/// Packet capture over pnet raw datalink channels.
///
/// pnet has no kernel-side filter; frames come back unfiltered and the
/// dispatcher drops what the filter rejects.
pub struct PnetCapture;

impl PnetCapture {
    pub fn new() -> Self {
        Self
    }

    fn to_capture_device(interface: &NetworkInterface) -> CaptureDevice {
        let link_type = if interface.mac.is_none() || interface.flags & IFF_POINTOPOINT != 0 {
            LinkType::RawIp
        } else {
            LinkType::Ethernet
        };

        let addresses = interface
            .ips
            .iter()
            .map(|network| DeviceAddress {
                ip: network.ip(),
                netmask: Some(network.mask()),
            })
            .collect();

        CaptureDevice {
            name: interface.name.clone(),
            flags: Self::device_flags(interface),
            addresses,
            link_type,
        }
    }

    fn device_flags(interface: &NetworkInterface) -> DeviceFlags {
        let loopback = interface.is_loopback();
        let running = interface.flags & IFF_RUNNING != 0;

        let link = if loopback {
            LinkStatus::NotApplicable
        } else if cfg!(target_os = "linux") {
            if Self::lower_up(interface) {
                LinkStatus::Connected
            } else {
                LinkStatus::Disconnected
            }
        } else if running {
            LinkStatus::Connected
        } else {
            LinkStatus::Unknown
        };

        DeviceFlags {
            loopback,
            up: interface.flags & IFF_UP != 0,
            running,
            wireless: Self::is_wireless(&interface.name),
            link,
        }
    }

    #[cfg(target_os = "linux")]
    fn lower_up(interface: &NetworkInterface) -> bool {
        interface.flags & IFF_LOWER_UP != 0
    }

    #[cfg(not(target_os = "linux"))]
    fn lower_up(_interface: &NetworkInterface) -> bool {
        false
    }

    fn is_wireless(name: &str) -> bool {
        cfg!(target_os = "linux")
            && std::path::Path::new("/sys/class/net")
                .join(name)
                .join("wireless")
                .exists()
    }
}

impl Default for PnetCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for PnetCapture {
    fn name(&self) -> &'static str {
        "pnet"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Good
    }

    fn is_available() -> bool {
        // pnet works on Linux and BSD with raw sockets, macOS with BPF
        cfg!(target_os = "linux")
            || cfg!(target_os = "macos")
            || cfg!(target_os = "freebsd")
            || cfg!(target_os = "openbsd")
            || cfg!(target_os = "netbsd")
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: true,
            per_process: false,
            kernel_filter: false,
        }
    }

    fn devices(&self) -> Result<Vec<CaptureDevice>, TraceError> {
        let interfaces = datalink::interfaces();
        if interfaces.is_empty() {
            return Err(TraceError::DeviceEnumeration(
                "no network interfaces reported".to_string(),
            ));
        }

        Ok(interfaces.iter().map(Self::to_capture_device).collect())
    }

    fn open(
        &self,
        device: &CaptureDevice,
        config: &CaptureConfig,
        filter: CaptureFilter,
    ) -> Result<Box<dyn FrameReader>, TraceError> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == device.name)
            .ok_or_else(|| TraceError::CaptureOpen {
                device: device.name.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "interface disappeared"),
            })?;

        let channel_config = datalink::Config {
            read_buffer_size: config.snaplen,
            read_timeout: Some(config.read_timeout()),
            promiscuous: config.promiscuous,
            ..Default::default()
        };

        let rx = match datalink::channel(&interface, channel_config) {
            Ok(Channel::Ethernet(_, rx)) => rx,
            Ok(_) => {
                return Err(TraceError::CaptureOpen {
                    device: device.name.clone(),
                    source: io::Error::new(io::ErrorKind::Unsupported, "unsupported channel type"),
                });
            }
            Err(e) => {
                return Err(TraceError::CaptureOpen {
                    device: device.name.clone(),
                    source: e,
                });
            }
        };

        log::info!(
            "Opened capture on {} ({:?}, snaplen {}, promiscuous {}, filter {:?} in userspace)",
            device.name,
            device.link_type,
            config.snaplen,
            config.promiscuous,
            filter
        );

        Ok(Box::new(PnetFrameReader { rx }))
    }
}

struct PnetFrameReader {
    rx: Box<dyn DataLinkReceiver>,
}

impl FrameReader for PnetFrameReader {
    fn read_frame(&mut self) -> io::Result<Option<&[u8]>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
