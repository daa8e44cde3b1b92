use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::AddAssign;

/// Process identifier as reported by the OS connection table
pub type Pid = i32;

/// One side of a connection: an IP address and a port.
///
/// Equality is exact. An IPv4 address and its IPv4-mapped IPv6 form are
/// different endpoints.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Traffic counters for a connection or an aggregate of connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
}

impl IoCounters {
    /// Account one outgoing frame
    pub fn add_sent(&mut self, bytes: u64, decode_error: bool) {
        self.bytes_sent += bytes;
        self.packets_sent += 1;
        if decode_error {
            self.errors_out += 1;
        }
    }

    /// Account one incoming frame
    pub fn add_recv(&mut self, bytes: u64, decode_error: bool) {
        self.bytes_recv += bytes;
        self.packets_recv += 1;
        if decode_error {
            self.errors_in += 1;
        }
    }
}

impl AddAssign for IoCounters {
    fn add_assign(&mut self, other: Self) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_recv += other.bytes_recv;
        self.packets_sent += other.packets_sent;
        self.packets_recv += other.packets_recv;
        self.errors_in += other.errors_in;
        self.errors_out += other.errors_out;
    }
}
