//! Local/remote classification of a packet's endpoints
//!
//! A packet only tells us source and destination. Which of the two belongs to
//! this host is decided against the addresses configured on the capturing
//! device.

use crate::backends::capture::DeviceAddress;
use crate::endpoint::Endpoint;

/// Split two endpoints into `(local, remote)` for a device.
///
/// Addresses are tried in device order. For each one:
/// - exactly one endpoint in the subnet: that endpoint is local
/// - both in the subnet (loopback, LAN peers): the endpoint with the
///   greater port is local; on equal ports the first argument wins
///
/// Returns `None` when no address of the device covers either endpoint.
pub fn classify(
    first: Endpoint,
    second: Endpoint,
    addresses: &[DeviceAddress],
) -> Option<(Endpoint, Endpoint)> {
    for address in addresses {
        let first_local = address.contains(first.ip);
        let second_local = address.contains(second.ip);

        match (first_local, second_local) {
            (true, false) => return Some((first, second)),
            (false, true) => return Some((second, first)),
            (true, true) if first.port >= second.port => return Some((first, second)),
            (true, true) => return Some((second, first)),
            (false, false) => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn ep(s: &str) -> Endpoint {
        let addr: std::net::SocketAddr = s.parse().unwrap();
        addr.into()
    }

    fn addr(ip: &str, mask: Option<&str>) -> DeviceAddress {
        DeviceAddress {
            ip: ip.parse().unwrap(),
            netmask: mask.map(|m| m.parse::<IpAddr>().unwrap()),
        }
    }

    fn eth0() -> Vec<DeviceAddress> {
        vec![
            addr("192.168.0.235", Some("255.255.255.0")),
            addr("fe80::7e0d:16a6:d0c9:2b9a", Some("ffff:ffff:ffff:ffff::")),
        ]
    }

    fn lo() -> Vec<DeviceAddress> {
        vec![addr("127.0.0.1", None), addr("::1", None)]
    }

    #[test]
    fn test_lan_and_internet_swap_invariant() {
        let lan = ep("192.168.0.235:49671");
        let internet = ep("31.13.80.53:443");

        assert_eq!(classify(lan, internet, &eth0()), Some((lan, internet)));
        assert_eq!(classify(internet, lan, &eth0()), Some((lan, internet)));
    }

    #[test]
    fn test_loopback_prefers_greater_port() {
        let high = ep("127.0.0.1:49667");
        let low = ep("127.0.0.1:1042");

        assert_eq!(classify(high, low, &lo()), Some((high, low)));
        assert_eq!(classify(low, high, &lo()), Some((high, low)));
    }

    // Source is taken as local, so swapping the arguments swaps the result
    #[test]
    fn test_same_subnet_equal_ports_not_swap_invariant() {
        let host = ep("192.168.0.180:137");
        let broadcast = ep("192.168.0.255:137");

        assert_eq!(classify(host, broadcast, &eth0()), Some((host, broadcast)));
        assert_eq!(classify(broadcast, host, &eth0()), Some((broadcast, host)));
    }

    #[test]
    fn test_foreign_endpoints_are_unclassified() {
        let loopback = ep("127.0.0.1:49667");
        let other = ep("172.28.216.133:5432");

        assert_eq!(classify(loopback, other, &eth0()), None);
        assert_eq!(classify(other, loopback, &eth0()), None);
        assert_eq!(classify(loopback, other, &[]), None);
    }

    #[test]
    fn test_ipv6_link_local() {
        let local = ep("[fe80::7e0d:16a6:d0c9:1]:50000");
        let remote = ep("[2606:4700:4700::1111]:443");

        assert_eq!(classify(remote, local, &eth0()), Some((local, remote)));
    }

    #[test]
    fn test_host_address_without_mask_is_exact() {
        let local = ep("127.0.0.1:8080");
        let other_loopback = ep("127.0.0.2:9000");

        assert_eq!(classify(other_loopback, local, &lo()), Some((local, other_loopback)));
    }
}
