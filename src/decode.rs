//! Link-layer frame decoding down to TCP/UDP endpoints
//!
//! Only the IPv4/IPv6 (with IPv6 extension headers skipped) and TCP/UDP
//! headers are looked at. Anything else (ARP, ICMP, non-first fragments,
//! bogus frames) is "not decodable" and the caller drops it.

use crate::endpoint::Endpoint;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::{Ipv4Flags, Ipv4Packet};
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

// IPv6 extension headers walked before the transport header
const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_DEST_OPTIONS: u8 = 60;
const IPV6_FRAGMENT_HEADER_LEN: usize = 8;

/// Framing of the bytes a capture device hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Ethernet,
    /// No link header, the frame starts with the IP header (tun, ppp)
    RawIp,
}

/// Transport protocol of a decoded packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Result of decoding one captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub transport: Transport,
    /// Frame length on the wire, link header included. Bytes cut off by the
    /// capture snapshot length are counted from the IP length field.
    pub len: usize,
    /// Some header contradicts itself
    pub decode_error: bool,
}

struct IpLayer<'a> {
    source: IpAddr,
    destination: IpAddr,
    next_header: IpNextHeaderProtocol,
    payload: &'a [u8],
    /// Bytes announced by the IP header but not captured
    missing: usize,
    /// First fragment of a larger datagram, the transport payload continues
    /// in later fragments
    fragmented: bool,
    malformed: bool,
}

impl IpLayer<'_> {
    /// Whether the whole transport segment should be in `payload`
    fn complete(&self) -> bool {
        self.missing == 0 && !self.fragmented
    }
}

/// Decode a frame into its transport endpoints
pub fn decode(frame: &[u8], link: LinkType) -> Option<DecodedPacket> {
    let ip_bytes = network_layer(frame, link)?;
    let ip = decode_ipv4(ip_bytes).or_else(|| decode_ipv6(ip_bytes))?;

    let (source_port, destination_port, transport, malformed) = decode_tcp(&ip)
        .or_else(|| decode_udp(&ip))?;

    Some(DecodedPacket {
        source: Endpoint::new(ip.source, source_port),
        destination: Endpoint::new(ip.destination, destination_port),
        transport,
        len: frame.len() + ip.missing,
        decode_error: ip.malformed || malformed,
    })
}

fn network_layer(frame: &[u8], link: LinkType) -> Option<&[u8]> {
    match link {
        LinkType::RawIp => Some(frame),
        LinkType::Ethernet => {
            let ethernet = EthernetPacket::new(frame)?;
            match ethernet.get_ethertype() {
                EtherTypes::Ipv4 | EtherTypes::Ipv6 => frame.get(ETHERNET_HEADER_LEN..),
                EtherTypes::Vlan => {
                    // 802.1Q: TCI then the real ethertype
                    let inner = frame.get(ETHERNET_HEADER_LEN + 2..ETHERNET_HEADER_LEN + 4)?;
                    let ethertype = u16::from_be_bytes([inner[0], inner[1]]);
                    if ethertype == EtherTypes::Ipv4.0 || ethertype == EtherTypes::Ipv6.0 {
                        frame.get(ETHERNET_HEADER_LEN + VLAN_TAG_LEN..)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        }
    }
}

fn decode_ipv4(bytes: &[u8]) -> Option<IpLayer<'_>> {
    let ipv4 = Ipv4Packet::new(bytes)?;
    if ipv4.get_version() != 4 {
        return None;
    }

    let header_len = ipv4.get_header_length() as usize * 4;
    let total_len = ipv4.get_total_length() as usize;
    let malformed = header_len < IPV4_MIN_HEADER_LEN || total_len < header_len;

    // Later fragments carry no transport header
    if ipv4.get_fragment_offset() != 0 {
        return None;
    }

    // Ethernet padding sits past total_len; truncated frames end early
    let end = total_len.min(bytes.len());
    let start = header_len.max(IPV4_MIN_HEADER_LEN).min(end);

    Some(IpLayer {
        source: IpAddr::V4(ipv4.get_source()),
        destination: IpAddr::V4(ipv4.get_destination()),
        next_header: ipv4.get_next_level_protocol(),
        payload: &bytes[start..end],
        missing: total_len.saturating_sub(bytes.len()),
        fragmented: ipv4.get_flags() & Ipv4Flags::MoreFragments != 0,
        malformed,
    })
}

fn decode_ipv6(bytes: &[u8]) -> Option<IpLayer<'_>> {
    let ipv6 = Ipv6Packet::new(bytes)?;
    if ipv6.get_version() != 6 {
        return None;
    }

    let declared_end = IPV6_HEADER_LEN + ipv6.get_payload_length() as usize;
    let end = declared_end.min(bytes.len());
    let (next_header, payload, fragmented) =
        skip_ipv6_extensions(ipv6.get_next_header().0, &bytes[IPV6_HEADER_LEN..end])?;

    Some(IpLayer {
        source: IpAddr::V6(ipv6.get_source()),
        destination: IpAddr::V6(ipv6.get_destination()),
        next_header: IpNextHeaderProtocol::new(next_header),
        payload,
        missing: declared_end.saturating_sub(bytes.len()),
        fragmented,
        malformed: false,
    })
}

/// Walk the extension header chain to the upper-layer header.
///
/// Returns the upper-layer protocol, its bytes, and whether the packet is the
/// first fragment of a larger one. `None` for non-first fragments and for
/// chains cut short by the capture.
fn skip_ipv6_extensions(mut next: u8, mut payload: &[u8]) -> Option<(u8, &[u8], bool)> {
    let mut fragmented = false;

    loop {
        match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTIONS => {
                let header = payload.get(..2)?;
                let len = (header[1] as usize + 1) * 8;
                next = header[0];
                payload = payload.get(len..)?;
            }
            IPV6_FRAGMENT => {
                let header = payload.get(..IPV6_FRAGMENT_HEADER_LEN)?;
                let offset_flags = u16::from_be_bytes([header[2], header[3]]);
                if offset_flags >> 3 != 0 {
                    return None;
                }
                fragmented = offset_flags & 1 != 0;
                next = header[0];
                payload = &payload[IPV6_FRAGMENT_HEADER_LEN..];
            }
            _ => return Some((next, payload, fragmented)),
        }
    }
}

fn decode_tcp(ip: &IpLayer<'_>) -> Option<(u16, u16, Transport, bool)> {
    if ip.next_header != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let tcp = TcpPacket::new(ip.payload)?;
    let header_len = tcp.get_data_offset() as usize * 4;
    let malformed = header_len < 20 || (ip.complete() && header_len > ip.payload.len());

    Some((tcp.get_source(), tcp.get_destination(), Transport::Tcp, malformed))
}

fn decode_udp(ip: &IpLayer<'_>) -> Option<(u16, u16, Transport, bool)> {
    if ip.next_header != IpNextHeaderProtocols::Udp {
        return None;
    }
    let udp = UdpPacket::new(ip.payload)?;
    let len = udp.get_length() as usize;
    let malformed = len < 8 || (ip.complete() && len > ip.payload.len());

    Some((udp.get_source(), udp.get_destination(), Transport::Udp, malformed))
}
