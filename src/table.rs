//! Connection table: traffic counters keyed by local endpoint
//!
//! Two lock levels. The table-wide `RwLock` guards structure (insert and
//! evict); each record carries its own `Mutex` guarding counters, pid and
//! timestamps. The packet path only takes the read lock for endpoints it has
//! already seen, so counter updates never wait on a snapshot or on each other
//! unless they hit the same record.

use crate::backends::capture::CaptureDevice;
use crate::backends::connections::OsConnection;
use crate::classify::classify;
use crate::decode::DecodedPacket;
use crate::endpoint::{Endpoint, IoCounters, Pid};
use crate::error::TraceError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Which processes the reconciler keeps connections for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidFilter {
    Any,
    Pid(Pid),
}

impl PidFilter {
    pub fn matches(self, pid: Pid) -> bool {
        match self {
            PidFilter::Any => true,
            PidFilter::Pid(wanted) => wanted == pid,
        }
    }
}

/// Per-connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// `None` until the OS connection table (or a guess) names the owner
    pub pid: Option<Pid>,
    pub counters: IoCounters,
    /// Peer endpoint, only used for PID guessing
    pub remote: Endpoint,
    /// Device the first packet was captured on
    pub interface: Option<String>,
    pub last_update: Instant,
}

impl ConnectionRecord {
    fn new(pid: Option<Pid>, remote: Endpoint, now: Instant) -> Self {
        Self {
            pid,
            counters: IoCounters::default(),
            remote,
            interface: None,
            last_update: now,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.pid.is_none()
    }
}

/// Counters of one process on one interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceCounters {
    /// `None` for connections known from the OS poll that saw no packets
    pub interface: Option<String>,
    #[serde(flatten)]
    pub counters: IoCounters,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub evicted: usize,
    pub added: usize,
    pub resolved: usize,
    pub guessed: usize,
}

type Records = HashMap<Endpoint, Mutex<ConnectionRecord>>;

#[derive(Debug, Default)]
pub struct ConnectionTable {
    records: RwLock<Records>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Account a captured packet to the record of its local endpoint.
    ///
    /// The source endpoint is tried first, then the destination. A packet
    /// matching neither is classified against `device` and opens a transient
    /// record; packets that classify as foreign are dropped. Returns the local
    /// endpoint the packet was accounted to.
    pub fn record_packet(&self, packet: &DecodedPacket, device: &CaptureDevice) -> Option<Endpoint> {
        {
            let records = self.records.read();
            if let Some(local) = Self::account(&records, packet, &device.name) {
                return Some(local);
            }
        }

        let (local, remote) = match classify(packet.source, packet.destination, &device.addresses) {
            Some(pair) => pair,
            None => {
                log::trace!(
                    "Dropping {} -> {} on {}: no local endpoint",
                    packet.source,
                    packet.destination,
                    device.name
                );
                return None;
            }
        };

        let mut records = self.records.write();
        // Another capture thread may have opened it meanwhile
        if let Some(local) = Self::account(&records, packet, &device.name) {
            return Some(local);
        }

        log::debug!("New transient connection {} <-> {} on {}", local, remote, device.name);
        records.insert(local, Mutex::new(ConnectionRecord::new(None, remote, Instant::now())));
        Self::account(&records, packet, &device.name)
    }

    fn account(records: &Records, packet: &DecodedPacket, interface: &str) -> Option<Endpoint> {
        let bytes = packet.len as u64;

        let (local, record, sent) = if let Some(record) = records.get(&packet.source) {
            (packet.source, record, true)
        } else if let Some(record) = records.get(&packet.destination) {
            (packet.destination, record, false)
        } else {
            return None;
        };

        let mut record = record.lock();
        if sent {
            record.counters.add_sent(bytes, packet.decode_error);
        } else {
            record.counters.add_recv(bytes, packet.decode_error);
        }
        if record.interface.is_none() {
            record.interface = Some(interface.to_string());
        }
        record.last_update = Instant::now();

        Some(local)
    }

    /// Consistent copy of every record
    pub fn snapshot(&self) -> Vec<(Endpoint, ConnectionRecord)> {
        let records = self.records.read();
        records
            .iter()
            .map(|(local, record)| (*local, record.lock().clone()))
            .collect()
    }

    /// Counters summed over every connection of `pid`
    pub fn process_counters(&self, pid: Pid) -> Result<IoCounters, TraceError> {
        let mut total = IoCounters::default();
        let mut found = false;

        for (_, record) in self.snapshot() {
            if record.pid == Some(pid) {
                total += record.counters;
                found = true;
            }
        }

        if found {
            Ok(total)
        } else {
            Err(TraceError::NoData { pid })
        }
    }

    /// Counters of `pid` split by capture interface, ordered by name
    pub fn counters_by_interface(&self, pid: Pid) -> Result<Vec<InterfaceCounters>, TraceError> {
        let mut by_interface: BTreeMap<Option<String>, IoCounters> = BTreeMap::new();

        for (_, record) in self.snapshot() {
            if record.pid == Some(pid) {
                *by_interface.entry(record.interface).or_default() += record.counters;
            }
        }

        if by_interface.is_empty() {
            return Err(TraceError::NoData { pid });
        }

        Ok(by_interface
            .into_iter()
            .map(|(interface, counters)| InterfaceCounters { interface, counters })
            .collect())
    }

    /// Merge one OS connection poll into the table.
    ///
    /// `polled` is the full poll result; only live sockets passing `filter`
    /// take part in the merge. Transient records whose endpoint is not polled
    /// are evicted once older than `expiry`. Resolved records are never
    /// evicted, so connections that closed after their owner was known stay
    /// in the table for the life of the session.
    pub fn reconcile(
        &self,
        polled: &[OsConnection],
        filter: PidFilter,
        expiry: Duration,
    ) -> ReconcileStats {
        self.reconcile_at(polled, filter, expiry, Instant::now())
    }

    fn reconcile_at(
        &self,
        polled: &[OsConnection],
        filter: PidFilter,
        expiry: Duration,
        now: Instant,
    ) -> ReconcileStats {
        let live: HashMap<Endpoint, &OsConnection> = polled
            .iter()
            .filter(|c| !c.status.is_inactive() && filter.matches(c.pid))
            .map(|c| (c.local, c))
            .collect();

        let mut stats = ReconcileStats::default();
        let mut records = self.records.write();

        records.retain(|local, record| {
            let record = record.get_mut();
            match live.get(local) {
                Some(conn) => {
                    if record.pid.is_none() {
                        log::debug!("Resolved {} -> {} to pid {}", local, record.remote, conn.pid);
                        record.pid = Some(conn.pid);
                        stats.resolved += 1;
                    }
                    record.last_update = now;
                    true
                }
                None if record.is_transient()
                    && now.saturating_duration_since(record.last_update) > expiry =>
                {
                    log::trace!("Evicting transient connection {} -> {}", local, record.remote);
                    stats.evicted += 1;
                    false
                }
                None => true,
            }
        });

        for (local, conn) in &live {
            if !records.contains_key(local) {
                records.insert(*local, Mutex::new(ConnectionRecord::new(Some(conn.pid), conn.remote, now)));
                stats.added += 1;
            }
        }

        if records.values_mut().any(|r| r.get_mut().is_transient()) {
            stats.guessed = Self::guess_pids_by_remote(&mut records, polled);
        }

        stats
    }

    /// Attribute transient records by their remote endpoint.
    ///
    /// Catches connections opened and closed between two polls, on the
    /// assumption that a process talks to the same peer repeatedly. Wrong
    /// when several processes share a remote endpoint: the last polled
    /// socket to that peer wins.
    fn guess_pids_by_remote(records: &mut Records, polled: &[OsConnection]) -> usize {
        let by_remote: HashMap<Endpoint, Pid> = polled.iter().map(|c| (c.remote, c.pid)).collect();
        let mut guessed = 0;

        for (local, record) in records.iter_mut() {
            let record = record.get_mut();
            if record.pid.is_some() {
                continue;
            }
            if let Some(&pid) = by_remote.get(&record.remote) {
                log::debug!("Guessed pid {} for {} -> {}", pid, local, record.remote);
                record.pid = Some(pid);
                guessed += 1;
            }
        }

        guessed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::capture::{DeviceAddress, DeviceFlags};
    use crate::backends::connections::ConnectionStatus;
    use crate::decode::fixtures::{TCP_FRAME, TCP_REPLY_FRAME};
    use crate::decode::{LinkType, Transport, decode};
    use std::sync::Arc;

    fn ep(s: &str) -> Endpoint {
        let addr: std::net::SocketAddr = s.parse().unwrap();
        addr.into()
    }

    fn wlo1() -> CaptureDevice {
        CaptureDevice {
            name: "wlo1".to_string(),
            flags: DeviceFlags::from_bits(0x1e),
            addresses: vec![DeviceAddress {
                ip: "192.168.0.235".parse().unwrap(),
                netmask: None,
            }],
            link_type: LinkType::Ethernet,
        }
    }

    fn conn(local: &str, remote: &str, pid: Pid) -> OsConnection {
        OsConnection {
            local: ep(local),
            remote: ep(remote),
            pid,
            status: ConnectionStatus::Established,
        }
    }

    fn record(table: &ConnectionTable, local: &str) -> Option<ConnectionRecord> {
        table
            .snapshot()
            .into_iter()
            .find(|(l, _)| *l == ep(local))
            .map(|(_, r)| r)
    }

    fn insert(table: &ConnectionTable, local: &str, pid: Option<Pid>, counters: IoCounters) {
        let mut rec = ConnectionRecord::new(pid, ep("1.1.1.1:443"), Instant::now());
        rec.counters = counters;
        table.records.write().insert(ep(local), Mutex::new(rec));
    }

    fn counters(bytes_sent: u64, bytes_recv: u64, packets_sent: u64, packets_recv: u64) -> IoCounters {
        IoCounters {
            bytes_sent,
            bytes_recv,
            packets_sent,
            packets_recv,
            ..Default::default()
        }
    }

    #[test]
    fn test_packet_creates_transient_record() {
        let table = ConnectionTable::new();
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();

        assert_eq!(table.record_packet(&packet, &wlo1()), Some(ep("192.168.0.235:20781")));
        assert_eq!(table.len(), 1);

        let rec = record(&table, "192.168.0.235:20781").unwrap();
        assert_eq!(rec.pid, None);
        assert_eq!(rec.remote, ep("104.18.138.67:443"));
        assert_eq!(rec.interface.as_deref(), Some("wlo1"));
        assert_eq!(rec.counters.packets_recv, 1);
        assert_eq!(rec.counters.bytes_recv, 79);
        assert_eq!(rec.counters.packets_sent, 0);
    }

    #[test]
    fn test_reply_lands_on_same_record() {
        let table = ConnectionTable::new();
        let request = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        let reply = decode(&TCP_REPLY_FRAME, LinkType::Ethernet).unwrap();

        table.record_packet(&request, &wlo1());
        table.record_packet(&reply, &wlo1());

        assert_eq!(table.len(), 1);
        let rec = record(&table, "192.168.0.235:20781").unwrap();
        assert_eq!(rec.counters, counters(54, 79, 1, 1));
    }

    #[test]
    fn test_same_packet_twice_one_record() {
        let table = ConnectionTable::new();
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();

        table.record_packet(&packet, &wlo1());
        table.record_packet(&packet, &wlo1());

        assert_eq!(table.len(), 1);
        let rec = record(&table, "192.168.0.235:20781").unwrap();
        assert_eq!(rec.counters.packets_recv, 2);
        assert_eq!(rec.counters.bytes_recv, 158);
    }

    #[test]
    fn test_foreign_packet_dropped() {
        let table = ConnectionTable::new();
        let packet = DecodedPacket {
            source: ep("10.1.1.1:5000"),
            destination: ep("10.1.1.2:80"),
            transport: Transport::Tcp,
            len: 60,
            decode_error: false,
        };

        assert_eq!(table.record_packet(&packet, &wlo1()), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_decode_error_counts() {
        let table = ConnectionTable::new();
        let mut packet = decode(&TCP_REPLY_FRAME, LinkType::Ethernet).unwrap();
        packet.decode_error = true;

        table.record_packet(&packet, &wlo1());

        let rec = record(&table, "192.168.0.235:20781").unwrap();
        assert_eq!(rec.counters.errors_out, 1);
        assert_eq!(rec.counters.errors_in, 0);
    }

    #[test]
    fn test_process_counters() {
        let table = ConnectionTable::new();
        insert(&table, "192.168.0.235:20781", Some(111), counters(111, 222, 3, 4));
        insert(&table, "127.0.0.1:22137", Some(111), counters(333, 44, 2, 2));
        insert(&table, "192.168.0.235:20675", Some(411), counters(444, 57, 5, 7));
        insert(&table, "192.168.0.235:31000", None, counters(9, 9, 1, 1));

        let total = table.process_counters(111).unwrap();
        assert_eq!(total.bytes_sent, 444);
        assert_eq!(total.bytes_recv, 266);
        assert_eq!(total.packets_sent, 5);
        assert_eq!(total.packets_recv, 6);

        assert!(matches!(
            table.process_counters(777),
            Err(TraceError::NoData { pid: 777 })
        ));
    }

    #[test]
    fn test_counters_by_interface() {
        let table = ConnectionTable::new();
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        table.record_packet(&packet, &wlo1());
        table.reconcile(
            &[conn("192.168.0.235:20781", "104.18.138.67:443", 111)],
            PidFilter::Any,
            Duration::from_secs(1),
        );
        insert(&table, "127.0.0.1:22137", Some(111), counters(333, 44, 2, 2));

        let split = table.counters_by_interface(111).unwrap();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].interface, None);
        assert_eq!(split[0].counters.bytes_sent, 333);
        assert_eq!(split[1].interface.as_deref(), Some("wlo1"));
        assert_eq!(split[1].counters.bytes_recv, 79);

        assert!(table.counters_by_interface(5).unwrap_err().is_no_data());
    }

    #[test]
    fn test_reconcile_poll_sequence() {
        let table = ConnectionTable::new();
        let filter = PidFilter::Pid(111);
        let expiry = Duration::from_millis(20);
        let (a, b, c) = ("10.0.0.1:1000", "10.0.0.1:1001", "10.0.0.1:1002");
        let remote = "10.0.0.9:80";

        table.reconcile(&[conn(a, remote, 222)], filter, expiry);
        assert!(table.is_empty());

        table.reconcile(&[conn(a, remote, 111), conn(b, remote, 111)], filter, expiry);
        assert_eq!(table.len(), 2);
        assert_eq!(record(&table, a).unwrap().pid, Some(111));
        assert!(record(&table, b).is_some());

        let third = [conn(a, remote, 111), conn(c, remote, 111)];
        table.reconcile(&third, filter, expiry);
        assert_eq!(table.len(), 3);

        std::thread::sleep(Duration::from_millis(40));
        table.reconcile(&third, filter, expiry);
        assert_eq!(table.len(), 3);
        for local in [a, b, c] {
            assert_eq!(record(&table, local).unwrap().pid, Some(111));
        }
    }

    #[test]
    fn test_transient_evicted_after_expiry() {
        let table = ConnectionTable::new();
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        table.record_packet(&packet, &wlo1());
        let start = record(&table, "192.168.0.235:20781").unwrap().last_update;
        let expiry = Duration::from_millis(200);

        let stats = table.reconcile_at(&[], PidFilter::Any, expiry, start + Duration::from_millis(100));
        assert_eq!(stats.evicted, 0);
        assert_eq!(table.len(), 1);

        let stats = table.reconcile_at(&[], PidFilter::Any, expiry, start + Duration::from_millis(201));
        assert_eq!(stats.evicted, 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolved_record_never_expires() {
        let table = ConnectionTable::new();
        let now = Instant::now();
        table.reconcile_at(
            &[conn("10.0.0.1:1000", "10.0.0.9:80", 111)],
            PidFilter::Any,
            Duration::from_millis(20),
            now,
        );

        let stats = table.reconcile_at(&[], PidFilter::Any, Duration::from_millis(20), now + Duration::from_secs(3600));
        assert_eq!(stats.evicted, 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_inactive_and_filtered_sockets_ignored() {
        let table = ConnectionTable::new();
        let mut closing = conn("10.0.0.1:1000", "10.0.0.9:80", 111);
        closing.status = ConnectionStatus::TimeWait;
        let other = conn("10.0.0.1:1001", "10.0.0.9:80", 5);

        let stats = table.reconcile(&[closing, other], PidFilter::Pid(111), Duration::from_secs(1));
        assert_eq!(stats.added, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_poll_resolves_transient() {
        let table = ConnectionTable::new();
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        table.record_packet(&packet, &wlo1());

        let stats = table.reconcile(
            &[conn("192.168.0.235:20781", "104.18.138.67:443", 111)],
            PidFilter::Pid(111),
            Duration::from_secs(1),
        );

        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.added, 0);
        let rec = record(&table, "192.168.0.235:20781").unwrap();
        assert_eq!(rec.pid, Some(111));
        assert_eq!(rec.counters.bytes_recv, 79);
    }

    #[test]
    fn test_guess_pid_by_remote() {
        let table = ConnectionTable::new();
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        table.record_packet(&packet, &wlo1());

        // The short-lived socket is gone, but the process still talks to the same peer
        let mut still_open = conn("192.168.0.235:20999", "104.18.138.67:443", 111);
        still_open.status = ConnectionStatus::TimeWait;
        let stats = table.reconcile(&[still_open], PidFilter::Pid(111), Duration::from_secs(1));

        assert_eq!(stats.guessed, 1);
        assert_eq!(record(&table, "192.168.0.235:20781").unwrap().pid, Some(111));
        assert_eq!(table.process_counters(111).unwrap().bytes_recv, 79);
    }

    #[test]
    fn test_concurrent_snapshot_is_consistent() {
        let table = Arc::new(ConnectionTable::new());
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        let device = wlo1();
        table.record_packet(&packet, &device);

        let writer = {
            let table = Arc::clone(&table);
            let device = device.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    table.record_packet(&packet, &device);
                }
            })
        };

        for _ in 0..200 {
            for (_, rec) in table.snapshot() {
                assert_eq!(rec.counters.bytes_recv, rec.counters.packets_recv * 79);
            }
        }
        writer.join().unwrap();

        let rec = record(&table, "192.168.0.235:20781").unwrap();
        assert_eq!(rec.counters.packets_recv, 10_001);
    }
}
