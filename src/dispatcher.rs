//! Capture dispatcher: one reader thread per device, one consumer feeding the
//! connection table
//!
//! Reader threads block on their capture session, decode and filter frames,
//! and queue the packets. The dispatcher polls the queues round-robin without
//! blocking and sleeps briefly whenever a full pass finds nothing.

use crate::backends::capture::{CaptureBackend, CaptureDevice, CaptureFilter, FrameReader, select_active_devices};
use crate::config::TracerConfig;
use crate::decode::{DecodedPacket, decode};
use crate::error::TraceError;
use crate::reconciler::report;
use crate::table::ConnectionTable;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, sync_channel};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Idle sleep between empty passes, also the cancellation check period
pub const CHECK_DONE_INTERVAL: Duration = Duration::from_millis(10);

/// Back-off after a failed read
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Decoded packets a reader may queue ahead of the dispatcher
const READER_QUEUE_LEN: usize = 4096;

/// Queue of decoded packets from one device
pub(crate) struct PacketSource {
    pub device: CaptureDevice,
    pub packets: Receiver<DecodedPacket>,
}

/// What one pass over the sources found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    /// At least one packet handled
    Busy,
    Idle,
    /// Every source is gone
    Exhausted,
}

pub(crate) struct Dispatcher {
    pub backend: Arc<dyn CaptureBackend>,
    pub table: Arc<ConnectionTable>,
    pub config: TracerConfig,
    pub errors: mpsc::Sender<TraceError>,
}

impl Dispatcher {
    /// Open every active device and dispatch until cancelled or every
    /// capture session has ended. Failures are reported on the error channel;
    /// a device that cannot be opened is skipped.
    pub async fn run(self, cancel: CancellationToken) {
        let mut sources = self.open_sources(&cancel).await;
        if sources.is_empty() {
            log::warn!("No capture sessions, dispatcher exiting");
            return;
        }

        log::info!(
            "Capturing on {} device(s) with {}",
            sources.len(),
            self.backend.name()
        );

        let mut dispatched: u64 = 0;
        while !cancel.is_cancelled() {
            match next_pass(&mut sources, &self.table, &mut dispatched) {
                Pass::Busy => tokio::task::yield_now().await,
                Pass::Idle => tokio::time::sleep(CHECK_DONE_INTERVAL).await,
                Pass::Exhausted => {
                    log::warn!("All capture sessions ended");
                    break;
                }
            }
        }

        log::debug!("Capture dispatcher stopped after {} packets", dispatched);
    }

    async fn open_sources(&self, cancel: &CancellationToken) -> Vec<PacketSource> {
        let devices = match self.backend.devices() {
            Ok(devices) => devices,
            Err(e) => {
                report(&self.errors, cancel, e).await;
                return Vec::new();
            }
        };

        let active: Vec<CaptureDevice> = select_active_devices(devices)
            .into_iter()
            .filter(|d| self.config.allows_interface(&d.name))
            .collect();

        if active.is_empty() {
            report(&self.errors, cancel, TraceError::NoActiveDevices).await;
            return Vec::new();
        }

        let mut sources = Vec::with_capacity(active.len());
        for device in active {
            let filter = match CaptureFilter::parse(&self.config.capture.filter) {
                Ok(filter) => filter,
                Err(reason) => {
                    let error = TraceError::CaptureFilter {
                        device: device.name.clone(),
                        reason,
                    };
                    report(&self.errors, cancel, error).await;
                    continue;
                }
            };

            let reader = match self.backend.open(&device, &self.config.capture, filter) {
                Ok(reader) => reader,
                Err(e) => {
                    report(&self.errors, cancel, e).await;
                    continue;
                }
            };

            let userspace_filter = !self.backend.capabilities().kernel_filter;
            match spawn_reader(device.clone(), reader, filter, userspace_filter, cancel.clone()) {
                Ok(source) => sources.push(source),
                Err(source) => {
                    let error = TraceError::CaptureOpen {
                        device: device.name,
                        source,
                    };
                    report(&self.errors, cancel, error).await;
                }
            }
        }

        sources
    }
}

/// Start the blocking read loop for one device
pub(crate) fn spawn_reader(
    device: CaptureDevice,
    mut reader: Box<dyn FrameReader>,
    filter: CaptureFilter,
    userspace_filter: bool,
    cancel: CancellationToken,
) -> io::Result<PacketSource> {
    let (tx, rx): (SyncSender<DecodedPacket>, _) = sync_channel(READER_QUEUE_LEN);
    let name = device.name.clone();
    let link = device.link_type;

    thread::Builder::new()
        .name(format!("capture-{}", name))
        .spawn(move || {
            let mut frames: u64 = 0;
            while !cancel.is_cancelled() {
                match reader.read_frame() {
                    Ok(Some(frame)) => {
                        frames += 1;
                        if frames % 1000 == 0 {
                            log::debug!("{}: {} frames read", name, frames);
                        }

                        let Some(packet) = decode(frame, link) else {
                            continue;
                        };
                        if userspace_filter && !filter.accepts(packet.transport) {
                            continue;
                        }
                        if tx.send(packet).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::error!("Packet receive error on {}: {}", name, e);
                        thread::sleep(READ_ERROR_BACKOFF);
                    }
                }
            }
            log::debug!("Capture on {} closed", name);
        })?;

    Ok(PacketSource { device, packets: rx })
}

/// Take at most one packet from each source, in order. Disconnected sources
/// are dropped.
pub(crate) fn next_pass(
    sources: &mut Vec<PacketSource>,
    table: &ConnectionTable,
    dispatched: &mut u64,
) -> Pass {
    let mut busy = false;

    sources.retain(|source| match source.packets.try_recv() {
        Ok(packet) => {
            table.record_packet(&packet, &source.device);
            *dispatched += 1;
            busy = true;
            true
        }
        Err(TryRecvError::Empty) => true,
        Err(TryRecvError::Disconnected) => {
            log::debug!("Capture source {} disconnected", source.device.name);
            false
        }
    });

    if sources.is_empty() {
        Pass::Exhausted
    } else if busy {
        Pass::Busy
    } else {
        Pass::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::capture::{DeviceAddress, DeviceFlags};
    use crate::backends::{BackendCapabilities, BackendPriority};
    use crate::config::CaptureConfig;
    use crate::decode::LinkType;
    use crate::decode::fixtures::{TCP_FRAME, TCP_REPLY_FRAME, UDP_FRAME};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    struct ReplayReader {
        frames: VecDeque<Vec<u8>>,
        current: Vec<u8>,
    }

    impl ReplayReader {
        fn boxed(frames: &[&[u8]]) -> Box<dyn FrameReader> {
            Box::new(Self {
                frames: frames.iter().map(|f| f.to_vec()).collect(),
                current: Vec::new(),
            })
        }
    }

    impl FrameReader for ReplayReader {
        fn read_frame(&mut self) -> io::Result<Option<&[u8]>> {
            match self.frames.pop_front() {
                Some(frame) => {
                    self.current = frame;
                    Ok(Some(self.current.as_slice()))
                }
                None => {
                    thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }
    }

    /// Never yields a frame; counts readers dropped by their thread
    struct QuietReader {
        closed: Arc<AtomicUsize>,
    }

    impl FrameReader for QuietReader {
        fn read_frame(&mut self) -> io::Result<Option<&[u8]>> {
            thread::sleep(Duration::from_millis(1));
            Ok(None)
        }
    }

    impl Drop for QuietReader {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct QuietCapture {
        devices: Vec<CaptureDevice>,
        closed: Arc<AtomicUsize>,
    }

    impl CaptureBackend for QuietCapture {
        fn name(&self) -> &'static str {
            "quiet"
        }

        fn priority(&self) -> BackendPriority {
            BackendPriority::Fallback
        }

        fn is_available() -> bool {
            true
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }

        fn devices(&self) -> Result<Vec<CaptureDevice>, TraceError> {
            Ok(self.devices.clone())
        }

        fn open(
            &self,
            _device: &CaptureDevice,
            _config: &CaptureConfig,
            _filter: CaptureFilter,
        ) -> Result<Box<dyn FrameReader>, TraceError> {
            Ok(Box::new(QuietReader {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn wlo1() -> CaptureDevice {
        CaptureDevice {
            name: "wlo1".to_string(),
            flags: DeviceFlags::from_bits(0x1e),
            addresses: vec![DeviceAddress {
                ip: "192.168.0.235".parse().unwrap(),
                netmask: Some("255.255.255.0".parse().unwrap()),
            }],
            link_type: LinkType::Ethernet,
        }
    }

    fn drain(sources: &mut Vec<PacketSource>, table: &ConnectionTable, want: u64) -> u64 {
        let mut dispatched = 0;
        for _ in 0..5000 {
            if dispatched >= want {
                break;
            }
            if next_pass(sources, table, &mut dispatched) == Pass::Idle {
                thread::sleep(CHECK_DONE_INTERVAL);
            }
        }
        dispatched
    }

    #[test]
    fn test_reader_feeds_table() {
        let cancel = CancellationToken::new();
        let reader = ReplayReader::boxed(&[&TCP_FRAME, &TCP_REPLY_FRAME]);
        let source = spawn_reader(wlo1(), reader, CaptureFilter::TCP_OR_UDP, true, cancel.clone()).unwrap();
        let mut sources = vec![source];
        let table = ConnectionTable::new();

        assert_eq!(drain(&mut sources, &table, 2), 2);
        cancel.cancel();

        let (local, rec) = table.snapshot().pop().unwrap();
        assert_eq!(local.to_string(), "192.168.0.235:20781");
        assert_eq!(rec.counters.bytes_recv, 79);
        assert_eq!(rec.counters.bytes_sent, 54);
    }

    #[test]
    fn test_userspace_filter_drops_udp() {
        let cancel = CancellationToken::new();
        let reader = ReplayReader::boxed(&[&UDP_FRAME, &TCP_FRAME]);
        let tcp_only = CaptureFilter::parse("tcp").unwrap();
        let source = spawn_reader(wlo1(), reader, tcp_only, true, cancel.clone()).unwrap();
        let mut sources = vec![source];
        let table = ConnectionTable::new();

        assert_eq!(drain(&mut sources, &table, 1), 1);
        thread::sleep(Duration::from_millis(20));
        let mut extra = 0;
        next_pass(&mut sources, &table, &mut extra);
        cancel.cancel();

        assert_eq!(extra, 0);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatcher_and_readers() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut lo = wlo1();
        lo.name = "lo".to_string();
        let backend = QuietCapture {
            devices: vec![wlo1(), lo],
            closed: Arc::clone(&closed),
        };
        let (errors, mut reported) = mpsc::channel(4);
        let dispatcher = Dispatcher {
            backend: Arc::new(backend),
            table: Arc::new(ConnectionTable::new()),
            config: TracerConfig::default(),
            errors,
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), async {
            while closed.load(Ordering::SeqCst) < 2 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(reported.try_recv().is_err());
    }

    #[test]
    fn test_pass_takes_one_packet_per_source() {
        let (tx_a, rx_a) = sync_channel(8);
        let (tx_b, rx_b) = sync_channel(8);
        let packet = decode(&TCP_FRAME, LinkType::Ethernet).unwrap();
        for _ in 0..3 {
            tx_a.send(packet).unwrap();
        }
        tx_b.send(packet).unwrap();

        let mut sources = vec![
            PacketSource { device: wlo1(), packets: rx_a },
            PacketSource { device: wlo1(), packets: rx_b },
        ];
        let table = ConnectionTable::new();
        let mut dispatched = 0;

        assert_eq!(next_pass(&mut sources, &table, &mut dispatched), Pass::Busy);
        assert_eq!(dispatched, 2);
        assert_eq!(next_pass(&mut sources, &table, &mut dispatched), Pass::Busy);
        assert_eq!(dispatched, 3);

        drop(tx_b);
        next_pass(&mut sources, &table, &mut dispatched);
        assert_eq!(sources.len(), 1);
        assert_eq!(next_pass(&mut sources, &table, &mut dispatched), Pass::Idle);

        drop(tx_a);
        assert_eq!(next_pass(&mut sources, &table, &mut dispatched), Pass::Exhausted);
    }
}
