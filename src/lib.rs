//! Per-process network I/O counters.
//!
//! Packets captured on every active interface are counted per local
//! endpoint; a periodic poll of the OS connection table maps endpoints to the
//! processes that own them.
//!
//! ```no_run
//! use procnet::{PidFilter, TracerConfig, NetTracer};
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let tracer = NetTracer::new(TracerConfig::default());
//! let cancel = CancellationToken::new();
//! let mut errors = tracer.start(cancel.clone(), PidFilter::Pid(4242), Duration::from_millis(500));
//!
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! if let Ok(counters) = tracer.process_net_io_counters(4242) {
//!     println!("{} bytes sent", counters.bytes_sent);
//! }
//! while let Ok(e) = errors.try_recv() {
//!     eprintln!("{}", e);
//! }
//! cancel.cancel();
//! # }
//! ```

pub mod backends;
pub mod classify;
pub mod config;
pub mod decode;
mod dispatcher;
pub mod endpoint;
pub mod error;
mod reconciler;
pub mod table;
pub mod tracer;

pub use config::TracerConfig;
pub use dispatcher::CHECK_DONE_INTERVAL;
pub use endpoint::{Endpoint, IoCounters, Pid};
pub use error::TraceError;
pub use table::{InterfaceCounters, PidFilter};
pub use tracer::NetTracer;

