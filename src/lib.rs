//! # Riptide: a reliable single-connection message ring over RDMA
//!
//! Riptide turns an already-connected TCP socket into a message ring backed
//! by a single RDMA reliable-connected queue pair, so that applications
//! already speaking a length-prefixed framing over TCP can move messages
//! through one-sided RDMA writes instead, without changing the semantics
//! the application sees: ordered, reliable, single-producer/single-consumer
//! delivery.
//!
//! ## Quick start
//!
//! ```no_run
//! use riptide::{MessageRing, RingConfig};
//! use riptide::verbs::sim::SimFabric;
//! use std::net::TcpStream;
//!
//! # fn example() -> riptide::Result<()> {
//! let mut stream = TcpStream::connect("127.0.0.1:9000")?;
//! let fabric = SimFabric::new(4096);
//! let ctx = fabric.context();
//! let config = RingConfig::new(4096);
//! let mut ring = MessageRing::new(&mut stream, &ctx, config)?;
//!
//! ring.send(b"hello")?;
//! let mut buf = [0u8; 64];
//! let n = ring.receive(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok(())
//! # }
//! ```
//!
//! ## Module map
//!
//! - [`config`] — `RingConfig`, validated at construction.
//! - [`error`] — `Error`/`Result`, the failure taxonomy callers match on.
//! - [`framing`] — wire layout and wrap-padding arithmetic for the ring.
//! - [`verbs`] — the `VerbsContext`/`QueuePair`/`MemoryRegion` boundary,
//!   with a real `ibverbs`-backed implementation (`verbs::ibv`, feature
//!   `ibv-backend`) and an in-process loopback (`verbs::sim`) for tests and
//!   the bundled demo.
//! - [`handshake`] — the TCP-carried exchange that wires up the queue pair.
//! - [`send`] / [`recv`] — the two halves of the ring's data path.
//! - [`ring`] — `MessageRing`, the public façade combining the above.
//! - [`metrics`] — atomic traffic counters exposed via `MessageRing::metrics`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]
#![allow(clippy::type_complexity)]

pub mod config;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod metrics;
pub mod recv;
pub mod ring;
pub mod send;
pub mod verbs;

pub use config::RingConfig;
pub use error::{Error, Result};
pub use metrics::{RingMetrics, RingMetricsSnapshot};
pub use ring::MessageRing;
