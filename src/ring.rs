//! MessageRing façade: owns the handshake outcome, SendPath, ReceivePath,
//! and the queue pair, and enforces single-producer/single-consumer access
//! (spec.md §4.4, §5).

use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::handshake::{self, RingEndpoint};
use crate::metrics::{RingMetrics, RingMetricsSnapshot};
use crate::recv::ReceivePath;
use crate::send::SendPath;
use crate::verbs::{QueuePair, VerbsContext};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// A reliable single-connection message ring over one RDMA queue pair.
///
/// Construction runs the handshake to completion; a fully constructed
/// `MessageRing` is ready for `send`/`receive`. Both paths share the one
/// queue pair the handshake wires up (spec.md §9: "express as two typed
/// handles each carrying the remote descriptor" over one connection), held
/// behind an `Arc` since `send` and `receive` may run on different
/// threads concurrently (spec.md §5).
///
/// `send` may be called by at most one thread at a time, and likewise for
/// `receive`; a pair of reentrancy guards catches a caller violating that
/// contract rather than silently serializing the calls, since concurrent
/// calls on one side are a caller bug, not a condition to recover from.
pub struct MessageRing<Qp: QueuePair, Mr> {
    send_path: SendPath<Qp>,
    recv_path: ReceivePath<Qp, Mr>,
    metrics: Arc<RingMetrics>,
    broken: AtomicBool,
    sending: AtomicBool,
    receiving: AtomicBool,
}

impl<Qp, Mr> MessageRing<Qp, Mr>
where
    Qp: QueuePair,
    Mr: crate::verbs::MemoryRegion,
{
    /// Build a ring over `stream`, using `ctx` to register the local
    /// ring/read-position-slot memory and create the queue pair, then run
    /// the handshake to completion.
    ///
    /// On failure `stream` is left intact and usable for plain TCP
    /// (spec.md §6).
    pub fn new<Ctx>(stream: &mut TcpStream, ctx: &Ctx, config: RingConfig) -> Result<Self>
    where
        Ctx: VerbsContext<Qp = Qp, Mr = Mr>,
    {
        config.validate()?;
        let mut config = config;

        let local_ring = ctx.register_memory(vec![0u8; config.buffer_size])?;
        let local_read_pos_slot = ctx.register_memory(vec![0u8; 8])?;
        let queue_pair = ctx.create_queue_pair()?;
        config.clamp_inline_threshold(queue_pair.max_inline_data());

        let local = RingEndpoint {
            ring: local_ring,
            read_pos_slot: local_read_pos_slot,
        };
        let wired = handshake::run(stream, ctx, queue_pair, &local, &config)?;

        let scratch = Box::new(ctx.register_memory(vec![0u8; config.buffer_size])?);
        let metrics = Arc::new(RingMetrics::new());
        let queue_pair = Arc::new(wired.queue_pair);

        let send_path = SendPath::new(
            queue_pair.clone(),
            wired.peer_ring,
            wired.peer_read_pos_slot,
            scratch,
            &config,
            metrics.clone(),
        );
        let recv_path = ReceivePath::new(
            queue_pair,
            local.ring,
            local.read_pos_slot,
            &config,
            metrics.clone(),
        );

        info!(buffer_size = config.buffer_size, "message ring established");

        Ok(Self {
            send_path,
            recv_path,
            metrics,
            broken: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
        })
    }

    fn check_not_broken(&self) -> Result<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(Error::connection_lost("ring is broken"));
        }
        Ok(())
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Blocking send. See [`SendPath::send`].
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.check_not_broken()?;
        if self.sending.swap(true, Ordering::AcqRel) {
            return Err(Error::protocol("concurrent send() calls on one ring"));
        }
        let result = self.send_path.send(payload);
        self.sending.store(false, Ordering::Release);
        if let Err(ref e) = result {
            if !matches!(e, Error::BufferTooSmall { .. }) {
                self.mark_broken();
            }
        }
        result
    }

    /// Blocking receive. See [`ReceivePath::receive`].
    pub fn receive(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.check_not_broken()?;
        if self.receiving.swap(true, Ordering::AcqRel) {
            return Err(Error::protocol("concurrent receive() calls on one ring"));
        }
        let result = self.recv_path.receive(dst);
        self.receiving.store(false, Ordering::Release);
        if let Err(ref e) = result {
            if !matches!(e, Error::BufferTooSmall { .. }) {
                self.mark_broken();
            }
        }
        result
    }

    /// Non-blocking readiness check.
    pub fn has_data(&mut self) -> Result<bool> {
        self.check_not_broken()?;
        self.recv_path.has_data()
    }

    /// Force the peer's `readPos` publish, bypassing the lazy threshold.
    pub fn flush(&mut self) -> Result<()> {
        self.check_not_broken()?;
        self.recv_path.flush()
    }

    /// A snapshot of this ring's traffic counters.
    pub fn metrics(&self) -> RingMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ordered teardown (spec.md §9): drain outstanding sends, force the
    /// queue pair to the error state, drain once more to collect whatever
    /// raced the transition, then let memory regions deregister on drop.
    fn teardown(&mut self) {
        let qp = self.send_path.queue_pair_ref();
        if let Err(e) = qp.drain_send_completions() {
            warn!(error = %e, "error draining sends during teardown");
        }
        if let Err(e) = qp.transition_to_error() {
            warn!(error = %e, "error transitioning queue pair during teardown");
        }
        if let Err(e) = qp.drain_send_completions() {
            warn!(error = %e, "error during post-transition drain");
        }
        self.mark_broken();
    }
}

impl<Qp: QueuePair, Mr> Drop for MessageRing<Qp, Mr> {
    fn drop(&mut self) {
        self.teardown();
    }
}
