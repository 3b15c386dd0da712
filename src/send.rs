//! SendPath: serialises outgoing payloads into the peer's receive ring.

use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::framing::{self, WritePlan};
use crate::metrics::RingMetrics;
use crate::verbs::{MemoryRegion, QueuePair, RemoteDescriptor, WriteSegments};
use crossbeam::utils::Backoff;
use std::sync::Arc;
use tracing::trace;

/// Serialises messages into the peer's ring via one RDMA write per
/// message, tracking the local write cursor and a cached lower bound on
/// the peer's read cursor.
pub struct SendPath<Qp> {
    queue_pair: Arc<Qp>,
    peer_ring: RemoteDescriptor,
    peer_read_pos_slot: RemoteDescriptor,
    capacity: u64,
    inline_threshold: usize,
    spin_yield: bool,
    write_pos: u64,
    peer_read_pos: u64,
    validity_mask: u32,
    /// Pre-registered scratch region, `capacity` bytes, used to source
    /// non-inline writes (spec.md §4.2, "Memory-region source").
    scratch: Box<dyn MemoryRegion>,
    metrics: Arc<RingMetrics>,
}

impl<Qp: QueuePair> SendPath<Qp> {
    pub fn new(
        queue_pair: Arc<Qp>,
        peer_ring: RemoteDescriptor,
        peer_read_pos_slot: RemoteDescriptor,
        scratch: Box<dyn MemoryRegion>,
        config: &RingConfig,
        metrics: Arc<RingMetrics>,
    ) -> Self {
        let inline_threshold = config.inline_threshold.min(queue_pair.max_inline_data());
        Self {
            queue_pair,
            peer_ring,
            peer_read_pos_slot,
            capacity: config.buffer_size as u64,
            inline_threshold,
            spin_yield: config.spin_yield,
            write_pos: 0,
            peer_read_pos: 0,
            validity_mask: config.validity_mask,
            scratch,
            metrics,
        }
    }

    /// Current write cursor, for diagnostics and property tests.
    pub fn write_pos(&self) -> u64 {
        self.write_pos
    }

    /// The shared queue pair, for teardown draining.
    pub fn queue_pair_ref(&self) -> &Qp {
        self.queue_pair.as_ref()
    }

    fn free_space(&self) -> u64 {
        self.capacity - (self.write_pos - self.peer_read_pos)
    }

    /// Refresh the cached `peerReadPos` via a blocking RDMA read, per
    /// spec.md §4.2: at most once per blocked wait cycle.
    fn refresh_peer_read_pos(&mut self) -> Result<()> {
        let value = self
            .queue_pair
            .read_remote_u64_blocking(self.peer_read_pos_slot)?;
        if value > self.peer_read_pos {
            self.peer_read_pos = value;
        }
        self.metrics.record_peer_read_pos_refresh();
        Ok(())
    }

    /// Block until `needed` bytes of cursor space are free, refreshing
    /// `peerReadPos` at most once per call before spinning.
    fn wait_for_space(&mut self, needed: u64) -> Result<()> {
        if self.free_space() >= needed {
            return Ok(());
        }
        self.refresh_peer_read_pos()?;
        let backoff = Backoff::new();
        while self.free_space() < needed {
            self.queue_pair.poll_send_completions()?;
            if self.spin_yield {
                backoff.snooze();
            } else {
                backoff.spin();
            }
            if backoff.is_completed() {
                self.refresh_peer_read_pos()?;
                backoff.reset();
            }
        }
        Ok(())
    }

    /// Blocks until `payload` has been fully serialised into the peer's
    /// ring and the posting work request has been submitted.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::protocol("zero-length messages are disallowed"));
        }
        if framing::counter_space(payload.len()) > self.capacity {
            return Err(Error::protocol(format!(
                "message of {} bytes cannot fit in a ring of {} bytes",
                payload.len(),
                self.capacity
            )));
        }

        let plan = framing::plan_write(self.write_pos, self.capacity, payload.len());
        let span = plan.total_span(payload.len());
        self.wait_for_space(span)?;

        let mask = self.capacity - 1;

        if let WritePlan::Wraps { pad_bytes, .. } = plan {
            trace!(pad_bytes, "wrap padding consumed");
            self.metrics.record_wrap();
            // A tail with room for a header but not for this message would
            // otherwise read back as plain zero, indistinguishable from
            // "no message yet"; an explicit marker disambiguates it
            // regardless of how much of the tail is left.
            if pad_bytes >= 4 {
                let marker_offset = self.write_pos & mask;
                self.queue_pair
                    .post_write_marker(self.peer_ring, marker_offset)?;
            }
        }

        let offset = plan.write_pos() & mask;
        let header = (payload.len() as u32).to_le_bytes();
        let footer = framing::footer_value(payload.len() as u32, self.validity_mask);

        let wire_len = framing::wire_len(payload.len()) as usize;
        let inline = wire_len <= self.inline_threshold;

        if inline {
            self.queue_pair.post_write_inline(
                self.peer_ring,
                offset,
                WriteSegments {
                    header,
                    payload,
                    footer: footer.to_le_bytes(),
                },
            )?;
        } else {
            let header_end = payload.len();
            let mut scratch_mut = self.scratch.as_mut_slice();
            scratch_mut[0..4].copy_from_slice(&header);
            scratch_mut[4..4 + header_end].copy_from_slice(payload);
            scratch_mut[4 + header_end..8 + header_end].copy_from_slice(&footer.to_le_bytes());
            self.queue_pair.post_write_from_region(
                self.peer_ring,
                offset,
                self.scratch.as_ref(),
                0,
                wire_len,
            )?;
        }

        self.metrics.record_send(payload.len(), inline);
        self.write_pos += span;
        Ok(())
    }
}
