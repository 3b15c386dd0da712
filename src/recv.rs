//! ReceivePath: polls the local ring for a fully landed message, copies
//! it out, zeroes the consumed bytes, and lazily publishes progress.

use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::framing::{self, RingView};
use crate::metrics::RingMetrics;
use crate::verbs::{MemoryRegion, QueuePair};
use crossbeam::utils::Backoff;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Polls the local receive ring at the current read cursor and publishes
/// progress to the local read-position slot the peer's SendPath reads
/// via RDMA (spec.md §3: "a single 8-byte cell in each endpoint's
/// registered memory holding that endpoint's current readPos"). A
/// reliable-connected queue pair's one-sided operations only ever reach
/// the connected peer's memory, never the initiator's own, so
/// "publishing" here is the endpoint's own memory store that makes the
/// value visible to the peer's next RDMA read — there is no separate
/// cross-host write on this path.
pub struct ReceivePath<Qp, Mr> {
    queue_pair: Arc<Qp>,
    ring: Mr,
    read_pos_slot: Mr,
    capacity: u64,
    validity_mask: u32,
    publish_threshold: u64,
    protocol_error_timeout: Duration,
    read_pos: u64,
    last_published: u64,
    metrics: Arc<RingMetrics>,
}

impl<Qp: QueuePair, Mr: MemoryRegion> ReceivePath<Qp, Mr> {
    pub fn new(
        queue_pair: Arc<Qp>,
        ring: Mr,
        read_pos_slot: Mr,
        config: &RingConfig,
        metrics: Arc<RingMetrics>,
    ) -> Self {
        Self {
            queue_pair,
            ring,
            read_pos_slot,
            capacity: config.buffer_size as u64,
            validity_mask: config.validity_mask,
            publish_threshold: config.publish_threshold_bytes(),
            protocol_error_timeout: config.protocol_error_timeout,
            read_pos: 0,
            last_published: 0,
            metrics,
        }
    }

    /// Current read cursor, for diagnostics and property tests.
    pub fn read_pos(&self) -> u64 {
        self.read_pos
    }

    fn view(&mut self) -> RingView<'_> {
        RingView::new(self.ring.as_mut_slice())
    }

    /// Skip any wrap padding sitting at the current read cursor, per
    /// spec.md §4.2's wrap policy. A tail too short to hold even a header
    /// is always padding; a tail that could hold a header but not the
    /// message the sender actually skipped there is instead flagged by
    /// the explicit [`framing::WRAP_MARKER`] sentinel.
    fn skip_padding_if_present(&mut self) -> bool {
        let is_padding = framing::is_wrap_padding(self.read_pos, self.capacity)
            || self.view().read_u32(self.read_pos) == framing::WRAP_MARKER;
        if is_padding {
            let next = framing::skip_wrap_padding(self.read_pos, self.capacity);
            self.view().zero_range(self.read_pos, next - self.read_pos);
            self.read_pos = next;
            true
        } else {
            false
        }
    }

    /// Non-blocking: true iff a complete message is currently visible at
    /// the read cursor.
    pub fn has_data(&mut self) -> Result<bool> {
        self.skip_padding_if_present();
        let length = self.view().read_u32(self.read_pos);
        if length == 0 {
            return Ok(false);
        }
        self.check_length(length)?;
        let footer_pos = self.read_pos + 4 + length as u64;
        let footer = self.view().read_u32(footer_pos);
        Ok(footer == framing::footer_value(length, self.validity_mask))
    }

    fn check_length(&self, length: u32) -> Result<()> {
        if u64::from(length) > self.capacity - framing::FRAME_OVERHEAD {
            return Err(Error::protocol(format!(
                "impossible message length {length} for a ring of {} bytes",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Blocks until exactly one message is available, copies up to
    /// `dst.len()` payload bytes into it, and returns the number of bytes
    /// copied. A message whose length exceeds `dst.len()` is left unread
    /// and reported as [`Error::BufferTooSmall`].
    pub fn receive(&mut self, dst: &mut [u8]) -> Result<usize> {
        let backoff = Backoff::new();
        let mut torn_since: Option<Instant> = None;
        let length = loop {
            self.skip_padding_if_present();
            let length = self.view().read_u32(self.read_pos);
            if length != 0 {
                self.check_length(length)?;
                let footer_pos = self.read_pos + 4 + length as u64;
                let footer = self.view().read_u32(footer_pos);
                if footer == framing::footer_value(length, self.validity_mask) {
                    break length;
                }
                // The header has landed but the footer has not (or never
                // will, if the peer crashed mid-write). spec.md §4.3: a
                // torn footer that does not clear within an
                // implementation-defined timeout is a protocol error.
                let since = torn_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.protocol_error_timeout {
                    return Err(Error::protocol(format!(
                        "torn footer for a {length}-byte message did not clear within {:?}",
                        self.protocol_error_timeout
                    )));
                }
            } else {
                torn_since = None;
            }
            self.queue_pair.poll_send_completions()?;
            backoff.snooze();
        };

        if dst.len() < length as usize {
            return Err(Error::buffer_too_small(length as usize, dst.len()));
        }

        let payload_pos = self.read_pos + 4;
        self.view().copy_out(payload_pos, dst, length as usize);

        let span = framing::counter_space(length as usize);
        self.view().zero_range(self.read_pos, span);
        self.read_pos += span;
        self.metrics.record_receive(length as usize);

        trace!(length, read_pos = self.read_pos, "message received");

        if self.read_pos - self.last_published >= self.publish_threshold {
            self.flush()?;
        }

        Ok(length as usize)
    }

    /// Publish the current read cursor unconditionally. This is a local
    /// store into the slot the peer's SendPath pulls via RDMA read, not a
    /// network operation.
    pub fn flush(&mut self) -> Result<()> {
        self.read_pos_slot.as_mut_slice()[0..8].copy_from_slice(&self.read_pos.to_le_bytes());
        fence(Ordering::Release);
        self.last_published = self.read_pos;
        self.metrics.record_read_pos_publish();
        Ok(())
    }
}
