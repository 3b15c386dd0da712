//! Ring metrics.
//!
//! Scoped down from the teacher's generic `MetricsRegistry` to the fixed
//! set of atomic counters a single message ring needs. No exporter is
//! wired up here (out of scope); `snapshot()` hands back a plain struct a
//! caller can log or forward to whatever registry it already runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking one [`crate::MessageRing`]'s traffic and
/// bookkeeping events.
#[derive(Debug, Default)]
pub struct RingMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    inline_sends: AtomicU64,
    non_inline_sends: AtomicU64,
    peer_read_pos_refreshes: AtomicU64,
    read_pos_publishes: AtomicU64,
    wrap_events: AtomicU64,
}

/// Point-in-time copy of a [`RingMetrics`], safe to log or serialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingMetricsSnapshot {
    /// Messages successfully posted by `send`.
    pub messages_sent: u64,
    /// Messages successfully returned by `receive`.
    pub messages_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Sends posted with the inline flag.
    pub inline_sends: u64,
    /// Sends posted via the registered scratch region.
    pub non_inline_sends: u64,
    /// Times the sender refreshed its cached `peerReadPos`.
    pub peer_read_pos_refreshes: u64,
    /// Times the receiver published `readPos` to the peer.
    pub read_pos_publishes: u64,
    /// Messages whose write wrapped the ring and consumed tail padding.
    pub wrap_events: u64,
}

impl RingMetrics {
    /// A fresh, zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_send(&self, bytes: usize, inline: bool) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if inline {
            self.inline_sends.fetch_add(1, Ordering::Relaxed);
        } else {
            self.non_inline_sends.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_receive(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_peer_read_pos_refresh(&self) {
        self.peer_read_pos_refreshes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_pos_publish(&self) {
        self.read_pos_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_wrap(&self) {
        self.wrap_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent-enough snapshot for logging or export. Individual
    /// counters are read independently (no cross-field atomicity), which is
    /// fine for monitoring purposes.
    pub fn snapshot(&self) -> RingMetricsSnapshot {
        RingMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            inline_sends: self.inline_sends.load(Ordering::Relaxed),
            non_inline_sends: self.non_inline_sends.load(Ordering::Relaxed),
            peer_read_pos_refreshes: self.peer_read_pos_refreshes.load(Ordering::Relaxed),
            read_pos_publishes: self.read_pos_publishes.load(Ordering::Relaxed),
            wrap_events: self.wrap_events.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = RingMetrics::new();
        m.record_send(10, true);
        m.record_send(20, false);
        m.record_receive(10);
        m.record_peer_read_pos_refresh();
        m.record_read_pos_publish();
        m.record_wrap();

        let snap = m.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 30);
        assert_eq!(snap.inline_sends, 1);
        assert_eq!(snap.non_inline_sends, 1);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 10);
        assert_eq!(snap.peer_read_pos_refreshes, 1);
        assert_eq!(snap.read_pos_publishes, 1);
        assert_eq!(snap.wrap_events, 1);
    }
}
