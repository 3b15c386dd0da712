//! The verbs boundary: the external collaborator spec.md §1 hands the core
//! "a process-wide RDMA context offering a protection domain, a send and a
//! receive completion queue, and a factory for a queue pair."
//!
//! This module turns that boundary into traits so the handshake and the
//! send/receive paths never depend on a concrete verbs provider. It is the
//! idiomatic-Rust shape of the teacher's
//! own `net::rdma` sketch (`RdmaDevice`/`ProtectionDomain`/`CompletionQueue`/
//! `QueuePair`/`MemoryRegion`), which the teacher candidly notes stands in
//! for a real `rdma-core` binding.
//!
//! Two implementations exist: [`ibv`] wraps the real `ibverbs` crate behind
//! the `ibv-backend` feature, and [`sim`] is an always-available in-process
//! loopback used by tests and the demo, standing in for real hardware the
//! way the teacher's own module already did.

#[cfg(feature = "ibv-backend")]
pub mod ibv;
pub mod sim;

use crate::error::Result;

/// A registered memory region, as the remote side names it: an address and
/// an RDMA key. Exchanged during the handshake (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteDescriptor {
    /// Remote virtual address of the region.
    pub address: u64,
    /// RDMA key authorizing remote access to the region.
    pub key: u32,
}

/// The three segments of one message's scatter-gather list (spec.md §4.2,
/// "Posting"): length header, payload, validity footer, posted together in
/// a single work request so the reliable-connected transport delivers them
/// as an ordered unit (invariant I5).
pub struct WriteSegments<'a> {
    /// 4-byte little-endian length header.
    pub header: [u8; 4],
    /// Message payload.
    pub payload: &'a [u8],
    /// 4-byte little-endian validity footer.
    pub footer: [u8; 4],
}

impl<'a> WriteSegments<'a> {
    /// Total bytes across all three segments.
    pub fn len(&self) -> usize {
        self.header.len() + self.payload.len() + self.footer.len()
    }

    /// Whether this write carries no payload (never true for well-formed
    /// messages; kept for completeness/clippy).
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Concatenate the three segments into one contiguous buffer, the shape
    /// an inline send needs since the provider copies a single descriptor.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(self.payload);
        buf.extend_from_slice(&self.footer);
        buf
    }
}

/// A locally registered, pinned memory region.
pub trait MemoryRegion: Send + Sync {
    /// Read-only view of the local memory.
    fn as_slice(&self) -> &[u8];
    /// Mutable view of the local memory.
    fn as_mut_slice(&mut self) -> &mut [u8];
    /// Length in bytes.
    fn len(&self) -> usize {
        self.as_slice().len()
    }
    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The descriptor a peer needs to address this region remotely.
    fn remote_descriptor(&self) -> RemoteDescriptor;
    /// The local key the provider needs to source a DMA read of this
    /// region for a non-inline send (distinct from the rkey a peer uses).
    fn local_key(&self) -> u32;
}

/// One reliable-connected queue pair and the one-sided operations the ring
/// posts on it.
pub trait QueuePair: Send + Sync {
    /// `(queue pair number, port LID)`, exchanged during the handshake.
    fn local_identity(&self) -> (u32, u16);

    /// Prime the receive queue with `count` placeholder work requests; the
    /// verbs state machine requires the RQ be armed before the QP can reach
    /// ready-to-receive (spec.md §4.1, step 1), even though this ring never
    /// posts two-sided messages on the data path.
    fn prime_receive_queue(&self, count: u32) -> Result<()>;

    /// Transition the queue pair init → ready-to-receive → ready-to-send
    /// using the peer's identity (spec.md §4.1, step 3).
    fn connect(&mut self, remote_qpn: u32, remote_lid: u16) -> Result<()>;

    /// Post a signaled one-sided WRITE of `segments` into the peer's memory
    /// at `remote.address + offset`, with the payload copied into the
    /// work-request descriptor by the provider (spec.md §4.2, "Inline
    /// threshold"). Does not require the segments to live in registered
    /// memory. Returns once the work request is posted; it does not wait
    /// for the write to complete remotely.
    fn post_write_inline(
        &self,
        remote: RemoteDescriptor,
        offset: u64,
        segments: WriteSegments<'_>,
    ) -> Result<()>;

    /// Post a signaled one-sided WRITE of `len` bytes already copied into
    /// `local` at `local_offset`, DMA'd into the peer's memory at
    /// `remote.address + remote_offset`. Used for payloads above the
    /// inline threshold, sourced from the sender's pre-registered scratch
    /// region (spec.md §4.2, "Memory-region source").
    fn post_write_from_region(
        &self,
        remote: RemoteDescriptor,
        remote_offset: u64,
        local: &dyn MemoryRegion,
        local_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Post a signaled one-sided WRITE of a single 8-byte little-endian
    /// value to a remote address. Not used by `readPos` publication (an
    /// RC queue pair cannot target its own initiator's memory, and each
    /// endpoint owns its own slot locally) but kept as a general building
    /// block for one-sided scalar writes.
    fn post_write_u64(&self, remote: RemoteDescriptor, value: u64) -> Result<()>;

    /// Post a signaled one-sided WRITE of the 4-byte
    /// [`crate::framing::WRAP_MARKER`] sentinel at `remote.address +
    /// offset`, used when the sender skips a tail that has room for a
    /// header but not for the message it skipped (spec.md §4.2).
    fn post_write_marker(&self, remote: RemoteDescriptor, offset: u64) -> Result<()>;

    /// Post a one-sided READ of the peer's 8-byte read-position slot and
    /// block until it completes, returning the value observed (spec.md
    /// §4.2: "blocking on its send completion").
    fn read_remote_u64_blocking(&self, remote: RemoteDescriptor) -> Result<u64>;

    /// Reap any completions the provider has queued on the send completion
    /// queue since the last call, without blocking. Returns the number
    /// reaped. An error completion observed during the reap surfaces as
    /// [`crate::Error::ConnectionLost`].
    fn poll_send_completions(&self) -> Result<usize>;

    /// Block until every outstanding signaled send has completed (or
    /// errored), used during teardown before deregistering memory.
    fn drain_send_completions(&self) -> Result<()>;

    /// Force the queue pair into the error state, the first step of
    /// teardown (spec.md §9).
    fn transition_to_error(&self) -> Result<()>;

    /// Maximum payload the provider will copy inline into a work-request
    /// descriptor (spec.md §9, "Inline-threshold discovery").
    fn max_inline_data(&self) -> usize;
}

/// The process-wide RDMA context: a protection domain, a send and receive
/// completion queue, and a factory for queue pairs and memory regions
/// (spec.md §1, §5 "Shared resources").
pub trait VerbsContext: Send + Sync {
    /// Concrete queue pair type this context produces.
    type Qp: QueuePair;
    /// Concrete memory region type this context produces.
    type Mr: MemoryRegion;

    /// Register `data` as a pinned memory region under this context's
    /// protection domain.
    fn register_memory(&self, data: Vec<u8>) -> Result<Self::Mr>;

    /// Create a queue pair bound to this context's shared completion
    /// queues, in the RESET/INIT state, not yet connected.
    fn create_queue_pair(&self) -> Result<Self::Qp>;
}
