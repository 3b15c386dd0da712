//! In-process loopback verbs backend.
//!
//! The teacher's own `net::rdma` module says outright: "In a real
//! implementation, this would use rdma-core or similar. For now, we'll
//! simulate the RDMA device abstraction." We keep exactly that simulation,
//! not as a placeholder to delete once real hardware shows up, but as a
//! permanent, always-available test/demo backend: a [`SimFabric`] models a
//! process-wide address space two [`SimContext`]s resolve remote
//! descriptors against, so the handshake and the send/receive paths can be
//! exercised byte-exactly without any RDMA hardware.
//!
//! Memory is shared across simulated "hosts" via raw pointers rather than a
//! mutex: real one-sided RDMA writes land in peer memory with no remote CPU
//! involvement and no lock, and spec.md §4.3 relies on nothing stronger
//! than a compiler barrier to make a landed footer visible. We reproduce
//! that with explicit `AtomicOrdering` fences instead of synchronizing
//! access, which is the whole point of the protocol under test.

use crate::error::{Error, Result};
use crate::verbs::{MemoryRegion, QueuePair, RemoteDescriptor, VerbsContext, WriteSegments};
use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Backing store for one registered region, shared between the endpoint
/// that owns it and any peer context resolving writes/reads against it.
struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: access to the region is only ever performed through `RingView`-style
// disjoint byte ranges coordinated by the ring protocol itself (single
// producer, single consumer per invariant in spec.md §5); there is no
// additional in-process synchronization to model, matching real RDMA memory.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    fn new(data: Vec<u8>) -> Self {
        let mut boxed = data.into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        let len = boxed.len();
        std::mem::forget(boxed);
        Self { ptr, len }
    }

    unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

impl Drop for RawRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from `Vec::into_boxed_slice` and are
        // never aliased past this point.
        unsafe {
            drop(Box::from_raw(std::slice::from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

struct FabricInner {
    regions: Mutex<HashMap<u64, (Arc<RawRegion>, u32)>>,
    next_addr: AtomicU64,
    next_qpn: AtomicU32,
    max_inline_data: usize,
}

/// A shared, process-wide simulated fabric. Create one and hand out a
/// [`SimContext`] per simulated endpoint; writes posted by one context's
/// queue pair land directly in the memory another context registered.
#[derive(Clone)]
pub struct SimFabric(Arc<FabricInner>);

impl SimFabric {
    /// Build a new fabric. `max_inline_data` stands in for the value real
    /// hardware reports at queue-pair creation (spec.md §9).
    pub fn new(max_inline_data: usize) -> Self {
        Self(Arc::new(FabricInner {
            regions: Mutex::new(HashMap::new()),
            next_addr: AtomicU64::new(0x1000),
            next_qpn: AtomicU32::new(1),
            max_inline_data,
        }))
    }

    /// Create a context representing one endpoint on this fabric.
    pub fn context(&self) -> SimContext {
        SimContext {
            fabric: self.0.clone(),
        }
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new(220)
    }
}

/// One simulated endpoint's verbs context.
#[derive(Clone)]
pub struct SimContext {
    fabric: Arc<FabricInner>,
}

impl VerbsContext for SimContext {
    type Qp = SimQueuePair;
    type Mr = SimMemoryRegion;

    fn register_memory(&self, data: Vec<u8>) -> Result<Self::Mr> {
        let address = self.fabric.next_addr.fetch_add(data.len() as u64 + 64, Ordering::Relaxed);
        let key = (address as u32) ^ 0xA5A5_A5A5;
        let region = Arc::new(RawRegion::new(data));
        self.fabric
            .regions
            .lock()
            .unwrap()
            .insert(address, (region.clone(), key));
        Ok(SimMemoryRegion {
            region,
            descriptor: RemoteDescriptor { address, key },
        })
    }

    fn create_queue_pair(&self) -> Result<Self::Qp> {
        let qpn = self.fabric.next_qpn.fetch_add(1, Ordering::Relaxed);
        Ok(SimQueuePair {
            fabric: self.fabric.clone(),
            qpn,
            lid: 1,
            state: Mutex::new(QpState::Init),
            completed_sends: AtomicUsize::new(0),
        })
    }
}

/// A registered region on the simulated fabric.
pub struct SimMemoryRegion {
    region: Arc<RawRegion>,
    descriptor: RemoteDescriptor,
}

impl MemoryRegion for SimMemoryRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: see `RawRegion`'s safety comment.
        unsafe { self.region.as_slice() }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `RawRegion`'s safety comment.
        unsafe { self.region.as_mut_slice() }
    }

    fn remote_descriptor(&self) -> RemoteDescriptor {
        self.descriptor
    }

    fn local_key(&self) -> u32 {
        self.descriptor.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QpState {
    Init,
    Rts,
    Error,
}

/// A simulated queue pair. `local_identity` returns `(qpn, lid)`; `connect`
/// records the peer's identity for bookkeeping only, since resolution of
/// writes happens by address through the shared [`SimFabric`], exactly as
/// real RDMA writes are resolved by the NIC rather than by the local QP.
pub struct SimQueuePair {
    fabric: Arc<FabricInner>,
    qpn: u32,
    lid: u16,
    state: Mutex<QpState>,
    completed_sends: AtomicUsize,
}

impl SimQueuePair {
    fn require_rts(&self) -> Result<()> {
        match *self.state.lock().unwrap() {
            QpState::Rts => Ok(()),
            QpState::Error => Err(Error::connection_lost("queue pair is in the error state")),
            QpState::Init => Err(Error::rdma_setup(
                "queue pair is not ready to send (call connect() first)",
            )),
        }
    }

    fn resolve(&self, remote: RemoteDescriptor) -> Result<Arc<RawRegion>> {
        let regions = self.fabric.regions.lock().unwrap();
        let (region, key) = regions
            .get(&remote.address)
            .ok_or_else(|| Error::post_send(format!("no region registered at {:#x}", remote.address)))?;
        if *key != remote.key {
            return Err(Error::post_send("rkey mismatch"));
        }
        Ok(region.clone())
    }
}

impl QueuePair for SimQueuePair {
    fn local_identity(&self) -> (u32, u16) {
        (self.qpn, self.lid)
    }

    fn prime_receive_queue(&self, _count: u32) -> Result<()> {
        Ok(())
    }

    fn connect(&mut self, _remote_qpn: u32, _remote_lid: u16) -> Result<()> {
        *self.state.lock().unwrap() = QpState::Rts;
        Ok(())
    }

    fn post_write_inline(
        &self,
        remote: RemoteDescriptor,
        offset: u64,
        segments: WriteSegments<'_>,
    ) -> Result<()> {
        self.require_rts()?;
        let region = self.resolve(remote)?;
        let off = offset as usize;
        // SAFETY: `region` outlives this call via the `Arc` clone, and the
        // ring protocol guarantees this span is not concurrently read by
        // the owner until the footer write below has landed.
        let mem = unsafe { region.as_mut_slice() };
        let header_end = off + segments.header.len();
        let payload_end = header_end + segments.payload.len();
        let footer_end = payload_end + segments.footer.len();
        mem[off..header_end].copy_from_slice(&segments.header);
        mem[header_end..payload_end].copy_from_slice(segments.payload);
        fence(Ordering::Release);
        mem[payload_end..footer_end].copy_from_slice(&segments.footer);
        fence(Ordering::Release);
        self.completed_sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn post_write_from_region(
        &self,
        remote: RemoteDescriptor,
        remote_offset: u64,
        local: &dyn MemoryRegion,
        local_offset: usize,
        len: usize,
    ) -> Result<()> {
        self.require_rts()?;
        let region = self.resolve(remote)?;
        let off = remote_offset as usize;
        let src = &local.as_slice()[local_offset..local_offset + len];
        // SAFETY: see `post_write_inline`.
        let mem = unsafe { region.as_mut_slice() };
        mem[off..off + len].copy_from_slice(src);
        fence(Ordering::Release);
        self.completed_sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn post_write_u64(&self, remote: RemoteDescriptor, value: u64) -> Result<()> {
        self.require_rts()?;
        let region = self.resolve(remote)?;
        let mem = unsafe { region.as_mut_slice() };
        mem[0..8].copy_from_slice(&value.to_le_bytes());
        fence(Ordering::Release);
        self.completed_sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn post_write_marker(&self, remote: RemoteDescriptor, offset: u64) -> Result<()> {
        self.require_rts()?;
        let region = self.resolve(remote)?;
        let off = offset as usize;
        let mem = unsafe { region.as_mut_slice() };
        mem[off..off + 4].copy_from_slice(&crate::framing::WRAP_MARKER.to_le_bytes());
        fence(Ordering::Release);
        self.completed_sends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_remote_u64_blocking(&self, remote: RemoteDescriptor) -> Result<u64> {
        self.require_rts()?;
        let region = self.resolve(remote)?;
        fence(Ordering::Acquire);
        let mem = unsafe { region.as_slice() };
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&mem[0..8]);
        self.completed_sends.fetch_add(1, Ordering::Relaxed);
        Ok(u64::from_le_bytes(buf))
    }

    fn poll_send_completions(&self) -> Result<usize> {
        if *self.state.lock().unwrap() == QpState::Error {
            return Err(Error::connection_lost("queue pair transitioned to error"));
        }
        Ok(self.completed_sends.swap(0, Ordering::Relaxed))
    }

    fn drain_send_completions(&self) -> Result<()> {
        self.completed_sends.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn transition_to_error(&self) -> Result<()> {
        *self.state.lock().unwrap() = QpState::Error;
        Ok(())
    }

    fn max_inline_data(&self) -> usize {
        self.fabric.max_inline_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let fabric = SimFabric::new(256);
        let ctx = fabric.context();
        let mut mr = ctx.register_memory(vec![0u8; 64]).unwrap();
        let mut qp = ctx.create_queue_pair().unwrap();
        qp.connect(1, 1).unwrap();

        let descriptor = mr.remote_descriptor();
        qp.post_write_inline(
            descriptor,
            0,
            WriteSegments {
                header: 5u32.to_le_bytes(),
                payload: b"hello",
                footer: (5u32 ^ 0xDEAD_BEEF).to_le_bytes(),
            },
        )
        .unwrap();

        assert_eq!(&mr.as_mut_slice()[0..4], &5u32.to_le_bytes());
        assert_eq!(&mr.as_mut_slice()[4..9], b"hello");
    }

    #[test]
    fn post_write_from_region_copies_scratch_bytes() {
        let fabric = SimFabric::new(256);
        let sender = fabric.context();
        let receiver = fabric.context();
        let scratch = sender.register_memory(b"scratch-payload".to_vec()).unwrap();
        let dst = receiver.register_memory(vec![0u8; 64]).unwrap();
        let mut qp = sender.create_queue_pair().unwrap();
        qp.connect(1, 1).unwrap();

        qp.post_write_from_region(dst.remote_descriptor(), 10, &scratch, 0, 7)
            .unwrap();

        assert_eq!(&dst.as_slice()[10..17], b"scratch");
    }

    #[test]
    fn error_state_rejects_posts() {
        let fabric = SimFabric::new(256);
        let ctx = fabric.context();
        let mr = ctx.register_memory(vec![0u8; 64]).unwrap();
        let mut qp = ctx.create_queue_pair().unwrap();
        qp.connect(1, 1).unwrap();
        qp.transition_to_error().unwrap();

        let err = qp
            .post_write_inline(
                mr.remote_descriptor(),
                0,
                WriteSegments {
                    header: [0; 4],
                    payload: &[1],
                    footer: [0; 4],
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
    }
}
