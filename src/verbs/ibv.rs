//! Real hardware verbs backend, built on the `ibverbs` crate.
//!
//! Grounded in the connection-setup sequence used elsewhere in this
//! ecosystem: acquire a context from the first device, allocate a
//! protection domain and a shared completion queue, register memory
//! against the protection domain, and build queue pairs against the
//! shared CQ. `ibv_fork_init` is called once per process, matching the
//! "in case we use fork later" caution taken by other RDMA-based crates.
//!
//! One completion queue is shared by every queue pair this context
//! creates (spec.md §5, "Shared resources"). Reaping it is therefore
//! mutually exclusive across queue pairs: a `Mutex<()>` held for the
//! duration of `poll_cq` plus the completion-classification loop that
//! follows serializes `reap_cq` across every queue pair sharing the CQ,
//! and [`ReapStash`] files away completions that belong to a different
//! queue pair than the one currently draining, so no queue pair's
//! completion is ever dropped on the floor.

use crate::error::{Error, Result};
use crate::verbs::{MemoryRegion, QueuePair, RemoteDescriptor, VerbsContext, WriteSegments};
use ibverbs::ffi::{
    ibv_modify_qp, ibv_post_send, ibv_qp_attr, ibv_qp_attr_mask, ibv_qp_state, ibv_qp_type,
    ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wc, ibv_wr_opcode,
};
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_QP_TAG: AtomicU32 = AtomicU32::new(1);

fn once_fork_init() -> Result<()> {
    use std::sync::atomic::AtomicBool;
    use std::sync::Once;
    static INIT: Once = Once::new();
    static FAILED: AtomicBool = AtomicBool::new(false);
    INIT.call_once(|| {
        if unsafe { ibverbs::ffi::ibv_fork_init() } != 0 {
            FAILED.store(true, Ordering::Relaxed);
        }
    });
    if FAILED.load(Ordering::Relaxed) {
        return Err(Error::rdma_setup("ibv_fork_init failed"));
    }
    Ok(())
}

/// Completions reaped off the shared CQ that belonged to a queue pair
/// other than the one currently draining, held until that queue pair
/// asks for them.
#[derive(Default)]
struct ReapStash {
    pending: Mutex<HashMap<u32, VecDeque<Result<()>>>>,
}

impl ReapStash {
    fn push(&self, tag: u32, outcome: Result<()>) {
        self.pending
            .lock()
            .unwrap()
            .entry(tag)
            .or_default()
            .push_back(outcome);
    }

    fn drain_for(&self, tag: u32) -> Vec<Result<()>> {
        self.pending
            .lock()
            .unwrap()
            .get_mut(&tag)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

/// A process-wide RDMA context: one device, one protection domain, one
/// shared completion queue.
pub struct IbvContext {
    _ctx: Arc<ibverbs::Context>,
    pd: Arc<ibverbs::ProtectionDomain>,
    cq: Arc<ibverbs::CompletionQueue>,
    cq_lock: Arc<Mutex<()>>,
    stash: Arc<ReapStash>,
    max_inline_data: usize,
}

impl IbvContext {
    /// Open the first RDMA device found and bring up a protection domain
    /// and completion queue against it.
    pub fn open() -> Result<Self> {
        once_fork_init()?;

        let devices = ibverbs::devices()
            .map_err(|e| Error::rdma_setup(format!("enumerating RDMA devices: {e}")))?;
        let device = devices
            .get(0)
            .ok_or_else(|| Error::rdma_setup("no RDMA devices present"))?;
        let ctx = device
            .open()
            .map_err(|e| Error::rdma_setup(format!("opening RDMA device: {e}")))?;
        let pd = ctx
            .alloc_pd()
            .map_err(|e| Error::rdma_setup(format!("allocating protection domain: {e}")))?;
        let attr = ctx
            .query_device()
            .map_err(|e| Error::rdma_setup(format!("querying device attributes: {e}")))?;
        let cq = ctx
            .create_cq(attr.max_cqe, 0)
            .map_err(|e| Error::rdma_setup(format!("creating completion queue: {e}")))?;

        Ok(Self {
            _ctx: ctx,
            pd: Arc::new(pd),
            cq: Arc::new(cq),
            cq_lock: Arc::new(Mutex::new(())),
            stash: Arc::new(ReapStash::default()),
            max_inline_data: attr.max_inline_data as usize,
        })
    }
}

impl VerbsContext for IbvContext {
    type Qp = IbvQueuePair;
    type Mr = IbvMemoryRegion;

    fn register_memory(&self, data: Vec<u8>) -> Result<Self::Mr> {
        let mut mr = self
            .pd
            .allocate::<u8>(data.len())
            .map_err(|e| Error::rdma_setup(format!("registering memory region: {e}")))?;
        mr[..].copy_from_slice(&data);
        let address = mr.as_ptr() as u64;
        let key = mr.rkey().0;
        Ok(IbvMemoryRegion {
            mr,
            descriptor: RemoteDescriptor { address, key },
        })
    }

    fn create_queue_pair(&self) -> Result<Self::Qp> {
        let builder = self
            .pd
            .create_qp(&self.cq, &self.cq, ibv_qp_type::IBV_QPT_RC);
        let prepared = builder
            .build()
            .map_err(|e| Error::rdma_setup(format!("building queue pair: {e}")))?;
        let tag = NEXT_QP_TAG.fetch_add(1, Ordering::Relaxed);
        Ok(IbvQueuePair {
            slot: QpSlot::Prepared(prepared),
            cq: self.cq.clone(),
            cq_lock: self.cq_lock.clone(),
            stash: self.stash.clone(),
            tag,
            wr_seq: AtomicU64::new(0),
            max_inline_data: self.max_inline_data,
        })
    }
}

/// A registered memory region on real hardware.
pub struct IbvMemoryRegion {
    mr: ibverbs::MemoryRegion<u8>,
    descriptor: RemoteDescriptor,
}

impl MemoryRegion for IbvMemoryRegion {
    fn as_slice(&self) -> &[u8] {
        &self.mr[..]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mr[..]
    }

    fn remote_descriptor(&self) -> RemoteDescriptor {
        self.descriptor
    }

    fn local_key(&self) -> u32 {
        self.mr.rkey().0
    }
}

enum QpSlot {
    Prepared(ibverbs::PreparedQueuePair),
    Ready(ibverbs::QueuePair),
    /// Placeholder left behind while [`QpSlot`] is being replaced; never
    /// observed by a caller.
    Taken,
}

/// A queue pair on real hardware, with its own tag used to route shared-CQ
/// completions back to the right [`IbvQueuePair`].
pub struct IbvQueuePair {
    slot: QpSlot,
    cq: Arc<ibverbs::CompletionQueue>,
    cq_lock: Arc<Mutex<()>>,
    stash: Arc<ReapStash>,
    tag: u32,
    wr_seq: AtomicU64,
    max_inline_data: usize,
}

impl IbvQueuePair {
    fn ready(&self) -> Result<&ibverbs::QueuePair> {
        match &self.slot {
            QpSlot::Ready(qp) => Ok(qp),
            QpSlot::Prepared(_) => Err(Error::rdma_setup(
                "queue pair is not ready to send (call connect() first)",
            )),
            QpSlot::Taken => unreachable!("QpSlot::Taken observed outside a transition"),
        }
    }

    fn next_wr_id(&self) -> u64 {
        let seq = self.wr_seq.fetch_add(1, Ordering::Relaxed);
        (u64::from(self.tag) << 32) | (seq & 0xFFFF_FFFF)
    }

    fn tag_of(wr_id: u64) -> u32 {
        (wr_id >> 32) as u32
    }

    /// Post a single RDMA WRITE work request built directly against the
    /// FFI layer, since arbitrary ephemeral bytes (a framed header and
    /// footer that were never registered) can only be sent inline through
    /// the raw `ibv_send_wr`/`ibv_sge` shape.
    fn post_raw_write(
        &self,
        local_addr: u64,
        local_len: u32,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        inline: bool,
    ) -> Result<()> {
        let qp = self.ready()?;
        let mut sge = ibv_sge {
            addr: local_addr,
            length: local_len,
            lkey,
        };
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = self.next_wr_id();
        wr.next = ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0
            | if inline { ibv_send_flags::IBV_SEND_INLINE.0 } else { 0 };
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;

        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        // SAFETY: `qp` is ready-to-send, `sge` points at `local_len` valid
        // bytes for the duration of this call, and `wr` is fully
        // initialized above.
        let ret = unsafe { ibv_post_send(qp.qp_ptr(), &mut wr, &mut bad_wr) };
        if ret != 0 {
            return Err(Error::post_send(format!("ibv_post_send failed: {ret}")));
        }
        Ok(())
    }
}

impl QueuePair for IbvQueuePair {
    fn local_identity(&self) -> (u32, u16) {
        match &self.slot {
            QpSlot::Prepared(qp) => {
                let endpoint = qp.endpoint();
                (endpoint.num, endpoint.lid)
            }
            QpSlot::Ready(qp) => {
                let endpoint = qp.endpoint();
                (endpoint.num, endpoint.lid)
            }
            QpSlot::Taken => unreachable!("QpSlot::Taken observed outside a transition"),
        }
    }

    fn prime_receive_queue(&self, _count: u32) -> Result<()> {
        // This ring never posts two-sided SEND/RECV work on the data
        // path, only one-sided WRITE/READ, which does not consume
        // receive-queue entries. Nothing to prime.
        Ok(())
    }

    fn connect(&mut self, remote_qpn: u32, remote_lid: u16) -> Result<()> {
        let prepared = match mem::replace(&mut self.slot, QpSlot::Taken) {
            QpSlot::Prepared(prepared) => prepared,
            other => {
                self.slot = other;
                return Err(Error::rdma_setup("connect() called twice"));
            }
        };
        let remote = ibverbs::QueuePairEndpoint {
            num: remote_qpn,
            lid: remote_lid,
            gid: None,
        };
        let qp = prepared
            .handshake(remote)
            .map_err(|e| Error::rdma_setup(format!("queue pair handshake failed: {e}")))?;
        self.slot = QpSlot::Ready(qp);
        Ok(())
    }

    fn post_write_inline(
        &self,
        remote: RemoteDescriptor,
        offset: u64,
        segments: WriteSegments<'_>,
    ) -> Result<()> {
        if segments.len() > self.max_inline_data {
            return Err(Error::post_send(format!(
                "segment of {} bytes exceeds max inline data {}",
                segments.len(),
                self.max_inline_data
            )));
        }
        let bytes = segments.to_contiguous();
        self.post_raw_write(
            bytes.as_ptr() as u64,
            bytes.len() as u32,
            0,
            remote.address + offset,
            remote.key,
            true,
        )
    }

    fn post_write_from_region(
        &self,
        remote: RemoteDescriptor,
        remote_offset: u64,
        local: &dyn MemoryRegion,
        local_offset: usize,
        len: usize,
    ) -> Result<()> {
        let base = local.as_slice().as_ptr() as u64;
        self.post_raw_write(
            base + local_offset as u64,
            len as u32,
            local.local_key(),
            remote.address + remote_offset,
            remote.key,
            false,
        )
    }

    fn post_write_u64(&self, remote: RemoteDescriptor, value: u64) -> Result<()> {
        let bytes = value.to_le_bytes();
        self.post_raw_write(
            bytes.as_ptr() as u64,
            bytes.len() as u32,
            0,
            remote.address,
            remote.key,
            true,
        )
    }

    fn post_write_marker(&self, remote: RemoteDescriptor, offset: u64) -> Result<()> {
        let bytes = crate::framing::WRAP_MARKER.to_le_bytes();
        self.post_raw_write(
            bytes.as_ptr() as u64,
            bytes.len() as u32,
            0,
            remote.address + offset,
            remote.key,
            true,
        )
    }

    fn read_remote_u64_blocking(&self, remote: RemoteDescriptor) -> Result<u64> {
        let qp = self.ready()?;
        let mut scratch = 0u64;
        let mut sge = ibv_sge {
            addr: &mut scratch as *mut u64 as u64,
            length: 8,
            lkey: 0,
        };
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        let wr_id = self.next_wr_id();
        wr.wr_id = wr_id;
        wr.next = ptr::null_mut();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr.rdma.remote_addr = remote.address;
        wr.wr.rdma.rkey = remote.key;

        let mut bad_wr: *mut ibv_send_wr = ptr::null_mut();
        // SAFETY: `scratch` outlives the call and is only touched by the
        // NIC until the matching completion below is observed.
        let ret = unsafe { ibv_post_send(qp.qp_ptr(), &mut wr, &mut bad_wr) };
        if ret != 0 {
            return Err(Error::post_send(format!("ibv_post_send (read) failed: {ret}")));
        }

        loop {
            for outcome in self.reap_cq()? {
                if outcome.1 == wr_id {
                    outcome.0?;
                    return Ok(scratch);
                }
            }
            std::thread::yield_now();
        }
    }

    fn poll_send_completions(&self) -> Result<usize> {
        let mut count = 0;
        for stashed in self.stash.drain_for(self.tag) {
            stashed?;
            count += 1;
        }
        for (outcome, wr_id) in self.reap_cq()? {
            if Self::tag_of(wr_id) == self.tag {
                outcome?;
                count += 1;
            }
        }
        Ok(count)
    }

    fn drain_send_completions(&self) -> Result<()> {
        loop {
            let reaped = self.poll_send_completions()?;
            if reaped == 0 {
                return Ok(());
            }
        }
    }

    fn transition_to_error(&self) -> Result<()> {
        // A queue pair that never left `Prepared` was never connected and
        // has nothing posted against it; there is no state to fence.
        let qp = match &self.slot {
            QpSlot::Ready(qp) => qp,
            QpSlot::Prepared(_) => return Ok(()),
            QpSlot::Taken => unreachable!("QpSlot::Taken observed outside a transition"),
        };

        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        attr.qp_state = ibv_qp_state::IBV_QPS_ERR;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE;

        // SAFETY: `qp` is a live, connected queue pair; `attr` carries only
        // the state field `mask` selects.
        let ret = unsafe { ibv_modify_qp(qp.qp_ptr(), &mut attr, mask.0 as i32) };
        if ret != 0 {
            return Err(Error::rdma_setup(format!(
                "ibv_modify_qp to IBV_QPS_ERR failed: {ret}"
            )));
        }
        Ok(())
    }

    fn max_inline_data(&self) -> usize {
        self.max_inline_data
    }
}

impl IbvQueuePair {
    /// Poll the shared completion queue once, stashing completions that
    /// belong to a different queue pair and returning the rest as
    /// `(outcome, wr_id)` pairs. Held behind `cq_lock` for the duration of
    /// `poll_cq` and the classification loop below, since every queue pair
    /// on this context polls the same completion queue (spec.md §5).
    fn reap_cq(&self) -> Result<Vec<(Result<()>, u64)>> {
        let _guard = self.cq_lock.lock().unwrap();

        let mut wc = [ibv_wc::default(); 16];
        let completed = self
            .cq
            .poll(&mut wc)
            .map_err(|e| Error::connection_lost(format!("polling completion queue: {e}")))?;

        let mut mine = Vec::new();
        for entry in completed.iter() {
            let wr_id = entry.wr_id();
            let outcome = if entry.is_valid() {
                Ok(())
            } else {
                Err(Error::connection_lost(format!(
                    "work completion error: {:?}",
                    entry.error()
                )))
            };
            if Self::tag_of(wr_id) == self.tag {
                mine.push((outcome, wr_id));
            } else {
                self.stash.push(Self::tag_of(wr_id), outcome);
            }
        }
        Ok(mine)
    }
}
