//! Handshake: exchanges RDMA addressing over the pre-existing TCP socket
//! and brings the queue pair up to ready-to-send.
//!
//! The wire record and barrier exchange follow the full-read/full-write
//! TCP loop other RDMA connection setups in this codebase use to swap
//! endpoint information before calling into the verbs handshake proper.

use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::verbs::{QueuePair, RemoteDescriptor, VerbsContext};
use std::io::{Read, Write};
use std::net::TcpStream;
use tracing::{debug, info};

/// Total wire size of the handshake record (spec.md §6): 41 meaningful
/// bytes, padded to 48 for alignment in transit.
const RECORD_LEN: usize = 48;

/// The local resources a ring offers the peer: its receive ring and its
/// read-position slot, already registered.
pub struct RingEndpoint<Mr> {
    /// The receive ring memory region.
    pub ring: Mr,
    /// The single 8-byte read-position slot.
    pub read_pos_slot: Mr,
}

/// What the handshake produces: a connected queue pair and the peer's
/// descriptors for its receive ring and read-position slot.
pub struct WiredConnection<Qp> {
    pub queue_pair: Qp,
    pub peer_ring: RemoteDescriptor,
    pub peer_read_pos_slot: RemoteDescriptor,
}

fn write_record(
    local_qpn: u32,
    local_lid: u16,
    ring: RemoteDescriptor,
    read_pos_slot: RemoteDescriptor,
) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..4].copy_from_slice(&local_qpn.to_ne_bytes());
    buf[4..6].copy_from_slice(&local_lid.to_ne_bytes());
    buf[8..16].copy_from_slice(&ring.address.to_ne_bytes());
    buf[16..20].copy_from_slice(&ring.key.to_ne_bytes());
    buf[24..32].copy_from_slice(&read_pos_slot.address.to_ne_bytes());
    buf[32..36].copy_from_slice(&read_pos_slot.key.to_ne_bytes());
    buf
}

struct PeerRecord {
    qpn: u32,
    lid: u16,
    ring: RemoteDescriptor,
    read_pos_slot: RemoteDescriptor,
}

fn parse_record(buf: &[u8; RECORD_LEN]) -> PeerRecord {
    let qpn = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let lid = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
    let ring = RemoteDescriptor {
        address: u64::from_ne_bytes(buf[8..16].try_into().unwrap()),
        key: u32::from_ne_bytes(buf[16..20].try_into().unwrap()),
    };
    let read_pos_slot = RemoteDescriptor {
        address: u64::from_ne_bytes(buf[24..32].try_into().unwrap()),
        key: u32::from_ne_bytes(buf[32..36].try_into().unwrap()),
    };
    PeerRecord {
        qpn,
        lid,
        ring,
        read_pos_slot,
    }
}

fn full_write(stream: &mut TcpStream, buf: &[u8]) -> Result<()> {
    stream
        .write_all(buf)
        .map_err(|e| Error::handshake(format!("writing handshake record: {e}")))
}

fn full_read(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    stream
        .read_exact(buf)
        .map_err(|e| Error::handshake(format!("reading handshake record: {e}")))
}

/// Run the handshake over `stream`, bringing up `queue_pair` against
/// `local` and returning the wired connection on success.
///
/// On any failure `stream` is left intact and usable for plain TCP
/// (spec.md §6); only the queue pair and any verbs-side state this
/// function itself allocated are this function's responsibility, and it
/// allocates none beyond what the caller already created.
pub fn run<Ctx>(
    stream: &mut TcpStream,
    // Present only so `Ctx` can be inferred at call sites from the
    // context that produced `queue_pair` and `local`; the handshake
    // itself only needs the queue pair and the already-registered
    // endpoint.
    _ctx: &Ctx,
    mut queue_pair: Ctx::Qp,
    local: &RingEndpoint<Ctx::Mr>,
    config: &RingConfig,
) -> Result<WiredConnection<Ctx::Qp>>
where
    Ctx: VerbsContext,
{
    queue_pair
        .prime_receive_queue(config.receive_queue_prime_count)
        .map_err(|e| Error::rdma_setup(format!("priming receive queue: {e}")))?;

    let (local_qpn, local_lid) = queue_pair.local_identity();
    let local_record = write_record(
        local_qpn,
        local_lid,
        local.ring.remote_descriptor(),
        local.read_pos_slot.remote_descriptor(),
    );

    debug!(local_qpn, local_lid, "sending handshake record");
    full_write(stream, &local_record)?;

    let mut remote_buf = [0u8; RECORD_LEN];
    full_read(stream, &mut remote_buf)?;
    let peer = parse_record(&remote_buf);
    debug!(peer_qpn = peer.qpn, peer_lid = peer.lid, "received handshake record");

    queue_pair
        .connect(peer.qpn, peer.lid)
        .map_err(|e| Error::rdma_setup(format!("transitioning queue pair to RTS: {e}")))?;

    // Barrier: both sides must have reached ready-to-send before either
    // uses the ring. A single byte each way is sufficient.
    full_write(stream, &[0u8])?;
    let mut barrier = [0u8; 1];
    full_read(stream, &mut barrier)?;

    info!(peer_qpn = peer.qpn, peer_lid = peer.lid, "ring handshake complete");

    Ok(WiredConnection {
        queue_pair,
        peer_ring: peer.ring,
        peer_read_pos_slot: peer.read_pos_slot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::sim::SimFabric;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn record_round_trips_through_bytes() {
        let ring = RemoteDescriptor { address: 0x1000, key: 42 };
        let slot = RemoteDescriptor { address: 0x2000, key: 7 };
        let buf = write_record(9, 3, ring, slot);
        let parsed = parse_record(&buf);
        assert_eq!(parsed.qpn, 9);
        assert_eq!(parsed.lid, 3);
        assert_eq!(parsed.ring, ring);
        assert_eq!(parsed.read_pos_slot, slot);
    }

    #[test]
    fn handshake_wires_both_sides() {
        use std::sync::mpsc;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let fabric = SimFabric::new(256);
            let ctx = fabric.context();
            let qp = ctx.create_queue_pair().unwrap();
            let local = RingEndpoint {
                ring: ctx.register_memory(vec![0u8; 64]).unwrap(),
                read_pos_slot: ctx.register_memory(vec![0u8; 8]).unwrap(),
            };
            let local_ring_descriptor = local.ring.remote_descriptor();
            let config = RingConfig::new(64);
            let wired = run(&mut stream, &ctx, qp, &local, &config).unwrap();
            tx.send(local_ring_descriptor).unwrap();
            wired
        });

        let mut client_stream = TcpStream::connect(addr).unwrap();
        let fabric = SimFabric::new(256);
        let ctx = fabric.context();
        let qp = ctx.create_queue_pair().unwrap();
        let local = RingEndpoint {
            ring: ctx.register_memory(vec![0u8; 64]).unwrap(),
            read_pos_slot: ctx.register_memory(vec![0u8; 8]).unwrap(),
        };
        let config = RingConfig::new(64);
        let client_wired = run(&mut client_stream, &ctx, qp, &local, &config).unwrap();
        let server_ring_descriptor = rx.recv().unwrap();
        let _server_wired = server.join().unwrap();

        assert_eq!(client_wired.peer_ring, server_ring_descriptor);
    }
}
