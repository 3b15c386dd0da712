//! End-to-end tests driving two `MessageRing`s against each other over a
//! real TCP loopback connection and the in-process `verbs::sim` backend.

use riptide::recv::ReceivePath;
use riptide::verbs::sim::SimFabric;
use riptide::verbs::{MemoryRegion, QueuePair, VerbsContext};
use riptide::{Error, MessageRing, RingConfig, RingMetrics};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || listener.accept().unwrap().0);
    let client = TcpStream::connect(addr).unwrap();
    (server.join().unwrap(), client)
}

fn spawn_rings(
    buffer_size: usize,
) -> (
    thread::JoinHandle<MessageRing<riptide::verbs::sim::SimQueuePair, riptide::verbs::sim::SimMemoryRegion>>,
    MessageRing<riptide::verbs::sim::SimQueuePair, riptide::verbs::sim::SimMemoryRegion>,
) {
    let (mut server_stream, mut client_stream) = connected_pair();
    let fabric = SimFabric::new(4096);
    let server_ctx = fabric.context();
    let client_ctx = fabric.context();

    let server = thread::spawn(move || {
        let config = RingConfig::new(buffer_size);
        MessageRing::new(&mut server_stream, &server_ctx, config).unwrap()
    });
    let config = RingConfig::new(buffer_size);
    let client_ring = MessageRing::new(&mut client_stream, &client_ctx, config).unwrap();
    (server, client_ring)
}

#[test]
fn hello_world_round_trip() {
    let (server, mut client) = spawn_rings(4096);
    let mut server = server.join().unwrap();

    client.send(b"hello, world").unwrap();
    let mut buf = [0u8; 64];
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello, world");

    let snap = client.metrics();
    assert_eq!(snap.messages_sent, 1);
    assert_eq!(snap.bytes_sent, 12);
}

#[test]
fn inline_threshold_boundary_is_respected() {
    let (server, mut client) = spawn_rings(8192);
    let mut server = server.join().unwrap();

    // Default inline_threshold is 256; a 200-byte wire payload stays
    // under it and should be posted inline.
    let small = vec![7u8; 192];
    client.send(&small).unwrap();
    let mut buf = [0u8; 8192];
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(n, small.len());
    assert_eq!(&buf[..n], &small[..]);
    assert_eq!(client.metrics().inline_sends, 1);
    server.flush().unwrap();

    // A payload whose 8-byte-framed wire size exceeds the threshold goes
    // through the registered scratch region instead.
    let big = vec![9u8; 300];
    client.send(&big).unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], &big[..]);
    assert_eq!(client.metrics().non_inline_sends, 1);
}

#[test]
fn wraps_around_a_small_ring() {
    // spec.md §8 (P6): N=64, three 20-byte payloads. 12+20=32 bytes of
    // cursor space each, so the cursor crosses the physical end of the
    // buffer exactly at the third message (writePos 64 mod 64 == 0)
    // without needing padding; this exercises the cursor-masking wrap
    // rather than the padding path.
    let (server, mut client) = spawn_rings(64);
    let mut server = server.join().unwrap();

    let msgs: [&[u8]; 3] = [&[0xAAu8; 20], &[0xBBu8; 20], &[0xCCu8; 20]];
    let mut buf = [0u8; 64];
    for m in msgs {
        client.send(m).unwrap();
        let n = server.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], m);
        server.flush().unwrap();
    }
}

#[test]
fn wrap_padding_is_consumed_transparently() {
    // A 41-byte payload leaves an 11-byte tail (< the 12-byte frame
    // overhead), forcing the sender to pad the tail and the receiver to
    // detect and skip it per the wrap policy, before the second message
    // lands at the wrap boundary.
    let (server, mut client) = spawn_rings(64);
    let mut server = server.join().unwrap();

    let first = vec![1u8; 41];
    let second = vec![2u8; 10];
    let mut buf = [0u8; 64];

    client.send(&first).unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], &first[..]);
    server.flush().unwrap();

    client.send(&second).unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], &second[..]);

    assert!(client.metrics().wrap_events >= 1);
}

#[test]
fn send_blocks_until_receiver_drains() {
    let (server, mut client) = spawn_rings(1024);
    let mut server = server.join().unwrap();

    // Fill most of a 1024-byte ring with near-capacity payloads, forcing
    // the next send to wait on the receiver's published readPos.
    let chunk = vec![0xABu8; 480];
    client.send(&chunk).unwrap();
    client.send(&chunk).unwrap();

    let sender_handle = thread::spawn(move || {
        client.send(&chunk).unwrap();
        client
    });

    // Give the blocked sender time to actually be waiting before draining.
    thread::sleep(std::time::Duration::from_millis(20));

    let mut buf = [0u8; 1024];
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(n, 480);
    server.flush().unwrap();

    let mut client = sender_handle.join().unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(n, 480);
    server.flush().unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(n, 480);

    client.send(b"done").unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"done");
}

#[test]
fn buffer_too_small_is_retryable_without_consuming_the_message() {
    let (server, mut client) = spawn_rings(4096);
    let mut server = server.join().unwrap();

    client.send(b"0123456789abcdef").unwrap();

    let mut tiny = [0u8; 4];
    let err = server.receive(&mut tiny).unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { needed: 16, available: 4 }));

    // The message is still there: a big-enough buffer reads it intact.
    let mut big = [0u8; 64];
    let n = server.receive(&mut big).unwrap();
    assert_eq!(&big[..n], b"0123456789abcdef");
}

#[test]
fn wrap_marker_disambiguates_tail_with_room_for_a_header() {
    // A tail that can hold a 4-byte header but not the message that
    // follows (here: 20 bytes of tail, but the next message needs 22)
    // reads back as plain zero if the sender relies only on the
    // tail-size heuristic, indistinguishable from "no message yet". The
    // explicit wrap marker resolves that.
    let (server, mut client) = spawn_rings(64);
    let mut server = server.join().unwrap();

    let first = vec![5u8; 32];
    let second = vec![6u8; 10];
    let mut buf = [0u8; 64];

    client.send(&first).unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], &first[..]);
    server.flush().unwrap();

    client.send(&second).unwrap();
    let n = server.receive(&mut buf).unwrap();
    assert_eq!(&buf[..n], &second[..]);
}

#[test]
fn non_retryable_error_breaks_the_ring() {
    let (server, mut client) = spawn_rings(64);
    let _server = server.join().unwrap();

    // A payload that can never fit the ring is a protocol error, not a
    // `BufferTooSmall`; the ring is marked broken and every later call
    // reports `ConnectionLost` rather than retrying.
    let oversized = vec![0u8; 128];
    let err = client.send(&oversized).unwrap_err();
    assert!(matches!(err, Error::ProtocolError { .. }));

    let err = client.send(b"after").unwrap_err();
    assert!(matches!(err, Error::ConnectionLost { .. }));
}

#[test]
fn torn_footer_times_out_as_protocol_error() {
    // A header landed with no matching footer (the peer crashed or is
    // still mid-write) must not stall the receiver forever; once it has
    // stayed torn longer than `protocol_error_timeout` it surfaces as a
    // `ProtocolError` instead.
    let fabric = SimFabric::new(256);
    let ctx = fabric.context();
    let mut ring_mr = ctx.register_memory(vec![0u8; 64]).unwrap();
    let slot_mr = ctx.register_memory(vec![0u8; 8]).unwrap();
    let mut qp = ctx.create_queue_pair().unwrap();
    qp.connect(1, 1).unwrap();

    ring_mr.as_mut_slice()[0..4].copy_from_slice(&10u32.to_le_bytes());

    let mut config = RingConfig::new(64);
    config.protocol_error_timeout = Duration::from_millis(30);

    let mut recv = ReceivePath::new(
        Arc::new(qp),
        ring_mr,
        slot_mr,
        &config,
        Arc::new(RingMetrics::new()),
    );

    let mut buf = [0u8; 64];
    let err = recv.receive(&mut buf).unwrap_err();
    assert!(matches!(err, Error::ProtocolError { .. }));
}

#[test]
fn ring_tears_down_cleanly_on_drop() {
    let (server, client) = spawn_rings(4096);
    let server = server.join().unwrap();
    drop(client);
    drop(server);
}
