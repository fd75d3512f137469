//! Transport-level scenarios: framing through the rings, backpressure,
//! and recovery from corrupted ring bytes.

use std::sync::atomic::Ordering;

use memlink::layout::{CLIENT_TO_SERVER_OFFSET, RING_SIZE, SharedHeader};
use memlink::packet::PACKET_HEADER_SIZE;
use memlink::{MessageKind, Packet, ReadError, Role, Transport, WriteError};
use memlink_primitives::{SemIndex, SemaphoreSet};

fn unique(tag: &str) -> String {
    format!("memlink-tp-{tag}-{}", std::process::id())
}

fn pair(tag: &str) -> (Transport, Transport) {
    let name = unique(tag);
    let server = Transport::create(&name, Role::Server).unwrap();
    let client = Transport::create(&name, Role::Client).unwrap();
    (server, client)
}

#[test]
fn both_directions_start_empty() {
    let (server, client) = pair("empty");
    assert!(matches!(server.read_packet(), Err(ReadError::Empty)));
    assert!(matches!(client.read_packet(), Err(ReadError::Empty)));
}

#[test]
fn client_to_server_roundtrip() {
    let (server, client) = pair("c2s");

    let packet = Packet::new(MessageKind::Request, 11, b"over the ring");
    client.write_packet(&packet).unwrap();

    let received = server.read_packet().unwrap();
    assert_eq!(received.payload(), b"over the ring");
    assert_eq!(received.seq(), 11);
    assert_eq!(received.kind(), Some(MessageKind::Request));
}

#[test]
fn server_to_client_roundtrip() {
    let (server, client) = pair("s2c");

    let packet = Packet::new(MessageKind::Response, 12, b"and back");
    server.write_packet(&packet).unwrap();

    let received = client.read_packet().unwrap();
    assert_eq!(received.payload(), b"and back");
    assert_eq!(received.kind(), Some(MessageKind::Response));
}

#[test]
fn large_payload_survives_the_ring() {
    let (server, client) = pair("large");

    let payload = vec![0xA5u8; 512 * 1024];
    client
        .write_packet(&Packet::new(MessageKind::Request, 1, &payload))
        .unwrap();

    let received = server.read_packet().unwrap();
    assert_eq!(received.payload().len(), payload.len());
    assert!(received.payload().iter().all(|&b| b == 0xA5));
}

#[test]
fn sustained_traffic_wraps_the_ring() {
    let (server, client) = pair("wrap");

    // Enough 23 KiB packets to lap a 1 MiB ring several times, in both
    // directions at once.
    for round in 0..400u32 {
        let payload: Vec<u8> = (0..23 * 1024u32)
            .map(|i| (round.wrapping_add(i) % 251) as u8)
            .collect();

        client
            .write_packet(&Packet::new(MessageKind::Request, round, &payload))
            .unwrap();
        server
            .write_packet(&Packet::new(MessageKind::Response, round, &payload))
            .unwrap();

        let at_server = server.read_packet().unwrap();
        let at_client = client.read_packet().unwrap();
        assert_eq!(at_server.seq(), round);
        assert_eq!(at_server.payload(), payload);
        assert_eq!(at_client.seq(), round);
        assert_eq!(at_client.payload(), payload);
    }
}

#[test]
fn oversized_packet_is_rejected_outright() {
    let (_server, client) = pair("oversize");

    let packet = Packet::new(MessageKind::Request, 0, &vec![0u8; RING_SIZE as usize]);
    assert!(matches!(
        client.write_packet(&packet),
        Err(WriteError::TooLarge(_))
    ));
}

#[test]
fn full_ring_pushes_back_until_drained() {
    let (server, client) = pair("full");

    let payload = vec![7u8; 300_000];
    for _ in 0..3 {
        client
            .write_packet(&Packet::new(MessageKind::Request, 0, &payload))
            .unwrap();
    }
    assert!(matches!(
        client.write_packet(&Packet::new(MessageKind::Request, 0, &payload)),
        Err(WriteError::Full)
    ));

    // Consuming one packet frees enough space for the next write.
    server.read_packet().unwrap();
    client
        .write_packet(&Packet::new(MessageKind::Request, 0, &payload))
        .unwrap();
}

#[test]
fn contended_write_mutex_reports_busy() {
    let name = unique("busy");
    let server = Transport::create(&name, Role::Server).unwrap();
    let client = Transport::create(&name, Role::Client).unwrap();

    let sems = SemaphoreSet::open(&name).unwrap();
    assert!(sems.try_wait(SemIndex::ClientWrite).unwrap());

    let packet = Packet::new(MessageKind::Request, 0, b"blocked");
    assert!(matches!(
        client.write_packet(&packet),
        Err(WriteError::Busy)
    ));

    sems.signal(SemIndex::ClientWrite).unwrap();
    client.write_packet(&packet).unwrap();
    assert_eq!(server.read_packet().unwrap().payload(), b"blocked");
}

#[test]
fn garbage_before_a_packet_is_skipped() {
    let (server, client) = pair("resync");

    // Plant stray bytes at the front of the client's ring and advance its
    // write position past them, as a misbehaving writer would.
    const GARBAGE: usize = 37;
    let region = server.region();
    unsafe {
        let ring = region.as_ptr().add(CLIENT_TO_SERVER_OFFSET);
        for i in 0..GARBAGE {
            *ring.add(i) = 0xDD;
        }
        let header = &*(region.as_ptr() as *const SharedHeader);
        header.client_write_pos.store(GARBAGE as u32, Ordering::SeqCst);
    }

    // A real packet lands after the garbage.
    let packet = Packet::new(MessageKind::Request, 5, b"survivor");
    client.write_packet(&packet).unwrap();

    // First attempt trips over the garbage and discards it; the next one
    // surfaces the valid packet.
    let err = server.read_packet().unwrap_err();
    assert!(matches!(err, ReadError::BadMagic(_)));
    assert!(err.discarded_data());
    let received = server.read_packet().unwrap();
    assert_eq!(received.payload(), b"survivor");
    assert_eq!(received.seq(), 5);
}

#[test]
fn checksum_mismatch_skips_exactly_one_packet() {
    let (server, client) = pair("crc");

    client
        .write_packet(&Packet::new(MessageKind::Request, 1, b"to be damaged"))
        .unwrap();

    // Flip one payload byte in place.
    let region = server.region();
    unsafe {
        let byte = region
            .as_ptr()
            .add(CLIENT_TO_SERVER_OFFSET + PACKET_HEADER_SIZE + 3);
        *byte ^= 0xFF;
    }

    client
        .write_packet(&Packet::new(MessageKind::Request, 2, b"intact"))
        .unwrap();

    let err = server.read_packet().unwrap_err();
    assert!(matches!(err, ReadError::BadChecksum));
    assert!(err.discarded_data());
    let received = server.read_packet().unwrap();
    assert_eq!(received.payload(), b"intact");
    assert_eq!(received.seq(), 2);
}

#[test]
fn client_without_server_gives_up() {
    let err = Transport::create(&unique("orphan"), Role::Client).unwrap_err();
    assert!(matches!(err, memlink::AttachError::Segment(_)));
}
