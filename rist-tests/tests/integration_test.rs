//! End-to-end sender/receiver tests over loopback UDP
//!
//! Short recovery windows keep these fast; generous collection deadlines
//! keep them stable under load.

use bytes::Bytes;
use rist::{DataBlock, Error, OobBlock, PeerConfig, Profile, Receiver, Sender};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grab a free UDP port on loopback
fn free_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

fn fast_config(addr: SocketAddr) -> PeerConfig {
    let mut config = PeerConfig::new(addr);
    config.recovery_maxbitrate = 10_000_000;
    config.recovery_length_min = 100;
    config.recovery_length_max = 200;
    config.recovery_rtt_min = 10;
    config.recovery_rtt_max = 100;
    config
}

fn collect_blocks(receiver: &Receiver, count: usize, deadline: Duration) -> Vec<DataBlock> {
    let mut blocks = Vec::new();
    let until = Instant::now() + deadline;
    while blocks.len() < count && Instant::now() < until {
        match receiver.data_read(Duration::from_millis(100)) {
            Ok(block) => blocks.push(block),
            Err(Error::TimedOut) => {}
            Err(e) => panic!("data_read failed: {}", e),
        }
    }
    blocks
}

#[test]
fn clean_path_delivers_in_order() {
    let addr = free_addr();

    let receiver = Receiver::new(Profile::Main).unwrap();
    receiver.peer_add(&fast_config(addr)).unwrap();
    receiver.stats_interval_set(Duration::from_millis(100)).unwrap();
    receiver.start().unwrap();

    let sender = Sender::new(Profile::Main, 0x100).unwrap();
    sender.peer_add(&fast_config(addr)).unwrap();
    sender.start().unwrap();

    for i in 0..20u8 {
        sender
            .data_write(DataBlock::new(Bytes::from(vec![i; 188])))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let blocks = collect_blocks(&receiver, 20, Duration::from_secs(5));
    assert_eq!(blocks.len(), 20);

    // Strictly increasing sequences, payloads in submission order.
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.payload[0], i as u8);
        assert_eq!(block.flow_id, 0x100);
    }
    for pair in blocks.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }

    // Let a stats interval elapse and check the flow counters.
    std::thread::sleep(Duration::from_millis(300));
    let stats = receiver.stats();
    assert_eq!(stats.flows.len(), 1);
    assert_eq!(stats.flows[0].flow_id, 0x100);
    assert!(stats.flows[0].received >= 20);
    assert_eq!(stats.flows[0].lost, 0);
}

#[test]
fn encrypted_compressed_path_roundtrips() {
    let addr = free_addr();
    let secret = "integration test passphrase";

    let receiver = Receiver::new(Profile::Main).unwrap();
    receiver.encrypt_aes_set(secret, 256).unwrap();
    receiver.peer_add(&fast_config(addr)).unwrap();
    receiver.start().unwrap();

    let sender = Sender::new(Profile::Main, 0x200).unwrap();
    sender.encrypt_aes_set(secret, 256).unwrap();
    sender.compression_set(5).unwrap();
    sender.peer_add(&fast_config(addr)).unwrap();
    sender.start().unwrap();

    // Compressible payloads exercise both transforms.
    let payloads: Vec<Bytes> = (0..10u8)
        .map(|i| Bytes::from(vec![i / 2; 600]))
        .collect();
    for payload in &payloads {
        sender.data_write(DataBlock::new(payload.clone())).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let blocks = collect_blocks(&receiver, payloads.len(), Duration::from_secs(5));
    assert_eq!(blocks.len(), payloads.len());
    for (block, payload) in blocks.iter().zip(&payloads) {
        assert_eq!(&block.payload, payload);
    }
}

#[test]
fn simple_profile_carries_rtp_data() {
    let addr = free_addr();

    let receiver = Receiver::new(Profile::Simple).unwrap();
    receiver.peer_add(&fast_config(addr)).unwrap();
    receiver.start().unwrap();

    let sender = Sender::new(Profile::Simple, 0x300).unwrap();
    sender.peer_add(&fast_config(addr)).unwrap();
    sender.start().unwrap();

    for i in 0..10u8 {
        sender
            .data_write(DataBlock::new(Bytes::from(vec![i; 188])))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let blocks = collect_blocks(&receiver, 10, Duration::from_secs(5));
    assert_eq!(blocks.len(), 10);
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block.payload[0], i as u8);
        assert_eq!(block.flow_id, 0x300);
    }
}

#[test]
fn oob_blocks_arrive_in_order() {
    let addr = free_addr();

    let receiver = Receiver::new(Profile::Main).unwrap();
    receiver.peer_add(&fast_config(addr)).unwrap();
    receiver.start().unwrap();

    let sender = Sender::new(Profile::Main, 0x400).unwrap();
    sender.peer_add(&fast_config(addr)).unwrap();
    sender.start().unwrap();

    // Data loss pressure on the same peer must not disturb OOB ordering;
    // interleave data writes with the OOB submissions.
    for tag in [b'A', b'B', b'C'] {
        sender
            .data_write(DataBlock::new(Bytes::from(vec![tag; 188])))
            .unwrap();
        sender
            .oob_write(OobBlock::new(Bytes::from(vec![tag; 16])))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut oob = Vec::new();
    let until = Instant::now() + Duration::from_secs(5);
    while oob.len() < 3 && Instant::now() < until {
        match receiver.oob_read() {
            Some(block) => oob.push(block),
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    }

    assert_eq!(oob.len(), 3);
    assert_eq!(oob[0].payload[0], b'A');
    assert_eq!(oob[1].payload[0], b'B');
    assert_eq!(oob[2].payload[0], b'C');
}

#[test]
fn silent_sender_triggers_one_disconnect() {
    let addr = free_addr();

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();

    let receiver = Receiver::new(Profile::Main).unwrap();
    receiver
        .auth_handler_set(
            None,
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    receiver.session_timeout_set(Duration::from_millis(600)).unwrap();
    receiver.keepalive_timeout_set(Duration::from_millis(300)).unwrap();
    receiver.peer_add(&fast_config(addr)).unwrap();
    receiver.start().unwrap();

    {
        let sender = Sender::new(Profile::Main, 0x500).unwrap();
        sender.keepalive_timeout_set(Duration::from_millis(300)).unwrap();
        sender.peer_add(&fast_config(addr)).unwrap();
        sender.start().unwrap();

        for i in 0..5u8 {
            sender
                .data_write(DataBlock::new(Bytes::from(vec![i; 188])))
                .unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        let _ = collect_blocks(&receiver, 5, Duration::from_secs(3));
        // The sender context is destroyed here; the path goes silent.
    }

    // Well past the session timeout the peer must be declared dead, once.
    let until = Instant::now() + Duration::from_secs(4);
    while disconnects.load(Ordering::SeqCst) == 0 && Instant::now() < until {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn data_callback_bypasses_pull_queue() {
    let addr = free_addr();

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();

    let receiver = Receiver::new(Profile::Main).unwrap();
    receiver
        .data_callback_set(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    receiver.peer_add(&fast_config(addr)).unwrap();
    receiver.start().unwrap();

    let sender = Sender::new(Profile::Main, 0x600).unwrap();
    sender.peer_add(&fast_config(addr)).unwrap();
    sender.start().unwrap();

    for i in 0..10u8 {
        sender
            .data_write(DataBlock::new(Bytes::from(vec![i; 188])))
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }

    let until = Instant::now() + Duration::from_secs(5);
    while delivered.load(Ordering::SeqCst) < 10 && Instant::now() < until {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(delivered.load(Ordering::SeqCst), 10);

    // The pull queue stays empty when the callback is installed.
    assert!(matches!(
        receiver.data_read(Duration::from_millis(50)),
        Err(Error::TimedOut)
    ));
}
