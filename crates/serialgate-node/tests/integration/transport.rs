//! End-to-end over real transports with the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serialgate_node::local_bus::LocalBus;
use serialgate_node::session::SessionConfig;
use serialgate_node::transport;
use serialgate_protocol::{topic_ids, ProtocolVersion};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::harness::{advertisement, frame_bytes, read_frame, DeviceFrame, DISCOVERY_REQUEST};

const V2: ProtocolVersion = ProtocolVersion::V2;
const WAIT: Duration = Duration::from_secs(5);

async fn next_non_discovery(stream: &mut TcpStream, pending: &mut BytesMut) -> DeviceFrame {
    loop {
        let frame = timeout(WAIT, read_frame(stream, pending)).await.unwrap();
        if !frame.is_discovery() {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_tcp_device_round_trip_through_bus() {
    let bus = LocalBus::new();
    let mut host_rx = bus.subscribe("chatter", "std_msgs/String").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let server = tokio::spawn(transport::serve_tcp(
        listener,
        SessionConfig::default(),
        Arc::new(bus.clone()),
        shutdown_tx.subscribe(),
    ));

    let mut device = TcpStream::connect(addr).await.unwrap();
    let mut pending = BytesMut::new();
    let first = timeout(WAIT, read_frame(&mut device, &mut pending))
        .await
        .unwrap();
    assert!(first.is_discovery());

    // Device -> bus.
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&frame_bytes(
        topic_ids::PUBLISHER,
        &advertisement(125, "chatter", "std_msgs/String"),
        V2,
    ));
    wire.extend_from_slice(&frame_bytes(125, b"hello", V2));
    wire.extend_from_slice(&frame_bytes(
        topic_ids::SUBSCRIBER,
        &advertisement(100, "cmd", "std_msgs/UInt8"),
        V2,
    ));
    device.write_all(&wire).await.unwrap();

    let got = timeout(WAIT, host_rx.recv()).await.unwrap().unwrap();
    assert_eq!(&got[..], b"hello");

    // Bus -> device, once the subscription is in place.
    let deadline = tokio::time::Instant::now() + WAIT;
    while bus
        .publish("cmd", "std_msgs/UInt8", Bytes::from_static(&[42]))
        .unwrap()
        == 0
    {
        assert!(tokio::time::Instant::now() < deadline, "subscription never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let frame = next_non_discovery(&mut device, &mut pending).await;
    assert_eq!(frame.topic_id, 100);
    assert_eq!(frame.version, V2);
    assert_eq!(&frame.payload[..], &[42]);

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();

    let stop = next_non_discovery(&mut device, &mut pending).await;
    assert_eq!(stop.topic_id, topic_ids::TX_STOP);
}

#[tokio::test]
async fn test_tcp_sessions_are_independent() {
    let bus = LocalBus::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let server = tokio::spawn(transport::serve_tcp(
        listener,
        SessionConfig::default(),
        Arc::new(bus),
        shutdown_tx.subscribe(),
    ));

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut first_pending = BytesMut::new();
    let mut second_pending = BytesMut::new();
    assert!(timeout(WAIT, read_frame(&mut first, &mut first_pending))
        .await
        .unwrap()
        .is_discovery());
    assert!(timeout(WAIT, read_frame(&mut second, &mut second_pending))
        .await
        .unwrap()
        .is_discovery());

    // One device going away leaves the other session running.
    drop(first);
    second
        .write_all(&frame_bytes(topic_ids::TIME, &[], V2))
        .await
        .unwrap();
    let reply = next_non_discovery(&mut second, &mut second_pending).await;
    assert_eq!(reply.topic_id, topic_ids::TIME);

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_refused_advertisement_leaves_bus_untouched() {
    let bus = LocalBus::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let server = tokio::spawn(transport::serve_tcp(
        listener,
        SessionConfig::default(),
        Arc::new(bus.clone()),
        shutdown_tx.subscribe(),
    ));

    let mut device = TcpStream::connect(addr).await.unwrap();
    let mut pending = BytesMut::new();
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&frame_bytes(
        topic_ids::PUBLISHER,
        &advertisement(topic_ids::TIME, "odom", "bogus/Type"),
        V2,
    ));
    // Answered only after the advertisement was handled.
    wire.extend_from_slice(&frame_bytes(topic_ids::TIME, &[], V2));
    device.write_all(&wire).await.unwrap();

    let reply = next_non_discovery(&mut device, &mut pending).await;
    assert_eq!(reply.topic_id, topic_ids::TIME);
    assert!(bus.subscribe("odom", "nav_msgs/Odometry").is_ok());

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_serial_device_reopened_after_session_ends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ttyFAKE0");
    std::fs::write(&path, b"").unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let server = {
        let path = path.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            transport::serve_serial(
                &path,
                Duration::from_millis(20),
                SessionConfig::default(),
                Arc::new(LocalBus::new()),
                shutdown,
            )
            .await
        })
    };

    // A plain file reads as end of stream at once, so every session writes
    // its discovery request and ends. The writes land at offset 0.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let written = std::fs::read(&path).unwrap();
        if written == DISCOVERY_REQUEST {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no discovery written: {written:02x?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_serial_device_retried_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent");

    let (shutdown_tx, _) = broadcast::channel(1);
    let server = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            transport::serve_serial(
                &path,
                Duration::from_millis(10),
                SessionConfig::default(),
                Arc::new(LocalBus::new()),
                shutdown,
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();
    timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}
