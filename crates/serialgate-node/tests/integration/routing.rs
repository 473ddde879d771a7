//! Frame routing: advertisements, bridges, control replies, bad input.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serialgate_protocol::{topic_ids, Direction, ProtocolVersion, Time, MAX_PAYLOAD_LEN};

use crate::harness::{advertisement, frame_bytes, settle, topic_info, Harness};

const V1: ProtocolVersion = ProtocolVersion::V1;
const V2: ProtocolVersion = ProtocolVersion::V2;

#[tokio::test]
async fn test_publication_forwarded_to_bridge() {
    let h = Harness::start();
    h.device.send_frame(
        topic_ids::PUBLISHER,
        &advertisement(125, "range", "sensor_msgs/Range"),
        V2,
    );
    h.device.send_frame(125, &[1, 2, 3], V2);
    settle().await;

    assert_eq!(
        h.recorder.advertised(),
        vec![(Direction::Publish, topic_info(125, "range", "sensor_msgs/Range"))]
    );
    assert_eq!(
        h.recorder.forwarded(),
        vec![(125, "sensor_msgs/Range".to_string(), Bytes::from_static(&[1, 2, 3]))]
    );

    let (exit, _) = h.stop().await;
    assert_eq!(exit.stats.forwarded, 1);
    assert_eq!(exit.stats.control_frames, 1);
    assert_eq!(exit.version, V2);
}

#[tokio::test]
async fn test_readvertisement_replaces_bridge() {
    let h = Harness::start();
    h.device.send_frame(
        topic_ids::PUBLISHER,
        &advertisement(125, "odom", "nav_msgs/Odometry"),
        V2,
    );
    h.device.send_frame(
        topic_ids::PUBLISHER,
        &advertisement(125, "odom", "geometry_msgs/Pose"),
        V2,
    );
    h.device.send_frame(125, b"pose", V2);
    settle().await;

    assert_eq!(h.recorder.live_bridges(), 1);
    let forwarded = h.recorder.forwarded();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].1, "geometry_msgs/Pose");

    h.stop().await;
}

#[tokio::test]
async fn test_subscriber_sink_writes_to_device() {
    let mut h = Harness::start();
    h.device.send_frame(
        topic_ids::SUBSCRIBER,
        &advertisement(100, "cmd_vel", "geometry_msgs/Twist"),
        V2,
    );
    settle().await;

    let sink = h.recorder.sink(100).expect("subscriber bridge created");
    sink.send(Bytes::from_static(b"twist")).await.unwrap();

    let frame = h.device.next_non_discovery().await;
    assert_eq!(frame.version, V2);
    assert_eq!(frame.topic_id, 100);
    assert_eq!(&frame.payload[..], b"twist");

    h.stop().await;
}

#[tokio::test]
async fn test_legacy_device_gets_ver1_frames() {
    let mut h = Harness::start();
    h.device.send_frame(
        topic_ids::SUBSCRIBER,
        &advertisement(101, "led", "std_msgs/Bool"),
        V1,
    );
    settle().await;

    h.handle.send(101, Bytes::from_static(&[1])).await.unwrap();
    let frame = h.device.next_non_discovery().await;
    assert_eq!(frame.version, V1);
    assert_eq!(frame.topic_id, 101);
    assert_eq!(&frame.payload[..], &[1]);

    h.stop().await;
}

#[tokio::test]
async fn test_time_request_answered_with_wall_clock() {
    let mut h = Harness::start();
    h.device.send_frame(topic_ids::TIME, &[], V2);

    let reply = h.device.next_non_discovery().await;
    assert_eq!(reply.version, V2);
    assert_eq!(reply.topic_id, topic_ids::TIME);
    assert_eq!(reply.payload.len(), Time::ENCODED_LEN);

    let time = Time::decode(&reply.payload).unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    assert!((now - time.secs as i64).abs() <= 5);
    assert!(time.nsecs < 1_000_000_000);

    h.stop().await;
}

#[tokio::test]
async fn test_bad_input_does_not_end_session() {
    let h = Harness::start();
    // Fix the dialect first.
    h.device.send_frame(topic_ids::PUBLISHER, &[], V2);

    let mut bad_checksum = frame_bytes(130, b"abc", V2).to_vec();
    let last = bad_checksum.len() - 1;
    bad_checksum[last] = bad_checksum[last].wrapping_add(1);
    h.device.send(bad_checksum);

    let mut bad_length = frame_bytes(100, &[1, 2], V2).to_vec();
    bad_length[6] ^= 0x10;
    h.device.send(bad_length);

    h.device.send(vec![0x00, 0x13, 0x37]);
    h.device.send_frame(200, b"nobody", V2);
    // Advertisement cut off inside its topic id.
    h.device.send_frame(topic_ids::PUBLISHER, &[0x7d], V2);

    h.device.send_frame(
        topic_ids::PUBLISHER,
        &advertisement(125, "range", "sensor_msgs/Range"),
        V2,
    );
    h.device.send_frame(125, &[9], V2);
    settle().await;

    assert_eq!(h.recorder.live_bridges(), 1);
    assert_eq!(h.recorder.forwarded().len(), 1);

    let (exit, _) = h.stop().await;
    assert_eq!(exit.stats.reader.bad_checksum, 1);
    assert_eq!(exit.stats.reader.bad_length_checksum, 1);
    assert_eq!(exit.stats.unrecognized, 1);
    assert_eq!(exit.stats.handler_failures, 1);
    assert_eq!(exit.stats.forwarded, 1);
}

#[tokio::test]
async fn test_unhandled_control_ids_unrecognized() {
    let h = Harness::start();
    for id in [
        topic_ids::PARAMETER_REQUEST,
        topic_ids::SERVICE_SERVER,
        topic_ids::SERVICE_CLIENT,
    ] {
        h.device.send_frame(id, &[], V2);
    }
    settle().await;

    let (exit, _) = h.stop().await;
    assert_eq!(exit.stats.unrecognized, 3);
    assert_eq!(exit.stats.handler_failures, 0);
}

#[tokio::test]
async fn test_device_data_on_subscribed_topic_not_forwarded() {
    let h = Harness::start();
    h.device.send_frame(
        topic_ids::SUBSCRIBER,
        &advertisement(100, "cmd", "std_msgs/UInt8"),
        V2,
    );
    h.device.send_frame(100, &[5], V2);
    settle().await;

    assert!(h.recorder.forwarded().is_empty());
    let (exit, _) = h.stop().await;
    assert_eq!(exit.stats.unrecognized, 1);
}

#[tokio::test]
async fn test_write_before_dialect_known_is_dropped() {
    let mut h = Harness::start();
    h.handle.send(125, Bytes::from_static(b"early")).await.unwrap();
    settle().await;

    assert!(h.device.try_next_frame().unwrap().is_discovery());
    assert!(h.device.try_next_frame().is_none());

    let (exit, mut device) = h.stop().await;
    assert_eq!(exit.stats.writes_aborted, 1);
    assert_eq!(exit.stats.frames_sent, 1);
    // Dialect never detected: no TX_STOP either.
    assert!(device.try_next_frame().is_none());
}

#[tokio::test]
async fn test_oversized_write_aborted_session_continues() {
    let mut h = Harness::start();
    h.device.send_frame(topic_ids::PUBLISHER, &[], V2);
    settle().await;

    h.handle
        .send(125, Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]))
        .await
        .unwrap();
    h.handle.send(125, Bytes::from_static(b"ok")).await.unwrap();

    let frame = h.device.next_non_discovery().await;
    assert_eq!(frame.topic_id, 125);
    assert_eq!(&frame.payload[..], b"ok");

    let (exit, _) = h.stop().await;
    assert_eq!(exit.stats.writes_aborted, 1);
}

#[tokio::test]
async fn test_reserved_id_advertisement_creates_no_bridge() {
    let h = Harness::start();
    h.device.send_frame(
        topic_ids::PUBLISHER,
        &advertisement(topic_ids::TIME, "odom", "bogus/Type"),
        V2,
    );
    h.device.send_frame(
        topic_ids::SUBSCRIBER,
        &advertisement(99, "cmd", "std_msgs/UInt8"),
        V2,
    );
    settle().await;

    // Refused before the factory saw them.
    assert!(h.recorder.advertised().is_empty());
    assert_eq!(h.recorder.live_bridges(), 0);

    let (exit, _) = h.stop().await;
    assert_eq!(exit.stats.handler_failures, 2);
    assert_eq!(exit.stats.bridges_released, 0);
}
