//! Handshake scenarios: happy path, out-of-order identity, resync, and
//! read deadlines.

mod common;

use cg_protocol::{DeviceStatus, EventType};
use common::{fast_config, start_gateway, FakeDevice, ICCID, PHYS};
use dny_core::payload::{parse_server_time, SwipeCard};
use dny_core::{Command, DeviceId, DnyMessage};
use std::time::Duration;
use tokio::io::AsyncReadExt;

const DEV: DeviceId = DeviceId::from_physical(PHYS);

#[tokio::test]
async fn handshake_happy_path() {
    let harness = start_gateway(fast_config()).await;
    let mut device = FakeDevice::connect(harness.addr, PHYS).await;

    device.send_iccid().await;
    let register_id = device.register().await;

    // The server acks the registration with its current time, echoing the
    // message id.
    let ack = device
        .read_frame_with_command(Command::Register.code(), Duration::from_secs(5))
        .await;
    assert_eq!(ack.message_id, register_id);
    assert_eq!(ack.physical_id, PHYS);
    let server_time = parse_server_time(&ack.payload).expect("time payload");
    assert!(server_time > 1_600_000_000);

    // Device exists in its ICCID group, Registered until the heartbeat.
    let device_entry = harness.gateway.registry.device(DEV).await.unwrap();
    assert_eq!(device_entry.iccid, ICCID);
    assert_eq!(device_entry.status, DeviceStatus::Registered);
    assert_eq!(harness.gateway.registry.group_devices(ICCID).await.len(), 1);

    device.heartbeat(vec![0, 0]).await;
    common::wait_until("device online", || async {
        harness
            .gateway
            .registry
            .device(DEV)
            .await
            .is_some_and(|d| d.status == DeviceStatus::Online)
    })
    .await;
    let device_entry = harness.gateway.registry.device(DEV).await.unwrap();
    assert!(device_entry.last_heartbeat.is_some());

    // Lifecycle events were recorded.
    let recent = harness.gateway.events.recent(100);
    let types: Vec<EventType> = recent.iter().map(|e| e.event_type).collect();
    assert!(types.contains(&EventType::DeviceRegister));
    assert!(types.contains(&EventType::DeviceOnline));
    assert!(types.contains(&EventType::DeviceHeartbeat));
    harness.shutdown();
}

#[tokio::test]
async fn registration_before_iccid_lands_in_synthetic_group_then_migrates() {
    let harness = start_gateway(fast_config()).await;
    let mut device = FakeDevice::connect(harness.addr, PHYS).await;

    device.register().await;
    device
        .read_frame_with_command(Command::Register.code(), Duration::from_secs(5))
        .await;

    let entry = harness.gateway.registry.device(DEV).await.unwrap();
    assert!(entry.iccid.starts_with("conn:"), "got {}", entry.iccid);

    // The ICCID arrives late; the device migrates into the real group.
    device.send_iccid().await;
    common::wait_until("group migration", || async {
        harness.gateway.registry.group_devices(ICCID).await.len() == 1
    })
    .await;
    let entry = harness.gateway.registry.device(DEV).await.unwrap();
    assert_eq!(entry.iccid, ICCID);
    harness.shutdown();
}

#[tokio::test]
async fn garbage_prefix_resynchronizes_and_connection_survives() {
    let harness = start_gateway(fast_config()).await;
    let mut device = FakeDevice::connect(harness.addr, 0x04A2_6CF3).await;

    // Four junk bytes, then a valid swipe-card frame, all in one segment.
    let mut bytes = vec![0x58, 0x58, 0x58, 0x58];
    let swipe = DnyMessage {
        physical_id: 0x04A2_6CF3,
        message_id: 0x0002,
        command: Command::SwipeCard.code(),
        payload: SwipeCard {
            card_no: 0x0012_3456,
            port: 0,
        }
        .encode(),
    };
    bytes.extend_from_slice(&swipe.encode());
    device.send_raw(&bytes).await;

    // The frame after the junk was processed: the swipe ack echoes its id.
    let ack = device
        .read_frame_with_command(Command::SwipeCard.code(), Duration::from_secs(5))
        .await;
    assert_eq!(ack.message_id, 0x0002);

    // Connection still open and usable.
    device.heartbeat(vec![0]).await;
    common::wait_until("device online after resync", || async {
        harness
            .gateway
            .registry
            .device(DeviceId::from_physical(0x04A2_6CF3))
            .await
            .is_some_and(|d| d.status == DeviceStatus::Online)
    })
    .await;
    harness.shutdown();
}

#[tokio::test]
async fn link_keepalive_refreshes_heartbeat() {
    let harness = start_gateway(fast_config()).await;
    let mut device = FakeDevice::connect(harness.addr, PHYS).await;
    device.send_iccid().await;
    device.register().await;
    device
        .read_frame_with_command(Command::Register.code(), Duration::from_secs(5))
        .await;

    device.send_link().await;
    common::wait_until("link heartbeat recorded", || async {
        harness
            .gateway
            .registry
            .device(DEV)
            .await
            .is_some_and(|d| d.heartbeat_count == 1 && d.status == DeviceStatus::Online)
    })
    .await;
    harness.shutdown();
}

#[tokio::test]
async fn silent_connection_hits_the_initial_deadline() {
    let mut config = fast_config();
    config.tcp.initial_read_timeout = Duration::from_millis(200);
    let harness = start_gateway(config).await;
    let mut device = FakeDevice::connect(harness.addr, PHYS).await;

    // Say nothing; the server must close the socket.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), device.stream.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) => {}
        other => panic!("expected EOF from deadline close, got {other:?}"),
    }
    harness.shutdown();
}

#[tokio::test]
async fn reconnect_displaces_the_old_connection() {
    let harness = start_gateway(fast_config()).await;
    let mut first = FakeDevice::connect(harness.addr, PHYS).await;
    first.send_iccid().await;
    first.register().await;
    first
        .read_frame_with_command(Command::Register.code(), Duration::from_secs(5))
        .await;

    let mut second = FakeDevice::connect(harness.addr, PHYS).await;
    second.send_iccid().await;
    second.register().await;
    second
        .read_frame_with_command(Command::Register.code(), Duration::from_secs(5))
        .await;

    // The first connection is closed by the gateway.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {} // drain any trailing frames to the old socket
            }
        }
    })
    .await;
    assert!(read.is_ok(), "old connection was not closed");

    let entry = harness.gateway.registry.device(DEV).await.unwrap();
    assert_eq!(entry.reconnect_count, 1);
    harness.shutdown();
}
