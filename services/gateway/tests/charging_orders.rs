//! Order lifecycle over the wire: idempotent start, conflicts, stop
//! validation, and settlement.

mod common;

use cg_protocol::{ChargeMode, StartChargingRequest, StopChargingRequest, UpdatePowerRequest};
use common::{fast_config, start_gateway, FakeDevice, TestGateway, PHYS};
use dny_core::payload::{ChargeControl, ChargeControlAck};
use dny_core::{Command, DeviceId};
use gateway::gateway::{OpError, StartOutcome};
use gateway::orders::{OrderError, OrderStatus};
use gateway::ports::PortState;
use std::time::Duration;

const DEV: DeviceId = DeviceId::from_physical(PHYS);

fn start_request(order_no: &str) -> StartChargingRequest {
    StartChargingRequest {
        device_id: "04A228CD".to_owned(),
        port: 1,
        order_no: order_no.to_owned(),
        mode: ChargeMode::Time,
        value: 3600,
        balance: 1000,
        overload_power_w: 0,
    }
}

fn stop_request(order_no: Option<&str>) -> StopChargingRequest {
    StopChargingRequest {
        device_id: "04A228CD".to_owned(),
        port: 1,
        order_no: order_no.map(str::to_owned),
    }
}

/// Register a fake device and drain the registration traffic.
async fn online_device(harness: &TestGateway) -> FakeDevice {
    let mut device = FakeDevice::connect(harness.addr, PHYS).await;
    device.send_iccid().await;
    device.register().await;
    device
        .read_frame_with_command(Command::Register.code(), Duration::from_secs(5))
        .await;
    device.heartbeat(vec![0, 0]).await;
    common::wait_until("device online", || async {
        !harness.gateway.registry.list_online().await.is_empty()
    })
    .await;
    device
}

#[tokio::test]
async fn idempotent_start_emits_exactly_one_command() {
    let harness = start_gateway(fast_config()).await;
    let mut device = online_device(&harness).await;

    let first = harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    let second = harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    assert_eq!(first, StartOutcome::Started);
    assert_eq!(second, StartOutcome::AlreadyActive);

    // Exactly one 0x82 on the wire.
    let control_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    let control = ChargeControl::parse(&control_frame.payload).unwrap();
    assert_eq!(control.action, 1);
    assert_eq!(control.port, 0);
    assert_eq!(control.order_no, "ORDER001");
    assert_eq!(control.value, 3600);
    assert_eq!(control.balance, 1000);
    assert!(
        device.try_read_frame(Duration::from_millis(300)).await.is_none(),
        "second start must not reach the wire"
    );

    // The device accepts; the order moves to Charging.
    device
        .reply(
            &control_frame,
            ChargeControlAck {
                port: 0,
                result: 0,
                order_no: "ORDER001".to_owned(),
            }
            .encode()
            .unwrap(),
        )
        .await;
    common::wait_until("order charging", || async {
        harness
            .gateway
            .orders
            .get(DEV, 0)
            .await
            .is_some_and(|o| o.status == OrderStatus::Charging)
    })
    .await;
    assert_eq!(harness.gateway.ports.state(DEV, 0).await, PortState::Charging);
    harness.shutdown();
}

#[tokio::test]
async fn conflicting_order_is_refused_without_wire_traffic() {
    let harness = start_gateway(fast_config()).await;
    let mut device = online_device(&harness).await;

    harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    let control_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    device
        .reply(
            &control_frame,
            ChargeControlAck {
                port: 0,
                result: 0,
                order_no: "ORDER001".to_owned(),
            }
            .encode()
            .unwrap(),
        )
        .await;

    let err = harness
        .gateway
        .start_charging(&start_request("ORDER002"))
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::Order(OrderError::Conflict { .. })));
    assert!(
        device.try_read_frame(Duration::from_millis(300)).await.is_none(),
        "conflict must not reach the wire"
    );
    // The original order is unchanged.
    let order = harness.gateway.orders.get(DEV, 0).await.unwrap();
    assert_eq!(order.order_no, "ORDER001");
    harness.shutdown();
}

#[tokio::test]
async fn stop_with_wrong_order_is_a_mismatch() {
    let harness = start_gateway(fast_config()).await;
    let mut device = online_device(&harness).await;

    harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;

    let err = harness
        .gateway
        .stop_charging(&stop_request(Some("OTHER")))
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::Order(OrderError::OrderMismatch)));
    assert!(
        device.try_read_frame(Duration::from_millis(300)).await.is_none(),
        "mismatched stop must not reach the wire"
    );

    // Without an order number the stop goes through, carrying the actual
    // order in the payload.
    harness.gateway.stop_charging(&stop_request(None)).await.unwrap();
    let stop_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    let control = ChargeControl::parse(&stop_frame.payload).unwrap();
    assert_eq!(control.action, 0);
    assert_eq!(control.order_no, "ORDER001");
    harness.shutdown();
}

#[tokio::test]
async fn stop_with_no_active_order_is_idempotent_success() {
    let harness = start_gateway(fast_config()).await;
    let _device = online_device(&harness).await;
    harness.gateway.stop_charging(&stop_request(None)).await.unwrap();
    harness.shutdown();
}

#[tokio::test]
async fn accepted_stop_completes_the_order_and_frees_the_port() {
    let harness = start_gateway(fast_config()).await;
    let mut device = online_device(&harness).await;

    harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    let start_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    device
        .reply(
            &start_frame,
            ChargeControlAck {
                port: 0,
                result: 0,
                order_no: "ORDER001".to_owned(),
            }
            .encode()
            .unwrap(),
        )
        .await;
    common::wait_until("charging", || async {
        harness
            .gateway
            .orders
            .get(DEV, 0)
            .await
            .is_some_and(|o| o.status == OrderStatus::Charging)
    })
    .await;

    harness.gateway.stop_charging(&stop_request(None)).await.unwrap();
    let stop_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    device
        .reply(
            &stop_frame,
            ChargeControlAck {
                port: 0,
                result: 0,
                order_no: "ORDER001".to_owned(),
            }
            .encode()
            .unwrap(),
        )
        .await;

    common::wait_until("order completed", || async {
        harness
            .gateway
            .orders
            .get(DEV, 0)
            .await
            .is_some_and(|o| o.status == OrderStatus::Completed)
    })
    .await;
    assert_eq!(harness.gateway.ports.state(DEV, 0).await, PortState::Idle);

    // The port is free for a new order.
    let outcome = harness.gateway.start_charging(&start_request("ORDER002")).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    harness.shutdown();
}

#[tokio::test]
async fn device_rejection_fails_the_order() {
    let harness = start_gateway(fast_config()).await;
    let mut device = online_device(&harness).await;

    harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    let control_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    device
        .reply(
            &control_frame,
            ChargeControlAck {
                port: 0,
                result: 3,
                order_no: "ORDER001".to_owned(),
            }
            .encode()
            .unwrap(),
        )
        .await;

    common::wait_until("order failed", || async {
        harness
            .gateway
            .orders
            .get(DEV, 0)
            .await
            .is_some_and(|o| o.status == OrderStatus::Failed)
    })
    .await;
    // A failed order no longer blocks the port.
    let outcome = harness.gateway.start_charging(&start_request("ORDER002")).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    harness.shutdown();
}

#[tokio::test]
async fn settlement_finishes_the_session() {
    let harness = start_gateway(fast_config()).await;
    let mut device = online_device(&harness).await;

    harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    let control_frame = device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    device
        .reply(
            &control_frame,
            ChargeControlAck {
                port: 0,
                result: 0,
                order_no: "ORDER001".to_owned(),
            }
            .encode()
            .unwrap(),
        )
        .await;
    common::wait_until("charging", || async {
        harness
            .gateway
            .orders
            .get(DEV, 0)
            .await
            .is_some_and(|o| o.status == OrderStatus::Charging)
    })
    .await;

    device.settle(0, "ORDER001", 1).await;
    common::wait_until("order settled", || async {
        harness
            .gateway
            .orders
            .get(DEV, 0)
            .await
            .is_some_and(|o| o.status == OrderStatus::Completed)
    })
    .await;
    assert_eq!(harness.gateway.ports.state(DEV, 0).await, PortState::Idle);

    let recent = harness.gateway.events.recent(100);
    assert!(recent
        .iter()
        .any(|e| e.event_type == cg_protocol::EventType::Settlement));
    assert!(recent
        .iter()
        .any(|e| e.event_type == cg_protocol::EventType::ChargingEnd));
    harness.shutdown();
}

#[tokio::test]
async fn update_power_requires_an_active_order() {
    let harness = start_gateway(fast_config()).await;
    let _device = online_device(&harness).await;
    let err = harness
        .gateway
        .update_power(&UpdatePowerRequest {
            device_id: "04A228CD".to_owned(),
            port: 1,
            overload_power_w: 500,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::Order(OrderError::NoActiveOrder)));
    harness.shutdown();
}

#[tokio::test]
async fn start_on_offline_device_does_not_strand_the_order() {
    let harness = start_gateway(fast_config()).await;
    // No device connected at all.
    let err = harness
        .gateway
        .start_charging(&start_request("ORDER001"))
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::Send(_)));
    // The failed order does not block a retry once the device connects.
    let mut device = online_device(&harness).await;
    let outcome = harness.gateway.start_charging(&start_request("ORDER001")).await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    device
        .read_frame_with_command(Command::ChargeControl.code(), Duration::from_secs(5))
        .await;
    harness.shutdown();
}
