//! Component wiring and charging orchestration.
//!
//! A [`Gateway`] instance owns every core component; nothing is a process
//! global, so tests build fresh gateways freely. The methods here are the
//! seams the HTTP layer and the connection sessions call into: start/stop
//! charging, power updates, locate, and the business reactions to device
//! replies, settlements, and power telemetry.

use crate::acks::AckTracker;
use crate::config::GatewayConfig;
use crate::dispatcher::{CommandDispatcher, SendError};
use crate::events::EventRecorder;
use crate::orders::{CreateOutcome, OrderError, OrderManager, OrderStatus};
use crate::ports::{PortStateManager, TransitionReason};
use crate::power::{PowerAdjustment, PowerController};
use crate::registry::DeviceRegistry;
use cg_protocol::{
    Event, EventType, LocateRequest, StartChargingRequest, StopChargingRequest,
    UpdatePowerRequest,
};
use dny_core::payload::{ChargeControl, ChargeControlAck, PowerHeartbeat, Settlement};
use dny_core::{BadDeviceId, DeviceId};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error(transparent)]
    BadDeviceId(#[from] BadDeviceId),
    #[error("port numbers are 1-based")]
    BadPort,
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A charge-start command was dispatched.
    Started,
    /// The same order was already active; nothing was sent.
    AlreadyActive,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

pub struct Gateway {
    pub config: GatewayConfig,
    pub events: Arc<EventRecorder>,
    pub registry: Arc<DeviceRegistry>,
    pub acks: Arc<AckTracker>,
    pub dispatcher: CommandDispatcher,
    pub orders: OrderManager,
    pub ports: PortStateManager,
    pub power: PowerController,
    pub protocol_errors: AtomicU64,
}

impl Gateway {
    /// Build a gateway and hand back the sink-queue receiver for the sink
    /// dispatcher.
    pub fn new(config: GatewayConfig) -> (Arc<Self>, mpsc::Receiver<cg_protocol::Event>) {
        let (events, sink_rx) = EventRecorder::new(&config.events);
        let events = Arc::new(events);
        let registry = Arc::new(DeviceRegistry::new(events.clone()));
        let acks = Arc::new(AckTracker::new(events.clone()));
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            acks.clone(),
            config.device.min_send_interval,
            config.device.charge_control_retries,
        );
        let orders = OrderManager::new(events.clone());
        let ports = PortStateManager::new(events.clone());
        let power = PowerController::new(config.power.clone());
        (
            Arc::new(Gateway {
                config,
                events,
                registry,
                acks,
                dispatcher,
                orders,
                ports,
                power,
                protocol_errors: AtomicU64::new(0),
            }),
            sink_rx,
        )
    }

    fn parse_target(device_id: &str, port: u8) -> Result<(DeviceId, u8), OpError> {
        let device_id = DeviceId::parse(device_id)?;
        let port = port.checked_sub(1).ok_or(OpError::BadPort)?;
        Ok((device_id, port))
    }

    // -----------------------------------------------------------------------
    // Control-plane operations
    // -----------------------------------------------------------------------

    /// Start charging. Idempotent on order number; conflicting active
    /// orders are refused before anything touches the wire.
    pub async fn start_charging(&self, req: &StartChargingRequest) -> Result<StartOutcome, OpError> {
        let (device_id, port) = Self::parse_target(&req.device_id, req.port)?;
        match self
            .orders
            .create_order(device_id, port, &req.order_no, req.mode, req.value, req.balance)
            .await?
        {
            CreateOutcome::AlreadyActive => Ok(StartOutcome::AlreadyActive),
            CreateOutcome::Created => {
                let sent = self
                    .dispatcher
                    .send_charge_start(
                        device_id,
                        port,
                        req.mode,
                        req.value,
                        req.balance,
                        &req.order_no,
                        req.overload_power_w,
                    )
                    .await;
                if let Err(e) = sent {
                    self.orders
                        .update_status(device_id, port, OrderStatus::Failed, Some("dispatch failed"))
                        .await;
                    self.events
                        .record(
                            Event::new(EventType::ChargingFailed, device_id)
                                .with_port(port + 1)
                                .with_data("order_no", req.order_no.clone())
                                .with_data("reason", "dispatch-failed"),
                        )
                        .await;
                    return Err(e.into());
                }
                Ok(StartOutcome::Started)
            }
        }
    }

    /// Stop charging. A stop with no active order at all is an idempotent
    /// success (observed as already stopped); a wrong order number is a
    /// mismatch error.
    pub async fn stop_charging(&self, req: &StopChargingRequest) -> Result<(), OpError> {
        let (device_id, port) = Self::parse_target(&req.device_id, req.port)?;
        let order = match self
            .orders
            .validate_for_stop(device_id, port, req.order_no.as_deref())
            .await
        {
            Ok(order) => order,
            Err(OrderError::NoActiveOrder) => {
                debug!(device_id = %device_id, port, "stop with no active order, treating as stopped");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.dispatcher.send_charge_stop(&order).await?;
        Ok(())
    }

    /// Push a new overload-power ceiling for the active order.
    pub async fn update_power(&self, req: &UpdatePowerRequest) -> Result<(), OpError> {
        let (device_id, port) = Self::parse_target(&req.device_id, req.port)?;
        let order = self
            .orders
            .get(device_id, port)
            .await
            .filter(|o| o.status.is_active())
            .ok_or(OrderError::NoActiveOrder)?;
        self.dispatcher
            .send_overload_update(&order, req.overload_power_w)
            .await?;
        Ok(())
    }

    /// Make the device beep/blink.
    pub async fn locate(&self, req: &LocateRequest) -> Result<(), OpError> {
        let device_id = DeviceId::parse(&req.device_id)?;
        self.dispatcher.send_locate(device_id, req.duration_s).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound business reactions (called by sessions)
    // -----------------------------------------------------------------------

    /// React to a device acknowledging a charge-control command. `sent` is
    /// the payload this gateway originally issued for the matched message
    /// id; `ack` is the device's reply.
    pub async fn handle_charge_ack(&self, device_id: DeviceId, sent: &ChargeControl, ack: &ChargeControlAck) {
        let port = sent.port;
        if ack.result != 0 {
            warn!(device_id = %device_id, port, result = ack.result, "charge command rejected");
            if sent.action == 1 {
                if let Some(order) = self.orders.get(device_id, port).await {
                    if order.order_no == sent.order_no && order.status == OrderStatus::Pending {
                        self.orders
                            .update_status(
                                device_id,
                                port,
                                OrderStatus::Failed,
                                Some(&format!("device error {}", ack.result)),
                            )
                            .await;
                        self.ports
                            .finalize_session(device_id, port, TransitionReason::DeviceResponse)
                            .await;
                        self.events
                            .record(
                                Event::new(EventType::ChargingFailed, device_id)
                                    .with_port(port + 1)
                                    .with_data("order_no", sent.order_no.clone())
                                    .with_data("device_result", ack.result),
                            )
                            .await;
                        return;
                    }
                }
            }
            self.events
                .record(
                    Event::new(EventType::DeviceError, device_id)
                        .with_port(port + 1)
                        .with_data("error", "charge-command-rejected")
                        .with_data("device_result", ack.result),
                )
                .await;
            return;
        }

        if sent.action == 0 {
            // Stop accepted: close the session out.
            self.orders
                .update_status(device_id, port, OrderStatus::Completed, Some("user stop"))
                .await;
            self.ports
                .finalize_session(device_id, port, TransitionReason::UserRequest)
                .await;
            self.power.end_session(device_id, port).await;
            self.events
                .record(
                    Event::new(EventType::ChargingEnd, device_id)
                        .with_port(port + 1)
                        .with_data("order_no", sent.order_no.clone())
                        .with_data("reason", "user-stop"),
                )
                .await;
            return;
        }

        // Start (or overload update) accepted.
        let Some(order) = self.orders.get(device_id, port).await else {
            return;
        };
        if order.order_no != sent.order_no {
            return;
        }
        if order.status == OrderStatus::Pending {
            self.orders
                .update_status(device_id, port, OrderStatus::Charging, None)
                .await;
            if let Err(e) = self
                .ports
                .begin_session(device_id, port, &sent.order_no, TransitionReason::DeviceResponse)
                .await
            {
                warn!(device_id = %device_id, port, error = %e, "port refused charging state");
            }
            self.power
                .start_session(device_id, port, &sent.order_no)
                .await;
            info!(device_id = %device_id, port, order_no = %sent.order_no, "charging started");
            self.events
                .record(
                    Event::new(EventType::ChargingStart, device_id)
                        .with_port(port + 1)
                        .with_data("order_no", sent.order_no.clone())
                        .with_data("mode", format!("{:?}", order.mode).to_lowercase())
                        .with_data("value", order.value),
                )
                .await;
        }
    }

    /// React to a power-telemetry heartbeat.
    pub async fn handle_power_heartbeat(self: &Arc<Self>, device_id: DeviceId, telemetry: &PowerHeartbeat) {
        self.ports
            .on_status_code(device_id, telemetry.port, telemetry.status)
            .await;
        self.events
            .record(
                Event::new(EventType::PowerHeartbeat, device_id)
                    .with_port(telemetry.port + 1)
                    .with_data("power_w", telemetry.power_w)
                    .with_data("energy", telemetry.energy)
                    .with_data("order_no", telemetry.order_no.clone()),
            )
            .await;

        let charging = telemetry.status == 1;
        let adjustment = self
            .power
            .observe(
                device_id,
                telemetry.port,
                charging,
                telemetry.power_w,
                &telemetry.order_no,
            )
            .await;
        if let Some(adjustment) = adjustment {
            self.actuate_power(adjustment).await;
        }
    }

    /// Send one overload-power update, preserving the active order's
    /// fields. Returns false when nothing was sent.
    async fn send_power_update(&self, adjustment: &PowerAdjustment) -> bool {
        let Some(order) = self
            .orders
            .get(adjustment.device_id, adjustment.port)
            .await
            .filter(|o| o.status.is_active())
        else {
            debug!(device_id = %adjustment.device_id, port = adjustment.port,
                   "no active order for power adjustment, skipping");
            return false;
        };
        match self
            .dispatcher
            .send_overload_update(&order, adjustment.target_w)
            .await
        {
            Ok(_) => {
                info!(device_id = %adjustment.device_id, port = adjustment.port,
                      target_w = adjustment.target_w, reissue = adjustment.reissue,
                      "overload power adjusted");
                self.events
                    .record(
                        Event::new(EventType::ChargingPower, adjustment.device_id)
                            .with_port(adjustment.port + 1)
                            .with_data("target_w", adjustment.target_w)
                            .with_data("order_no", order.order_no.clone())
                            .with_data("reissue", adjustment.reissue),
                    )
                    .await;
                true
            }
            Err(e) => {
                warn!(device_id = %adjustment.device_id, error = %e,
                      "overload power update failed");
                false
            }
        }
    }

    /// Actuate an adjustment and schedule the one-shot post-grace
    /// reconciliation that re-issues the update if the device ignored it.
    async fn actuate_power(self: &Arc<Self>, adjustment: PowerAdjustment) {
        if !self.send_power_update(&adjustment).await {
            return;
        }
        let grace = self.power.reconcile_grace();
        let gateway = self.clone();
        let device_id = adjustment.device_id;
        let port = adjustment.port;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(reissue) = gateway.power.reconcile(device_id, port).await {
                gateway.send_power_update(&reissue).await;
            }
        });
    }

    /// React to a settlement report: finish the order, idle the port, stop
    /// the power loop, emit settlement + charging-end events.
    pub async fn handle_settlement(&self, device_id: DeviceId, settlement: &Settlement) {
        let port = settlement.port;
        self.orders
            .update_status(
                device_id,
                port,
                OrderStatus::Completed,
                Some(&format!("settlement reason {}", settlement.stop_reason)),
            )
            .await;
        self.ports
            .finalize_session(device_id, port, TransitionReason::Settlement)
            .await;
        self.power.end_session(device_id, port).await;
        info!(device_id = %device_id, port, order_no = %settlement.order_no,
              energy = settlement.energy, seconds = settlement.seconds, "settlement");
        self.events
            .record(
                Event::new(EventType::Settlement, device_id)
                    .with_port(port + 1)
                    .with_data("order_no", settlement.order_no.clone())
                    .with_data("energy", settlement.energy)
                    .with_data("seconds", settlement.seconds)
                    .with_data("stop_reason", settlement.stop_reason),
            )
            .await;
        self.events
            .record(
                Event::new(EventType::ChargingEnd, device_id)
                    .with_port(port + 1)
                    .with_data("order_no", settlement.order_no.clone())
                    .with_data("reason", "settlement"),
            )
            .await;
    }
}
