//! Outbound command pipeline.
//!
//! A single dispatcher owns message-id allocation and per-device pacing.
//! Every outbound command flows through [`CommandDispatcher::send`]:
//! connection lookup, pacing, encode, self-validation, ack registration,
//! serialized write, command accounting. Domain wrappers build the typed
//! payloads for charge control and locate.

use crate::acks::{AckClass, AckTracker};
use crate::orders::Order;
use crate::registry::DeviceRegistry;
use crate::writer::WriteError;
use cg_protocol::ChargeMode;
use dny_core::payload::{encode_locate, ChargeControl, RateMode};
use dny_core::{CodecError, Command, DeviceId, DnyMessage, MessageIdGen, PayloadError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("device is not online")]
    NotOnline,
    #[error("payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("write: {0}")]
    Write(#[from] WriteError),
}

pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    acks: Arc<AckTracker>,
    ids: MessageIdGen,
    /// Next allowed send instant per device.
    pacing: Mutex<HashMap<DeviceId, Instant>>,
    min_send_interval: Duration,
    charge_control_retries: u32,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        acks: Arc<AckTracker>,
        min_send_interval: Duration,
        charge_control_retries: u32,
    ) -> Self {
        CommandDispatcher {
            registry,
            acks,
            ids: MessageIdGen::new(),
            pacing: Mutex::new(HashMap::new()),
            min_send_interval,
            charge_control_retries,
        }
    }

    /// Send one command to a device. Returns the allocated message id.
    pub async fn send(
        &self,
        device_id: DeviceId,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<u16, SendError> {
        let conn = self
            .registry
            .connection_by_device(device_id)
            .await
            .ok_or(SendError::NotOnline)?;

        // Protocol pacing: reserve the next slot for this device, FIFO.
        let slot = {
            let mut pacing = self.pacing.lock().await;
            let now = Instant::now();
            let slot = pacing.get(&device_id).copied().unwrap_or(now).max(now);
            pacing.insert(device_id, slot + self.min_send_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;

        let message_id = self.ids.next_id();
        let message = DnyMessage {
            physical_id: device_id.physical(),
            message_id,
            command,
            payload,
        };
        let frame = message.encode();
        // The codec validates its own output before it touches the wire.
        DnyMessage::decode(&frame)?;

        let tag = Command::from_code(command);
        let tracked = tag.is_reply();
        if tracked {
            self.acks
                .register(
                    conn.conn_id,
                    device_id,
                    message_id,
                    command,
                    frame.clone(),
                    conn.writer.clone(),
                    Self::classify(tag),
                    self.retries_for(tag),
                )
                .await;
        }

        if let Err(e) = conn.writer.write(&frame).await {
            // The command never reached the wire; forget the pending entry.
            if tracked {
                self.acks.complete(conn.conn_id, message_id).await;
            }
            return Err(SendError::Write(e));
        }

        self.registry.record_command(device_id).await;
        debug!(device_id = %device_id, command = %tag, message_id, bytes = frame.len(),
               "command sent");
        Ok(message_id)
    }

    fn classify(tag: Command) -> AckClass {
        match tag {
            Command::Register => AckClass::Register,
            Command::Heartbeat | Command::MainHeartbeat | Command::DeviceHeartbeat => {
                AckClass::HeartbeatAck
            }
            Command::ChargeControl | Command::ModifyCharge | Command::QueryStatus => AckClass::Data,
            _ => AckClass::Default,
        }
    }

    fn retries_for(&self, tag: Command) -> u32 {
        match tag {
            Command::ChargeControl => self.charge_control_retries,
            _ => 0,
        }
    }

    // -----------------------------------------------------------------------
    // Domain wrappers
    // -----------------------------------------------------------------------

    fn rate_mode(mode: ChargeMode) -> RateMode {
        match mode {
            ChargeMode::Time => RateMode::Time,
            ChargeMode::Energy => RateMode::Energy,
        }
    }

    /// Issue a charge-start (0x82, action 1).
    pub async fn send_charge_start(
        &self,
        device_id: DeviceId,
        port: u8,
        mode: ChargeMode,
        value: u16,
        balance: u32,
        order_no: &str,
        overload_power_w: u16,
    ) -> Result<u16, SendError> {
        let mut control = ChargeControl::new(Self::rate_mode(mode), balance, port, 1, value, order_no);
        control.overload_power_w = overload_power_w;
        self.send(device_id, Command::ChargeControl.code(), control.encode()?)
            .await
    }

    /// Issue a charge-stop (0x82, action 0) carrying the active order's
    /// actual number and parameters.
    pub async fn send_charge_stop(&self, order: &Order) -> Result<u16, SendError> {
        let control = ChargeControl::new(
            Self::rate_mode(order.mode),
            order.balance,
            order.port,
            0,
            order.value,
            &order.order_no,
        );
        self.send(
            order.device_id,
            Command::ChargeControl.code(),
            control.encode()?,
        )
        .await
    }

    /// Issue an overload-power update (0x82, action 1) preserving the
    /// active order's fields.
    pub async fn send_overload_update(
        &self,
        order: &Order,
        overload_power_w: u16,
    ) -> Result<u16, SendError> {
        let mut control = ChargeControl::new(
            Self::rate_mode(order.mode),
            order.balance,
            order.port,
            1,
            order.value,
            &order.order_no,
        );
        control.overload_power_w = overload_power_w;
        self.send(
            order.device_id,
            Command::ChargeControl.code(),
            control.encode()?,
        )
        .await
    }

    /// Issue a locate (0x96): beep/blink for `duration_s` seconds.
    pub async fn send_locate(&self, device_id: DeviceId, duration_s: u8) -> Result<u16, SendError> {
        let payload = encode_locate(duration_s)?;
        self.send(device_id, Command::DeviceLocate.code(), payload)
            .await
    }
}
