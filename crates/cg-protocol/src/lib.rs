//! cg-protocol: outward-facing gateway types and serialization.
//!
//! Two surfaces share these types:
//!
//! - the webhook/event-stream plane (the [`Event`] envelope and the
//!   [`EventType`] vocabulary), and
//! - the HTTP control plane (request/response DTOs under this module).
//!
//! The envelope field names are frozen: downstream billing and operation
//! backends deserialize `{event_id, event_type, device_id, port_number,
//! timestamp, data}` as-is.

use chrono::{DateTime, Utc};
use dny_core::DeviceId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// Event-type vocabulary pushed to webhook endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DeviceOnline,
    DeviceOffline,
    DeviceRegister,
    DeviceHeartbeat,
    DeviceError,
    ChargingStart,
    ChargingEnd,
    ChargingFailed,
    ChargingPower,
    PowerHeartbeat,
    Settlement,
    PortStatusChange,
    PortError,
    PortOnline,
    PortOffline,
    PortHeartbeat,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::DeviceOnline => "device_online",
            EventType::DeviceOffline => "device_offline",
            EventType::DeviceRegister => "device_register",
            EventType::DeviceHeartbeat => "device_heartbeat",
            EventType::DeviceError => "device_error",
            EventType::ChargingStart => "charging_start",
            EventType::ChargingEnd => "charging_end",
            EventType::ChargingFailed => "charging_failed",
            EventType::ChargingPower => "charging_power",
            EventType::PowerHeartbeat => "power_heartbeat",
            EventType::Settlement => "settlement",
            EventType::PortStatusChange => "port_status_change",
            EventType::PortError => "port_error",
            EventType::PortOnline => "port_online",
            EventType::PortOffline => "port_offline",
            EventType::PortHeartbeat => "port_heartbeat",
        }
    }

    /// High-volume telemetry types that may be sampled or dropped under
    /// back-pressure. Everything else is lifecycle and is never dropped by
    /// the producer.
    pub fn is_telemetry(self) -> bool {
        matches!(
            self,
            EventType::PowerHeartbeat
                | EventType::ChargingPower
                | EventType::DeviceHeartbeat
                | EventType::PortHeartbeat
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outbound event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_number: Option<u8>,
    pub timestamp: DateTime<Utc>,
    /// Free-form payload; keys depend on `event_type`.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    /// Build an event stamped now with a fresh process-unique ID.
    pub fn new(event_type: EventType, device_id: DeviceId) -> Self {
        Event {
            event_id: Uuid::new_v4(),
            event_type,
            device_id,
            port_number: None,
            timestamp: Utc::now(),
            data: Map::new(),
        }
    }

    pub fn with_port(mut self, port: u8) -> Self {
        self.port_number = Some(port);
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_owned(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Control-plane DTOs
// ---------------------------------------------------------------------------

/// Charging mode requested by the business system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    /// `value` is a duration in seconds.
    Time,
    /// `value` is energy in 0.1 kWh units.
    Energy,
}

/// `POST /api/v1/charging/start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartChargingRequest {
    pub device_id: String,
    /// 1-based port number as exposed to business systems.
    pub port: u8,
    /// ASCII, at most 16 characters.
    pub order_no: String,
    pub mode: ChargeMode,
    pub value: u16,
    /// Account balance forwarded to the device, in 0.01 currency units.
    pub balance: u32,
    /// Overload power ceiling in watts; 0 leaves the device default.
    #[serde(default)]
    pub overload_power_w: u16,
}

/// `POST /api/v1/charging/stop`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopChargingRequest {
    pub device_id: String,
    pub port: u8,
    /// Optional; when present it must match the active order.
    #[serde(default)]
    pub order_no: Option<String>,
}

/// `POST /api/v1/charging/update_power`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePowerRequest {
    pub device_id: String,
    pub port: u8,
    pub overload_power_w: u16,
}

/// `POST /api/v1/device/locate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateRequest {
    pub device_id: String,
    /// Beep/blink duration in seconds, 1–255.
    pub duration_s: u8,
}

/// Device status as exposed by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Offline,
    Registered,
    Online,
}

/// One row of `GET /api/v1/devices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub iccid: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
}

/// `GET /api/v1/devices` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceSummary>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Per-port slice of `GET /api/v1/device/{id}/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDetail {
    /// 1-based.
    pub port: u8,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
}

/// `GET /api/v1/device/{id}/status` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetailResponse {
    pub device_id: DeviceId,
    pub iccid: String,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub heartbeat_count: u64,
    pub command_count: u64,
    /// Opaque firmware metadata from registration, hex-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    pub ports: Vec<PortDetail>,
}

/// Generic error body returned by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Accepted-command response for dispatch endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAccepted {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_no: Option<String>,
}
