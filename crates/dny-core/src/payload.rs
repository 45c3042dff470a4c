//! Typed payload layouts for the routed commands.
//!
//! Each payload type carries `encode`/`parse` pairs so the gateway and the
//! device emulators used in tests share one definition. All multi-byte
//! integers are little-endian; order numbers are ASCII, NUL-padded to 16
//! bytes on the wire.

use std::fmt;

/// On-wire width of an order number.
pub const ORDER_NO_WIRE_LEN: usize = 16;

/// Fixed width of the charge-control payload.
pub const CHARGE_CONTROL_LEN: usize = 37;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("{what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },
    #[error("order number {0:?} is not ASCII or exceeds 16 characters")]
    BadOrderNo(String),
    #[error("locate duration must be 1-255 seconds")]
    BadLocateDuration,
}

// ---------------------------------------------------------------------------
// Order-number wire form
// ---------------------------------------------------------------------------

/// Encode an order number into its fixed 16-byte NUL-padded form.
pub fn order_no_to_wire(order_no: &str) -> Result<[u8; ORDER_NO_WIRE_LEN], PayloadError> {
    if !order_no.is_ascii() || order_no.len() > ORDER_NO_WIRE_LEN {
        return Err(PayloadError::BadOrderNo(order_no.to_owned()));
    }
    let mut wire = [0u8; ORDER_NO_WIRE_LEN];
    wire[..order_no.len()].copy_from_slice(order_no.as_bytes());
    Ok(wire)
}

/// Decode a 16-byte wire order number, trimming NUL padding.
pub fn order_no_from_wire(wire: &[u8]) -> String {
    let end = wire.iter().position(|b| *b == 0).unwrap_or(wire.len());
    wire[..end].iter().map(|b| *b as char).collect()
}

// ---------------------------------------------------------------------------
// 0x82 charge-control (server -> device), 37 bytes
// ---------------------------------------------------------------------------

/// Rate mode byte of the charge-control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RateMode {
    Time = 0,
    Monthly = 1,
    Energy = 2,
    Count = 3,
}

impl RateMode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => RateMode::Monthly,
            2 => RateMode::Energy,
            3 => RateMode::Count,
            _ => RateMode::Time,
        }
    }
}

/// The 37-byte 0x82 payload. Start, stop, and overload-power updates all
/// use this layout; stop sets `action = 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeControl {
    pub rate_mode: RateMode,
    /// Account balance in 0.01 currency units.
    pub balance: u32,
    /// 0-based on the wire; the external API is 1-based.
    pub port: u8,
    /// 1 = start, 0 = stop.
    pub action: u8,
    /// Seconds or 0.1 kWh units depending on `rate_mode`.
    pub value: u16,
    pub order_no: String,
    /// 0 leaves the device default.
    pub max_duration: u16,
    /// Watts; 0 = do not set.
    pub overload_power_w: u16,
    pub qr_light: u8,
    pub long_charge_mode: u8,
    pub float_extra_time: u16,
    /// 2 = normal detection.
    pub skip_short_detect: u8,
    pub ignore_user_unplug: u8,
    pub force_full_auto_stop: u8,
    pub full_power: u8,
}

impl ChargeControl {
    /// A payload with every optional device knob left at its default.
    pub fn new(rate_mode: RateMode, balance: u32, port: u8, action: u8, value: u16, order_no: &str) -> Self {
        ChargeControl {
            rate_mode,
            balance,
            port,
            action,
            value,
            order_no: order_no.to_owned(),
            max_duration: 0,
            overload_power_w: 0,
            qr_light: 0,
            long_charge_mode: 0,
            float_extra_time: 0,
            skip_short_detect: 2,
            ignore_user_unplug: 0,
            force_full_auto_stop: 0,
            full_power: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let order = order_no_to_wire(&self.order_no)?;
        let mut out = Vec::with_capacity(CHARGE_CONTROL_LEN);
        out.push(self.rate_mode as u8);
        out.extend_from_slice(&self.balance.to_le_bytes());
        out.push(self.port);
        out.push(self.action);
        out.extend_from_slice(&self.value.to_le_bytes());
        out.extend_from_slice(&order);
        out.extend_from_slice(&self.max_duration.to_le_bytes());
        out.extend_from_slice(&self.overload_power_w.to_le_bytes());
        out.push(self.qr_light);
        out.push(self.long_charge_mode);
        out.extend_from_slice(&self.float_extra_time.to_le_bytes());
        out.push(self.skip_short_detect);
        out.push(self.ignore_user_unplug);
        out.push(self.force_full_auto_stop);
        out.push(self.full_power);
        debug_assert_eq!(out.len(), CHARGE_CONTROL_LEN);
        Ok(out)
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < CHARGE_CONTROL_LEN {
            return Err(PayloadError::Truncated {
                what: "charge-control",
                need: CHARGE_CONTROL_LEN,
                have: payload.len(),
            });
        }
        Ok(ChargeControl {
            rate_mode: RateMode::from_byte(payload[0]),
            balance: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
            port: payload[5],
            action: payload[6],
            value: u16::from_le_bytes([payload[7], payload[8]]),
            order_no: order_no_from_wire(&payload[9..25]),
            max_duration: u16::from_le_bytes([payload[25], payload[26]]),
            overload_power_w: u16::from_le_bytes([payload[27], payload[28]]),
            qr_light: payload[29],
            long_charge_mode: payload[30],
            float_extra_time: u16::from_le_bytes([payload[31], payload[32]]),
            skip_short_detect: payload[33],
            ignore_user_unplug: payload[34],
            force_full_auto_stop: payload[35],
            full_power: payload[36],
        })
    }
}

/// Device acknowledgement of a 0x82 command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeControlAck {
    pub port: u8,
    /// 0 = accepted, anything else is a device error code.
    pub result: u8,
    pub order_no: String,
}

impl ChargeControlAck {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let order = order_no_to_wire(&self.order_no)?;
        let mut out = Vec::with_capacity(2 + ORDER_NO_WIRE_LEN);
        out.push(self.port);
        out.push(self.result);
        out.extend_from_slice(&order);
        Ok(out)
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 2 + ORDER_NO_WIRE_LEN {
            return Err(PayloadError::Truncated {
                what: "charge-control ack",
                need: 2 + ORDER_NO_WIRE_LEN,
                have: payload.len(),
            });
        }
        Ok(ChargeControlAck {
            port: payload[0],
            result: payload[1],
            order_no: order_no_from_wire(&payload[2..18]),
        })
    }
}

// ---------------------------------------------------------------------------
// 0x21 / 0x01 device heartbeat
// ---------------------------------------------------------------------------

/// Device heartbeat: supply voltage, one status byte per port, then
/// temperature and signal strength.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHeartbeat {
    /// 0.1 V units.
    pub voltage_dv: u16,
    pub port_statuses: Vec<u8>,
    pub temperature: u8,
    pub signal: u8,
}

impl DeviceHeartbeat {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.port_statuses.len());
        out.extend_from_slice(&self.voltage_dv.to_le_bytes());
        out.push(self.port_statuses.len() as u8);
        out.extend_from_slice(&self.port_statuses);
        out.push(self.temperature);
        out.push(self.signal);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 3 {
            return Err(PayloadError::Truncated {
                what: "device heartbeat",
                need: 3,
                have: payload.len(),
            });
        }
        let port_count = payload[2] as usize;
        let need = 3 + port_count + 2;
        if payload.len() < need {
            return Err(PayloadError::Truncated {
                what: "device heartbeat",
                need,
                have: payload.len(),
            });
        }
        Ok(DeviceHeartbeat {
            voltage_dv: u16::from_le_bytes([payload[0], payload[1]]),
            port_statuses: payload[3..3 + port_count].to_vec(),
            temperature: payload[3 + port_count],
            signal: payload[4 + port_count],
        })
    }
}

// ---------------------------------------------------------------------------
// 0x06 power heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerHeartbeat {
    /// 0-based.
    pub port: u8,
    /// Same status-code space as the heartbeat port status byte.
    pub status: u8,
    /// Instantaneous draw in watts.
    pub power_w: u16,
    /// Cumulative session energy, 0.01 kWh units.
    pub energy: u32,
    pub order_no: String,
}

impl PowerHeartbeat {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let order = order_no_to_wire(&self.order_no)?;
        let mut out = Vec::with_capacity(8 + ORDER_NO_WIRE_LEN);
        out.push(self.port);
        out.push(self.status);
        out.extend_from_slice(&self.power_w.to_le_bytes());
        out.extend_from_slice(&self.energy.to_le_bytes());
        out.extend_from_slice(&order);
        Ok(out)
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        let need = 8 + ORDER_NO_WIRE_LEN;
        if payload.len() < need {
            return Err(PayloadError::Truncated {
                what: "power heartbeat",
                need,
                have: payload.len(),
            });
        }
        Ok(PowerHeartbeat {
            port: payload[0],
            status: payload[1],
            power_w: u16::from_le_bytes([payload[2], payload[3]]),
            energy: u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            order_no: order_no_from_wire(&payload[8..24]),
        })
    }
}

// ---------------------------------------------------------------------------
// 0x03 settlement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    /// 0-based.
    pub port: u8,
    pub order_no: String,
    /// 0.01 kWh units.
    pub energy: u32,
    pub seconds: u32,
    pub stop_reason: u8,
}

impl Settlement {
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let order = order_no_to_wire(&self.order_no)?;
        let mut out = Vec::with_capacity(10 + ORDER_NO_WIRE_LEN);
        out.push(self.port);
        out.extend_from_slice(&order);
        out.extend_from_slice(&self.energy.to_le_bytes());
        out.extend_from_slice(&self.seconds.to_le_bytes());
        out.push(self.stop_reason);
        Ok(out)
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        let need = 10 + ORDER_NO_WIRE_LEN;
        if payload.len() < need {
            return Err(PayloadError::Truncated {
                what: "settlement",
                need,
                have: payload.len(),
            });
        }
        Ok(Settlement {
            port: payload[0],
            order_no: order_no_from_wire(&payload[1..17]),
            energy: u32::from_le_bytes([payload[17], payload[18], payload[19], payload[20]]),
            seconds: u32::from_le_bytes([payload[21], payload[22], payload[23], payload[24]]),
            stop_reason: payload[25],
        })
    }
}

// ---------------------------------------------------------------------------
// Small fixed payloads
// ---------------------------------------------------------------------------

/// 0x02 swipe-card report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwipeCard {
    pub card_no: u32,
    /// 0-based.
    pub port: u8,
}

impl SwipeCard {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.card_no.to_le_bytes().to_vec();
        out.push(self.port);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 5 {
            return Err(PayloadError::Truncated {
                what: "swipe-card",
                need: 5,
                have: payload.len(),
            });
        }
        Ok(SwipeCard {
            card_no: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            port: payload[4],
        })
    }
}

/// 0x0A fault report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    /// 0-based.
    pub port: u8,
    pub fault_code: u8,
}

impl FaultReport {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.port, self.fault_code]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 2 {
            return Err(PayloadError::Truncated {
                what: "fault report",
                need: 2,
                have: payload.len(),
            });
        }
        Ok(FaultReport {
            port: payload[0],
            fault_code: payload[1],
        })
    }
}

/// Server-time payload used by the register ack and the 0x22 reply.
pub fn encode_server_time(unix_seconds: u32) -> Vec<u8> {
    unix_seconds.to_le_bytes().to_vec()
}

pub fn parse_server_time(payload: &[u8]) -> Result<u32, PayloadError> {
    if payload.len() < 4 {
        return Err(PayloadError::Truncated {
            what: "server time",
            need: 4,
            have: payload.len(),
        });
    }
    Ok(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

/// 0x96 locate payload; duration is clamped to the protocol's 1–255 range
/// by validation, not silently.
pub fn encode_locate(duration_s: u8) -> Result<Vec<u8>, PayloadError> {
    if duration_s == 0 {
        return Err(PayloadError::BadLocateDuration);
    }
    Ok(vec![duration_s])
}

/// 0x81 query-status reply: one status byte per port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatusReply {
    pub port_statuses: Vec<u8>,
}

impl QueryStatusReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.port_statuses.len());
        out.push(self.port_statuses.len() as u8);
        out.extend_from_slice(&self.port_statuses);
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.is_empty() {
            return Err(PayloadError::Truncated {
                what: "query-status reply",
                need: 1,
                have: 0,
            });
        }
        let count = payload[0] as usize;
        if payload.len() < 1 + count {
            return Err(PayloadError::Truncated {
                what: "query-status reply",
                need: 1 + count,
                have: payload.len(),
            });
        }
        Ok(QueryStatusReply {
            port_statuses: payload[1..1 + count].to_vec(),
        })
    }
}

impl fmt::Display for ChargeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "port {} action {} order {:?} value {} overload {}W",
            self.port, self.action, self.order_no, self.value, self.overload_power_w
        )
    }
}
