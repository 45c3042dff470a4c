//! Framed DNY message codec.
//!
//! Wire layout (all multi-byte integers little-endian):
//!
//! ```text
//! offset  bytes  field
//! 0       3      ASCII header "DNY"
//! 3       2      length L (u16), L = 4 + 2 + 1 + |payload| + 2
//! 5       4      physical ID (u32)
//! 9       2      message ID (u16, never 0)
//! 11      1      command (u8)
//! 12      N      payload (N = L - 9)
//! 12+N    2      checksum: 16-bit additive sum over bytes 5 .. 12+N
//! ```

use crate::frame::{DNY_HEADER, MIN_LENGTH_FIELD};
use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};

/// Bytes of fixed overhead inside the length field.
const LENGTH_OVERHEAD: usize = MIN_LENGTH_FIELD as usize;

/// Largest payload the u16 length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - LENGTH_OVERHEAD;

// ---------------------------------------------------------------------------
// Command taxonomy
// ---------------------------------------------------------------------------

/// Routing tags for the command byte.
///
/// The set is not exhaustive; unrouted opcodes survive round trips through
/// [`Command::Other`] so the dispatcher can pass them through unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// 0x01 — legacy heartbeat.
    Heartbeat,
    /// 0x02 — card swipe report.
    SwipeCard,
    /// 0x03 — charge settlement report.
    Settlement,
    /// 0x06 — power telemetry heartbeat.
    PowerHeartbeat,
    /// 0x0A — fault report.
    FaultReport,
    /// 0x11 — main-board heartbeat.
    MainHeartbeat,
    /// 0x20 — device registration.
    Register,
    /// 0x21 — device heartbeat with per-port status.
    DeviceHeartbeat,
    /// 0x22 — device requests server time.
    GetServerTime,
    /// 0x81 — port status query.
    QueryStatus,
    /// 0x82 — charge control (start/stop/parameter update).
    ChargeControl,
    /// 0x8A — modify an in-progress charge.
    ModifyCharge,
    /// 0x96 — locate (beep/blink) request.
    DeviceLocate,
    /// Any opcode without dedicated routing.
    Other(u8),
}

impl Command {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Command::Heartbeat,
            0x02 => Command::SwipeCard,
            0x03 => Command::Settlement,
            0x06 => Command::PowerHeartbeat,
            0x0A => Command::FaultReport,
            0x11 => Command::MainHeartbeat,
            0x20 => Command::Register,
            0x21 => Command::DeviceHeartbeat,
            0x22 => Command::GetServerTime,
            0x81 => Command::QueryStatus,
            0x82 => Command::ChargeControl,
            0x8A => Command::ModifyCharge,
            0x96 => Command::DeviceLocate,
            other => Command::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Command::Heartbeat => 0x01,
            Command::SwipeCard => 0x02,
            Command::Settlement => 0x03,
            Command::PowerHeartbeat => 0x06,
            Command::FaultReport => 0x0A,
            Command::MainHeartbeat => 0x11,
            Command::Register => 0x20,
            Command::DeviceHeartbeat => 0x21,
            Command::GetServerTime => 0x22,
            Command::QueryStatus => 0x81,
            Command::ChargeControl => 0x82,
            Command::ModifyCharge => 0x8A,
            Command::DeviceLocate => 0x96,
            Command::Other(code) => code,
        }
    }

    /// True for inbound commands that answer an outbound request and are
    /// matched against the ack tracker by message ID.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            Command::QueryStatus
                | Command::ChargeControl
                | Command::ModifyCharge
                | Command::DeviceLocate
        )
    }

    /// True for any of the heartbeat-flavored commands.
    pub fn is_heartbeat(self) -> bool {
        matches!(
            self,
            Command::Heartbeat
                | Command::MainHeartbeat
                | Command::DeviceHeartbeat
                | Command::PowerHeartbeat
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Heartbeat => "heartbeat",
            Command::SwipeCard => "swipe-card",
            Command::Settlement => "settlement",
            Command::PowerHeartbeat => "power-heartbeat",
            Command::FaultReport => "fault-report",
            Command::MainHeartbeat => "main-heartbeat",
            Command::Register => "register",
            Command::DeviceHeartbeat => "device-heartbeat",
            Command::GetServerTime => "get-server-time",
            Command::QueryStatus => "query-status",
            Command::ChargeControl => "charge-control",
            Command::ModifyCharge => "modify-charge",
            Command::DeviceLocate => "device-locate",
            Command::Other(code) => return write!(f, "0x{code:02X}"),
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

/// 16-bit additive checksum: unsigned sum of `bytes`, truncated to 16 bits.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

// ---------------------------------------------------------------------------
// DnyMessage
// ---------------------------------------------------------------------------

/// A decoded (or to-be-encoded) framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnyMessage {
    pub physical_id: u32,
    pub message_id: u16,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl DnyMessage {
    /// Encode the canonical frame with correct length and checksum.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);
        let length = (LENGTH_OVERHEAD + self.payload.len()) as u16;
        let mut out = Vec::with_capacity(5 + length as usize);
        out.extend_from_slice(DNY_HEADER);
        out.extend_from_slice(&length.to_le_bytes());
        out.extend_from_slice(&self.physical_id.to_le_bytes());
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.push(self.command);
        out.extend_from_slice(&self.payload);
        let sum = checksum(&out[5..]);
        out.extend_from_slice(&sum.to_le_bytes());
        out
    }

    /// Decode a complete frame (as emitted by the frame scanner).
    ///
    /// Validates header, length consistency, and checksum.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < 5 + LENGTH_OVERHEAD {
            return Err(CodecError::Truncated { len: frame.len() });
        }
        if &frame[..3] != DNY_HEADER {
            return Err(CodecError::BadHeader {
                found: [frame[0], frame[1], frame[2]],
            });
        }
        let length = u16::from_le_bytes([frame[3], frame[4]]);
        if length < MIN_LENGTH_FIELD || frame.len() != 5 + length as usize {
            return Err(CodecError::LengthMismatch {
                declared: length,
                actual: frame.len(),
            });
        }
        let payload_len = length as usize - LENGTH_OVERHEAD;
        let body = &frame[5..frame.len() - 2];
        let declared = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        let computed = checksum(body);
        if declared != computed {
            return Err(CodecError::ChecksumMismatch { declared, computed });
        }
        Ok(DnyMessage {
            physical_id: u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]),
            message_id: u16::from_le_bytes([frame[9], frame[10]]),
            command: frame[11],
            payload: frame[12..12 + payload_len].to_vec(),
        })
    }

    pub fn command_tag(&self) -> Command {
        Command::from_code(self.command)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("frame too short: {len} bytes")]
    Truncated { len: usize },
    #[error("bad header: {found:02X?}")]
    BadHeader { found: [u8; 3] },
    #[error("length field {declared} inconsistent with frame of {actual} bytes")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("checksum mismatch: declared 0x{declared:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { declared: u16, computed: u16 },
    #[error("payload exceeds {MAX_PAYLOAD} bytes")]
    PayloadTooLarge,
}

// ---------------------------------------------------------------------------
// Message-ID allocation
// ---------------------------------------------------------------------------

/// Monotonic message-ID generator; wraps at 2^16 and never yields zero.
///
/// One generator is shared by the dispatcher for the whole process, but the
/// type is a plain instance so tests can create fresh ones.
#[derive(Debug)]
pub struct MessageIdGen {
    next: AtomicU16,
}

impl MessageIdGen {
    pub fn new() -> Self {
        MessageIdGen {
            next: AtomicU16::new(1),
        }
    }

    pub fn next_id(&self) -> u16 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for MessageIdGen {
    fn default() -> Self {
        Self::new()
    }
}
