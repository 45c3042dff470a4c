//! dny-core: DNY charging-pile wire protocol.
//!
//! Pure parsing and encoding for the byte stream spoken by charging-pile
//! devices. A single TCP connection interleaves three on-wire shapes:
//!
//! 1. Framed `DNY` messages (header, length, physical-ID, message-ID,
//!    command, payload, checksum)
//! 2. The 4-byte `"link"` keep-alive literal
//! 3. A bare 20-character SIM identifier (ICCID)
//!
//! This crate contains no I/O. The gateway service wraps [`frame::scan`]
//! in a `tokio_util` decoder; everything here is testable with plain byte
//! slices.

pub mod device_id;
pub mod frame;
pub mod message;
pub mod payload;

pub use device_id::{BadDeviceId, DeviceId};
pub use frame::{Frame, Scan};
pub use message::{checksum, Command, CodecError, DnyMessage, MessageIdGen};
pub use payload::PayloadError;
