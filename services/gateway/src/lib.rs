//! gateway: TCP gateway for DNY charging-pile devices.
//!
//! Terminates long-lived device connections, keeps authoritative
//! in-memory device/order/port state, exposes an HTTP control plane, and
//! pushes lifecycle/telemetry events to webhook endpoints. State is
//! reconstructed from the devices themselves; nothing persists across a
//! restart.

pub mod acks;
pub mod codec;
pub mod config;
pub mod control_api;
pub mod dispatcher;
pub mod events;
pub mod gateway;
pub mod net;
pub mod orders;
pub mod ports;
pub mod power;
pub mod registry;
pub mod session;
pub mod sinks;
pub mod sse;
pub mod supervisor;
pub mod writer;

pub use config::{load_config, load_config_from_path, load_config_from_str, GatewayConfig};
pub use gateway::{Gateway, OpError, StartOutcome};
