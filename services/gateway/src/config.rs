//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/charge-gateway/gateway.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else carries a default, so a minimal config is one line.
//! Webhook endpoints are configured as `[[endpoints]]` entries; an entry
//! with no `event_types` list subscribes to every event type.

use cg_protocol::EventType;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub tcp: TcpConfig,
    pub http: HttpConfig,
    pub device: DeviceConfig,
    pub power: PowerConfig,
    pub orders: OrderConfig,
    pub events: EventConfig,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub bind: String,
    /// Deadline for the first ICCID or registration frame.
    pub initial_read_timeout: Duration,
    /// Steady-state read deadline, refreshed on any inbound bytes.
    pub steady_read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    /// TTL of the (device, order-no) duplicate-submission guard.
    pub idempotency_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Last-heartbeat age after which a device is marked offline.
    pub offline_threshold: Duration,
    /// Age at which a one-shot pre-offline warning is emitted.
    pub warning_threshold: Duration,
    pub sweep_interval: Duration,
    /// How long an offline device entry survives before garbage collection.
    pub grace_window: Duration,
    /// Minimum spacing between outbound commands to one device.
    pub min_send_interval: Duration,
    /// Re-issues of a charge-control command after an ack timeout.
    pub charge_control_retries: u32,
}

#[derive(Debug, Clone)]
pub struct PowerConfig {
    /// Window after charging starts during which no adjustment is made.
    pub peak_hold: Duration,
    /// Minimum spacing between successive adjustments.
    pub step_interval: Duration,
    /// Percent reduction per step.
    pub step_percent: u16,
    /// Floor for the computed target.
    pub min_power_w: u16,
    /// Adjustments smaller than this are suppressed.
    pub change_threshold_w: u16,
    /// Observed-above-target margin that triggers the single re-issue.
    pub reconcile_margin_w: u16,
}

#[derive(Debug, Clone)]
pub struct OrderConfig {
    pub gc_interval: Duration,
    /// Finished orders older than this are removed.
    pub finished_retention: Duration,
    /// Pending orders with no update for this long are cancelled.
    pub pending_timeout: Duration,
    /// Charging orders older than this are force-closed with a warning.
    pub charging_max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Recent-events ring capacity.
    pub ring_capacity: usize,
    /// Primary sink queue capacity.
    pub queue_capacity: usize,
    /// Concurrent webhook deliveries.
    pub workers: usize,
    /// Coalescing window for port-status-change events.
    pub debounce: Duration,
    /// 1-in-N sampling of power-heartbeat events (1 = keep all).
    pub power_sample_rate: u32,
    /// Per-subscriber live stream buffer.
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub enabled: bool,
    /// Empty means "all event types".
    pub event_types: Vec<EventType>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    /// Events per second; 0 = unlimited.
    pub max_events_per_s: u32,
}

impl EndpointConfig {
    /// True if this endpoint subscribes to `event_type`.
    pub fn accepts(&self, event_type: EventType) -> bool {
        self.event_types.is_empty() || self.event_types.contains(&event_type)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            schema_version: 1,
            tcp: TcpConfig {
                bind: "0.0.0.0:7054".to_owned(),
                initial_read_timeout: Duration::from_secs(180),
                steady_read_timeout: Duration::from_secs(300),
                write_timeout: Duration::from_secs(10),
            },
            http: HttpConfig {
                bind: "127.0.0.1:8090".to_owned(),
                idempotency_ttl: Duration::from_secs(60),
            },
            device: DeviceConfig {
                offline_threshold: Duration::from_secs(180),
                warning_threshold: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(30),
                grace_window: Duration::from_secs(600),
                min_send_interval: Duration::from_millis(500),
                charge_control_retries: 1,
            },
            power: PowerConfig {
                peak_hold: Duration::from_secs(300),
                step_interval: Duration::from_secs(180),
                step_percent: 10,
                min_power_w: 80,
                change_threshold_w: 20,
                reconcile_margin_w: 10,
            },
            orders: OrderConfig {
                gc_interval: Duration::from_secs(300),
                finished_retention: Duration::from_secs(3600),
                pending_timeout: Duration::from_secs(1800),
                charging_max_age: Duration::from_secs(86_400),
            },
            events: EventConfig {
                ring_capacity: 10_000,
                queue_capacity: 10_000,
                workers: 5,
                debounce: Duration::from_millis(2000),
                power_sample_rate: 1,
                subscriber_buffer: 256,
            },
            endpoints: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    tcp: Option<RawTcpConfig>,
    http: Option<RawHttpConfig>,
    device: Option<RawDeviceConfig>,
    power: Option<RawPowerConfig>,
    orders: Option<RawOrderConfig>,
    events: Option<RawEventConfig>,
    endpoints: Option<Vec<RawEndpointConfig>>,
}

#[derive(Debug, Deserialize)]
struct RawTcpConfig {
    bind: Option<String>,
    initial_read_timeout_s: Option<u64>,
    steady_read_timeout_s: Option<u64>,
    write_timeout_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHttpConfig {
    bind: Option<String>,
    idempotency_ttl_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDeviceConfig {
    offline_threshold_s: Option<u64>,
    warning_threshold_s: Option<u64>,
    sweep_interval_s: Option<u64>,
    grace_window_s: Option<u64>,
    min_send_interval_ms: Option<u64>,
    charge_control_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawPowerConfig {
    peak_hold_s: Option<u64>,
    step_interval_s: Option<u64>,
    step_percent: Option<u16>,
    min_power_w: Option<u16>,
    change_threshold_w: Option<u16>,
    reconcile_margin_w: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawOrderConfig {
    gc_interval_s: Option<u64>,
    finished_retention_s: Option<u64>,
    pending_timeout_s: Option<u64>,
    charging_max_age_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEventConfig {
    ring_capacity: Option<usize>,
    queue_capacity: Option<usize>,
    workers: Option<usize>,
    debounce_ms: Option<u64>,
    power_sample_rate: Option<u32>,
    subscriber_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointConfig {
    name: Option<String>,
    url: Option<String>,
    enabled: Option<bool>,
    event_types: Option<Vec<String>>,
    headers: Option<HashMap<String, String>>,
    timeout_s: Option<u64>,
    max_events_per_s: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load gateway config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load gateway config from the default path `/etc/charge-gateway/gateway.toml`.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/charge-gateway/gateway.toml"))
}

/// Load gateway config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = GatewayConfig::default();

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let tcp = match raw.tcp {
        Some(t) => TcpConfig {
            bind: t.bind.unwrap_or(defaults.tcp.bind),
            initial_read_timeout: t
                .initial_read_timeout_s
                .map_or(defaults.tcp.initial_read_timeout, Duration::from_secs),
            steady_read_timeout: t
                .steady_read_timeout_s
                .map_or(defaults.tcp.steady_read_timeout, Duration::from_secs),
            write_timeout: t
                .write_timeout_s
                .map_or(defaults.tcp.write_timeout, Duration::from_secs),
        },
        None => defaults.tcp,
    };

    let http = match raw.http {
        Some(h) => HttpConfig {
            bind: h.bind.unwrap_or(defaults.http.bind),
            idempotency_ttl: h
                .idempotency_ttl_s
                .map_or(defaults.http.idempotency_ttl, Duration::from_secs),
        },
        None => defaults.http,
    };

    let device = match raw.device {
        Some(d) => DeviceConfig {
            offline_threshold: d
                .offline_threshold_s
                .map_or(defaults.device.offline_threshold, Duration::from_secs),
            warning_threshold: d
                .warning_threshold_s
                .map_or(defaults.device.warning_threshold, Duration::from_secs),
            sweep_interval: d
                .sweep_interval_s
                .map_or(defaults.device.sweep_interval, Duration::from_secs),
            grace_window: d
                .grace_window_s
                .map_or(defaults.device.grace_window, Duration::from_secs),
            min_send_interval: d
                .min_send_interval_ms
                .map_or(defaults.device.min_send_interval, Duration::from_millis),
            charge_control_retries: d
                .charge_control_retries
                .unwrap_or(defaults.device.charge_control_retries),
        },
        None => defaults.device,
    };

    let power = match raw.power {
        Some(p) => {
            let step_percent = p.step_percent.unwrap_or(defaults.power.step_percent);
            if step_percent == 0 || step_percent >= 100 {
                return Err(ConfigError::InvalidValue(format!(
                    "power.step_percent must be 1-99, got {}",
                    step_percent
                )));
            }
            PowerConfig {
                peak_hold: p
                    .peak_hold_s
                    .map_or(defaults.power.peak_hold, Duration::from_secs),
                step_interval: p
                    .step_interval_s
                    .map_or(defaults.power.step_interval, Duration::from_secs),
                step_percent,
                min_power_w: p.min_power_w.unwrap_or(defaults.power.min_power_w),
                change_threshold_w: p
                    .change_threshold_w
                    .unwrap_or(defaults.power.change_threshold_w),
                reconcile_margin_w: p
                    .reconcile_margin_w
                    .unwrap_or(defaults.power.reconcile_margin_w),
            }
        }
        None => defaults.power,
    };

    let orders = match raw.orders {
        Some(o) => OrderConfig {
            gc_interval: o
                .gc_interval_s
                .map_or(defaults.orders.gc_interval, Duration::from_secs),
            finished_retention: o
                .finished_retention_s
                .map_or(defaults.orders.finished_retention, Duration::from_secs),
            pending_timeout: o
                .pending_timeout_s
                .map_or(defaults.orders.pending_timeout, Duration::from_secs),
            charging_max_age: o
                .charging_max_age_s
                .map_or(defaults.orders.charging_max_age, Duration::from_secs),
        },
        None => defaults.orders,
    };

    let events = match raw.events {
        Some(e) => {
            let workers = e.workers.unwrap_or(defaults.events.workers);
            if workers == 0 {
                return Err(ConfigError::InvalidValue(
                    "events.workers must be at least 1".to_owned(),
                ));
            }
            let power_sample_rate = e
                .power_sample_rate
                .unwrap_or(defaults.events.power_sample_rate);
            if power_sample_rate == 0 {
                return Err(ConfigError::InvalidValue(
                    "events.power_sample_rate must be at least 1".to_owned(),
                ));
            }
            EventConfig {
                ring_capacity: e.ring_capacity.unwrap_or(defaults.events.ring_capacity),
                queue_capacity: e.queue_capacity.unwrap_or(defaults.events.queue_capacity),
                workers,
                debounce: e
                    .debounce_ms
                    .map_or(defaults.events.debounce, Duration::from_millis),
                power_sample_rate,
                subscriber_buffer: e
                    .subscriber_buffer
                    .unwrap_or(defaults.events.subscriber_buffer),
            }
        }
        None => defaults.events,
    };

    let mut endpoints = Vec::new();
    for (i, raw_ep) in raw.endpoints.unwrap_or_default().into_iter().enumerate() {
        let url = raw_ep
            .url
            .ok_or_else(|| ConfigError::MissingField(format!("endpoints[{}].url", i)))?;
        let mut event_types = Vec::new();
        for name in raw_ep.event_types.unwrap_or_default() {
            let ty: EventType = serde_json::from_value(serde_json::Value::String(name.clone()))
                .map_err(|_| {
                    ConfigError::InvalidValue(format!(
                        "endpoints[{}].event_types: unknown event type {:?}",
                        i, name
                    ))
                })?;
            event_types.push(ty);
        }
        endpoints.push(EndpointConfig {
            name: raw_ep.name.unwrap_or_else(|| format!("endpoint-{}", i)),
            url,
            enabled: raw_ep.enabled.unwrap_or(true),
            event_types,
            headers: raw_ep.headers.unwrap_or_default(),
            timeout: raw_ep.timeout_s.map_or(Duration::from_secs(10), Duration::from_secs),
            max_events_per_s: raw_ep.max_events_per_s.unwrap_or(0),
        });
    }

    Ok(GatewayConfig {
        schema_version,
        tcp,
        http,
        device,
        power,
        orders,
        events,
        endpoints,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
