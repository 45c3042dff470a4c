//! Adaptive overload-power controller.
//!
//! Observes power-telemetry heartbeats for ports in the Charging state and
//! steps the device's overload-power parameter down toward the actual
//! draw. The device's draw lags the parameter, so the loop holds during
//! the initial peak, debounces small deltas, and re-issues a missed
//! adjustment once after a grace period.
//!
//! Decision logic is a pure function of the entry and the observation;
//! actuation (building and sending the 0x82 frame) is the caller's job.

use crate::config::PowerConfig;
use dny_core::DeviceId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Entry and decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PowerEntry {
    first_charging_at: Instant,
    last_adjust_at: Option<Instant>,
    /// Current overload parameter as this controller believes the device
    /// holds it. Zero until the first baseline is established.
    last_overload_w: u16,
    last_observed_w: u16,
    last_target_w: u16,
    resent: bool,
    order_no: String,
}

impl PowerEntry {
    fn new(now: Instant, order_no: &str) -> Self {
        PowerEntry {
            first_charging_at: now,
            last_adjust_at: None,
            last_overload_w: 0,
            last_observed_w: 0,
            last_target_w: 0,
            resent: false,
            order_no: order_no.to_owned(),
        }
    }
}

/// What the controller wants done after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerDecision {
    /// No command; the reason is for logs only.
    Hold(&'static str),
    /// Issue an overload update to `target_w`.
    Adjust { target_w: u16, baseline_w: u16 },
}

/// Pure step decision. `entry` reflects state before this observation.
fn decide(cfg: &PowerConfig, entry: &PowerEntry, observed_w: u16, now: Instant) -> PowerDecision {
    if now.duration_since(entry.first_charging_at) < cfg.peak_hold {
        return PowerDecision::Hold("peak-hold");
    }
    if let Some(last) = entry.last_adjust_at {
        if now.duration_since(last) < cfg.step_interval {
            return PowerDecision::Hold("step-interval");
        }
    }
    let baseline = if entry.last_overload_w == 0 {
        // First adjustment: 10% headroom above the observed draw.
        let headroom = (u32::from(observed_w) * 110).div_ceil(100);
        headroom.max(u32::from(observed_w) + 20).min(u32::from(u16::MAX)) as u16
    } else {
        entry.last_overload_w
    };
    let stepped = (u32::from(baseline) * u32::from(100 - cfg.step_percent) + 50) / 100;
    let target = (stepped as u16).max(cfg.min_power_w);
    if baseline.abs_diff(target) < cfg.change_threshold_w {
        return PowerDecision::Hold("debounce");
    }
    PowerDecision::Adjust {
        target_w: target,
        baseline_w: baseline,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// An adjustment the caller must actuate via the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerAdjustment {
    pub device_id: DeviceId,
    /// 0-based.
    pub port: u8,
    pub order_no: String,
    pub target_w: u16,
    /// True when this is the post-grace re-issue of a missed adjustment.
    pub reissue: bool,
}

type PortKey = (DeviceId, u8);

pub struct PowerController {
    cfg: PowerConfig,
    entries: Mutex<HashMap<PortKey, PowerEntry>>,
}

impl PowerController {
    pub fn new(cfg: PowerConfig) -> Self {
        PowerController {
            cfg,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Delay after which [`reconcile`](Self::reconcile) should run for an
    /// adjustment issued now.
    pub fn reconcile_grace(&self) -> Duration {
        self.cfg.step_interval / 2 + Duration::from_secs(10)
    }

    /// Note that charging began on a port (ack or status observation).
    /// Starts the peak-hold clock.
    pub async fn start_session(&self, device_id: DeviceId, port: u8, order_no: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert((device_id, port), PowerEntry::new(Instant::now(), order_no));
    }

    /// Drop the entry when the session ends.
    pub async fn end_session(&self, device_id: DeviceId, port: u8) {
        self.entries.lock().await.remove(&(device_id, port));
    }

    /// Feed one power observation. `charging` reflects the status byte of
    /// the heartbeat; a non-charging port clears its entry.
    pub async fn observe(
        &self,
        device_id: DeviceId,
        port: u8,
        charging: bool,
        power_w: u16,
        order_no: &str,
    ) -> Option<PowerAdjustment> {
        let mut entries = self.entries.lock().await;
        let key = (device_id, port);
        if !charging {
            entries.remove(&key);
            return None;
        }
        let now = Instant::now();
        let entry = entries
            .entry(key)
            .or_insert_with(|| PowerEntry::new(now, order_no));
        entry.last_observed_w = power_w;
        if !order_no.is_empty() {
            entry.order_no = order_no.to_owned();
        }

        match decide(&self.cfg, entry, power_w, now) {
            PowerDecision::Hold(reason) => {
                debug!(device_id = %device_id, port, power_w, reason, "power step held");
                None
            }
            PowerDecision::Adjust {
                target_w,
                baseline_w,
            } => {
                entry.last_adjust_at = Some(now);
                entry.last_overload_w = target_w;
                entry.last_target_w = target_w;
                entry.resent = false;
                debug!(device_id = %device_id, port, baseline_w, target_w, "power step");
                Some(PowerAdjustment {
                    device_id,
                    port,
                    order_no: entry.order_no.clone(),
                    target_w,
                    reissue: false,
                })
            }
        }
    }

    /// Post-grace reconciliation: if the observed draw still exceeds the
    /// last target by more than the margin and no re-issue has happened
    /// yet, ask for one.
    pub async fn reconcile(&self, device_id: DeviceId, port: u8) -> Option<PowerAdjustment> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&(device_id, port))?;
        if entry.resent || entry.last_target_w == 0 {
            return None;
        }
        let over = entry
            .last_observed_w
            .saturating_sub(entry.last_target_w);
        if over <= self.cfg.reconcile_margin_w {
            return None;
        }
        entry.resent = true;
        debug!(device_id = %device_id, port, observed = entry.last_observed_w,
               target = entry.last_target_w, "re-issuing missed power adjustment");
        Some(PowerAdjustment {
            device_id,
            port,
            order_no: entry.order_no.clone(),
            target_w: entry.last_target_w,
            reissue: true,
        })
    }
}
