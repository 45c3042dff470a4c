//! Background supervision: heartbeat staleness and order GC.
//!
//! One task, two cadences. The device sweep marks stale devices offline,
//! emits one-shot stale warnings, and garbage-collects devices whose
//! offline grace window has elapsed. The order pass applies the order
//! manager's retention rules.

use crate::gateway::Gateway;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub async fn run(gateway: Arc<Gateway>, mut shutdown: watch::Receiver<bool>) {
    let device_cfg = gateway.config.device.clone();
    let order_cfg = gateway.config.orders.clone();
    let mut device_tick = tokio::time::interval(device_cfg.sweep_interval);
    let mut order_tick = tokio::time::interval(order_cfg.gc_interval);
    device_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    order_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() { break; }
            }
            _ = device_tick.tick() => {
                let swept = gateway
                    .registry
                    .sweep(
                        device_cfg.offline_threshold,
                        device_cfg.warning_threshold,
                        device_cfg.grace_window,
                    )
                    .await;
                if !swept.offlined.is_empty() || !swept.removed.is_empty() {
                    info!(
                        offlined = swept.offlined.len(),
                        warned = swept.warned.len(),
                        removed = swept.removed.len(),
                        "device sweep"
                    );
                }
            }
            _ = order_tick.tick() => {
                let outcome = gateway
                    .orders
                    .gc(
                        order_cfg.finished_retention,
                        order_cfg.pending_timeout,
                        order_cfg.charging_max_age,
                    )
                    .await;
                if outcome != crate::orders::GcOutcome::default() {
                    info!(
                        removed = outcome.removed_finished,
                        cancelled = outcome.cancelled_pending,
                        force_closed = outcome.force_closed_charging,
                        "order gc"
                    );
                }
            }
        }
    }
    debug!("supervisor stopped");
}
