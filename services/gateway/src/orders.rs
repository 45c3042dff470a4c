//! Per-(device, port) charging orders.
//!
//! The order manager is the single authoritative store of orders. At most
//! one order per port may be active ({Pending, Charging}); re-submitting
//! the same order number is idempotent, a different one is a conflict.
//! A background GC (driven by the supervisor) expires stale records.

use crate::events::EventRecorder;
use cg_protocol::{ChargeMode, Event, EventType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dny_core::DeviceId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Longest accepted order number.
pub const MAX_ORDER_NO_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Order record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Charging,
    Completed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    /// Active orders block a new order on the same port.
    pub fn is_active(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Charging)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Charging => "charging",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Order {
    pub device_id: DeviceId,
    /// 0-based.
    pub port: u8,
    pub order_no: String,
    pub status: OrderStatus,
    pub mode: ChargeMode,
    /// Seconds or 0.1 kWh units depending on `mode`.
    pub value: u16,
    /// 0.01 currency units.
    pub balance: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("port busy with active order {existing}")]
    Conflict { existing: String },
    #[error("no active order on this port")]
    NoActiveOrder,
    #[error("order is {status} and cannot be stopped")]
    WrongState { status: &'static str },
    #[error("order number does not match the active order")]
    OrderMismatch,
    #[error("order number is not ASCII or exceeds {MAX_ORDER_NO_LEN} characters")]
    BadOrderNo,
}

/// Outcome of `create_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new record was created; a charge-start command must be issued.
    Created,
    /// The same order is already active; nothing to emit.
    AlreadyActive,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct OrderStats {
    pub active: usize,
    pub pending: usize,
    pub charging: usize,
    pub created_total: u64,
    pub completed_total: u64,
    pub cancelled_total: u64,
    pub failed_total: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcOutcome {
    pub removed_finished: usize,
    pub cancelled_pending: usize,
    pub force_closed_charging: usize,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type PortKey = (DeviceId, u8);

pub struct OrderManager {
    entries: Mutex<HashMap<PortKey, Order>>,
    counters: Mutex<OrderStats>,
    events: Arc<EventRecorder>,
}

impl OrderManager {
    pub fn new(events: Arc<EventRecorder>) -> Self {
        OrderManager {
            entries: Mutex::new(HashMap::new()),
            counters: Mutex::new(OrderStats::default()),
            events,
        }
    }

    /// Create a new pending order, or accept an idempotent re-submission.
    pub async fn create_order(
        &self,
        device_id: DeviceId,
        port: u8,
        order_no: &str,
        mode: ChargeMode,
        value: u16,
        balance: u32,
    ) -> Result<CreateOutcome, OrderError> {
        if order_no.is_empty() || !order_no.is_ascii() || order_no.len() > MAX_ORDER_NO_LEN {
            return Err(OrderError::BadOrderNo);
        }
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&(device_id, port)) {
            if existing.status.is_active() {
                if existing.order_no == order_no {
                    return Ok(CreateOutcome::AlreadyActive);
                }
                return Err(OrderError::Conflict {
                    existing: existing.order_no.clone(),
                });
            }
        }
        let now = Utc::now();
        entries.insert(
            (device_id, port),
            Order {
                device_id,
                port,
                order_no: order_no.to_owned(),
                status: OrderStatus::Pending,
                mode,
                value,
                balance,
                started_at: now,
                updated_at: now,
                ended_at: None,
                fail_reason: None,
            },
        );
        drop(entries);
        self.counters.lock().await.created_total += 1;
        info!(device_id = %device_id, port, order_no, "order created");
        Ok(CreateOutcome::Created)
    }

    /// Update the status of the order on (device, port). Returns the
    /// updated order, or `None` if there is none.
    pub async fn update_status(
        &self,
        device_id: DeviceId,
        port: u8,
        status: OrderStatus,
        reason: Option<&str>,
    ) -> Option<Order> {
        let mut entries = self.entries.lock().await;
        let order = entries.get_mut(&(device_id, port))?;
        let previous = order.status;
        order.status = status;
        order.updated_at = Utc::now();
        if !status.is_active() {
            order.ended_at = Some(order.updated_at);
        }
        if let Some(reason) = reason {
            order.fail_reason = Some(reason.to_owned());
        }
        let snapshot = order.clone();
        drop(entries);
        if previous != status {
            let mut counters = self.counters.lock().await;
            match status {
                OrderStatus::Completed => counters.completed_total += 1,
                OrderStatus::Cancelled => counters.cancelled_total += 1,
                OrderStatus::Failed => counters.failed_total += 1,
                OrderStatus::Pending | OrderStatus::Charging => {}
            }
        }
        Some(snapshot)
    }

    /// Validate a stop request. An empty `order_no` matches whatever order
    /// is active; a non-empty one must match exactly.
    pub async fn validate_for_stop(
        &self,
        device_id: DeviceId,
        port: u8,
        order_no: Option<&str>,
    ) -> Result<Order, OrderError> {
        let entries = self.entries.lock().await;
        let order = entries
            .get(&(device_id, port))
            .ok_or(OrderError::NoActiveOrder)?;
        if !order.status.is_active() {
            return Err(OrderError::WrongState {
                status: order.status.as_str(),
            });
        }
        if let Some(requested) = order_no {
            if !requested.is_empty() && requested != order.order_no {
                return Err(OrderError::OrderMismatch);
            }
        }
        Ok(order.clone())
    }

    /// Drop the record for (device, port), whatever its state.
    pub async fn cleanup(&self, device_id: DeviceId, port: u8, reason: &str) -> Option<Order> {
        let removed = self.entries.lock().await.remove(&(device_id, port));
        if let Some(order) = &removed {
            info!(device_id = %device_id, port, order_no = %order.order_no, reason,
                  "order record removed");
        }
        removed
    }

    pub async fn get(&self, device_id: DeviceId, port: u8) -> Option<Order> {
        self.entries.lock().await.get(&(device_id, port)).cloned()
    }

    pub async fn list_active(&self) -> Vec<Order> {
        let entries = self.entries.lock().await;
        let mut active: Vec<Order> = entries
            .values()
            .filter(|o| o.status.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    pub async fn stats(&self) -> OrderStats {
        let entries = self.entries.lock().await;
        let mut stats = *self.counters.lock().await;
        stats.pending = entries
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .count();
        stats.charging = entries
            .values()
            .filter(|o| o.status == OrderStatus::Charging)
            .count();
        stats.active = stats.pending + stats.charging;
        stats
    }

    /// One GC pass. Removes finished orders past retention, cancels stale
    /// pending orders, and force-closes over-age charging orders with a
    /// warning event.
    pub async fn gc(
        &self,
        finished_retention: std::time::Duration,
        pending_timeout: std::time::Duration,
        charging_max_age: std::time::Duration,
    ) -> GcOutcome {
        let now = Utc::now();
        let finished_cutoff = now - ChronoDuration::from_std(finished_retention).unwrap_or_default();
        let pending_cutoff = now - ChronoDuration::from_std(pending_timeout).unwrap_or_default();
        let charging_cutoff = now - ChronoDuration::from_std(charging_max_age).unwrap_or_default();

        let mut outcome = GcOutcome::default();
        let mut force_closed = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|_, order| {
                let finished = !order.status.is_active();
                if finished && order.updated_at < finished_cutoff {
                    outcome.removed_finished += 1;
                    return false;
                }
                true
            });
            for order in entries.values_mut() {
                match order.status {
                    OrderStatus::Pending if order.updated_at < pending_cutoff => {
                        order.status = OrderStatus::Cancelled;
                        order.updated_at = now;
                        order.ended_at = Some(now);
                        order.fail_reason = Some("pending timeout".to_owned());
                        outcome.cancelled_pending += 1;
                    }
                    OrderStatus::Charging if order.started_at < charging_cutoff => {
                        order.status = OrderStatus::Completed;
                        order.updated_at = now;
                        order.ended_at = Some(now);
                        order.fail_reason = Some("charging max age exceeded".to_owned());
                        outcome.force_closed_charging += 1;
                        force_closed.push(order.clone());
                    }
                    _ => {}
                }
            }
        }
        {
            let mut counters = self.counters.lock().await;
            counters.cancelled_total += outcome.cancelled_pending as u64;
            counters.completed_total += outcome.force_closed_charging as u64;
        }
        for order in force_closed {
            warn!(device_id = %order.device_id, port = order.port,
                  order_no = %order.order_no, "charging order force-closed by GC");
            self.events
                .record(
                    Event::new(EventType::ChargingEnd, order.device_id)
                        .with_port(order.port + 1)
                        .with_data("order_no", order.order_no.clone())
                        .with_data("reason", "force-closed"),
                )
                .await;
        }
        outcome
    }
}
