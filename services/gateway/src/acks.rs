//! Outbound command acknowledgement tracking.
//!
//! Every tracked outbound command registers a pending entry keyed by
//! (connection id, message id). Device replies carrying a command from the
//! reply set complete the entry; a periodic sweep re-issues expired
//! entries (same message id, bounded budget) and finally reports a timeout
//! through the event plane.

use crate::events::EventRecorder;
use crate::writer::ConnWriter;
use cg_protocol::{Event, EventType};
use dny_core::DeviceId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sweep cadence for expiry checks.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-command-class ack timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckClass {
    Register,
    HeartbeatAck,
    Data,
    Default,
}

impl AckClass {
    pub fn timeout(self) -> Duration {
        match self {
            AckClass::Register => Duration::from_secs(30),
            AckClass::HeartbeatAck => Duration::from_secs(10),
            AckClass::Data => Duration::from_secs(90),
            AckClass::Default => Duration::from_secs(60),
        }
    }
}

/// One tracked outbound command.
#[derive(Clone)]
pub struct PendingCommand {
    pub conn_id: u64,
    pub device_id: DeviceId,
    pub message_id: u16,
    pub command: u8,
    /// The full encoded frame, kept for re-issue with the same message id.
    pub frame: Vec<u8>,
    pub writer: ConnWriter,
    pub class: AckClass,
    pub retries_left: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct AckStats {
    pub registered: AtomicU64,
    pub completed: AtomicU64,
    pub reissued: AtomicU64,
    pub timed_out: AtomicU64,
    pub unmatched: AtomicU64,
}

pub struct AckTracker {
    pending: Mutex<HashMap<(u64, u16), PendingCommand>>,
    events: Arc<EventRecorder>,
    stats: AckStats,
}

impl AckTracker {
    pub fn new(events: Arc<EventRecorder>) -> Self {
        AckTracker {
            pending: Mutex::new(HashMap::new()),
            events,
            stats: AckStats::default(),
        }
    }

    /// Register an outbound command for ack correlation.
    pub async fn register(
        &self,
        conn_id: u64,
        device_id: DeviceId,
        message_id: u16,
        command: u8,
        frame: Vec<u8>,
        writer: ConnWriter,
        class: AckClass,
        retries: u32,
    ) {
        let entry = PendingCommand {
            conn_id,
            device_id,
            message_id,
            command,
            frame,
            writer,
            class,
            retries_left: retries,
            deadline: Instant::now() + class.timeout(),
        };
        self.pending
            .lock()
            .await
            .insert((conn_id, message_id), entry);
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Match an inbound reply. Returns the completed entry, or `None` for
    /// an unmatched ack (logged and dropped by the caller).
    pub async fn complete(&self, conn_id: u64, message_id: u16) -> Option<PendingCommand> {
        let entry = self.pending.lock().await.remove(&(conn_id, message_id));
        match &entry {
            Some(pending) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                debug!(device_id = %pending.device_id, message_id, "command acked");
            }
            None => {
                self.stats.unmatched.fetch_add(1, Ordering::Relaxed);
                debug!(conn_id, message_id, "unmatched ack dropped");
            }
        }
        entry
    }

    /// Number of entries currently awaiting an ack.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn stats(&self) -> &AckStats {
        &self.stats
    }

    /// One expiry pass: re-issue entries with retry budget left, surface a
    /// timeout for the rest.
    pub async fn sweep(&self, now: Instant) {
        let mut reissue = Vec::new();
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock().await;
            let keys: Vec<(u64, u16)> = pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                let Some(mut entry) = pending.remove(&key) else {
                    continue;
                };
                if entry.retries_left > 0 {
                    entry.retries_left -= 1;
                    entry.deadline = now + entry.class.timeout();
                    reissue.push(entry.clone());
                    pending.insert(key, entry);
                } else {
                    expired.push(entry);
                }
            }
        }

        for entry in reissue {
            self.stats.reissued.fetch_add(1, Ordering::Relaxed);
            warn!(device_id = %entry.device_id, message_id = entry.message_id,
                  command = format_args!("0x{:02X}", entry.command), "ack timeout, re-issuing");
            if let Err(e) = entry.writer.write(&entry.frame).await {
                warn!(device_id = %entry.device_id, error = %e, "re-issue write failed");
            }
        }
        for entry in expired {
            self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(device_id = %entry.device_id, message_id = entry.message_id,
                  command = format_args!("0x{:02X}", entry.command), "command ack timed out");
            self.events
                .record(
                    Event::new(EventType::DeviceError, entry.device_id)
                        .with_data("error", "ack-timeout")
                        .with_data("command", format!("0x{:02X}", entry.command))
                        .with_data("message_id", entry.message_id),
                )
                .await;
        }
    }

    /// Drop all pending entries for a closed connection.
    pub async fn drop_connection(&self, conn_id: u64) {
        self.pending
            .lock()
            .await
            .retain(|(c, _), _| *c != conn_id);
    }

    /// Background expiry loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {
                    self.sweep(Instant::now()).await;
                }
            }
        }
    }
}
