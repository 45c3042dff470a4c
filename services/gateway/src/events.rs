//! Event recording and fan-out entry point.
//!
//! `record` appends to a bounded in-memory ring (for the recent-events
//! query), publishes to live subscribers over a broadcast channel, and
//! forwards to the sink dispatcher queue. Back-pressure policy is per
//! event class: telemetry is dropped when the queue is full, lifecycle
//! blocks briefly before giving up.
//!
//! Subscribers that lag are dropped by the broadcast channel; that is the
//! intended drop-the-slowest policy, not an error.

use crate::config::EventConfig;
use cg_protocol::Event;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// How long a lifecycle-event producer is willing to wait on a full queue.
const LIFECYCLE_ENQUEUE_PATIENCE: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
pub struct EventStats {
    pub recorded: AtomicU64,
    pub dropped_telemetry: AtomicU64,
    pub dropped_lifecycle: AtomicU64,
}

/// Single producer-facing entry point for all gateway events.
pub struct EventRecorder {
    ring: Mutex<VecDeque<Event>>,
    ring_capacity: usize,
    live_tx: broadcast::Sender<Event>,
    sink_tx: mpsc::Sender<Event>,
    stats: EventStats,
}

impl EventRecorder {
    /// Build a recorder plus the receiving end of the sink queue, which the
    /// sink dispatcher consumes.
    pub fn new(cfg: &EventConfig) -> (Self, mpsc::Receiver<Event>) {
        let (sink_tx, sink_rx) = mpsc::channel(cfg.queue_capacity);
        let (live_tx, _) = broadcast::channel(cfg.subscriber_buffer);
        (
            EventRecorder {
                ring: Mutex::new(VecDeque::with_capacity(cfg.ring_capacity.min(1024))),
                ring_capacity: cfg.ring_capacity,
                live_tx,
                sink_tx,
                stats: EventStats::default(),
            },
            sink_rx,
        )
    }

    /// Record an event: ring, live subscribers, sink queue.
    pub async fn record(&self, event: Event) {
        self.stats.recorded.fetch_add(1, Ordering::Relaxed);

        {
            let mut ring = self.ring.lock().expect("ring lock");
            if ring.len() == self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        // No live subscribers is fine.
        let _ = self.live_tx.send(event.clone());

        if event.event_type.is_telemetry() {
            if self.sink_tx.try_send(event).is_err() {
                self.stats.dropped_telemetry.fetch_add(1, Ordering::Relaxed);
            }
        } else if let Err(_full) = self
            .sink_tx
            .send_timeout(event, LIFECYCLE_ENQUEUE_PATIENCE)
            .await
        {
            self.stats.dropped_lifecycle.fetch_add(1, Ordering::Relaxed);
            warn!("sink queue saturated, lifecycle event dropped");
        }
    }

    /// The most recent events, newest last, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let ring = self.ring.lock().expect("ring lock");
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.live_tx.subscribe()
    }

    pub fn stats(&self) -> &EventStats {
        &self.stats
    }
}
