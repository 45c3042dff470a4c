//! Per-(device, port) charging state machines.
//!
//! One automaton per port, driven by command intent (start/stop acks) and
//! by device heartbeat status codes. Transitions are validated against a
//! fixed table; a same-state "transition" is a no-op and an illegal one is
//! rejected without touching state. Each automaton keeps a bounded history
//! of its transitions.

use crate::events::EventRecorder;
use cg_protocol::{Event, EventType, PortDetail};
use chrono::{DateTime, Utc};
use dny_core::DeviceId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Transitions retained per automaton.
const HISTORY_CAPACITY: usize = 50;

// ---------------------------------------------------------------------------
// States and reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortState {
    Idle,
    Plugged,
    Charging,
    FloatCharging,
    Completed,
    Fault,
    EmergencyStop,
}

impl PortState {
    pub fn as_str(self) -> &'static str {
        match self {
            PortState::Idle => "idle",
            PortState::Plugged => "plugged",
            PortState::Charging => "charging",
            PortState::FloatCharging => "float_charging",
            PortState::Completed => "completed",
            PortState::Fault => "fault",
            PortState::EmergencyStop => "emergency_stop",
        }
    }

    /// Map a device protocol status byte. Unknown codes map to `Fault`;
    /// the raw code is preserved alongside so it can be recorded.
    pub fn from_status_code(code: u8) -> (PortState, Option<u8>) {
        match code {
            0 => (PortState::Idle, None),
            1 => (PortState::Charging, None),
            2 => (PortState::Plugged, None),
            3 => (PortState::Completed, None),
            5 => (PortState::FloatCharging, None),
            other => (PortState::Fault, Some(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    UserRequest,
    DeviceResponse,
    Heartbeat,
    Timeout,
    Fault,
    Emergency,
    PowerAbnormal,
    Settlement,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionReason::UserRequest => "user-request",
            TransitionReason::DeviceResponse => "device-response",
            TransitionReason::Heartbeat => "heartbeat",
            TransitionReason::Timeout => "timeout",
            TransitionReason::Fault => "fault",
            TransitionReason::Emergency => "emergency",
            TransitionReason::PowerAbnormal => "power-abnormal",
            TransitionReason::Settlement => "settlement",
        }
    }
}

/// The allowed-transition table.
pub fn transition_allowed(from: PortState, to: PortState) -> bool {
    use PortState::*;
    matches!(
        (from, to),
        (Idle, Plugged)
            | (Idle, Fault)
            | (Plugged, Charging)
            | (Plugged, Idle)
            | (Plugged, Fault)
            | (Charging, FloatCharging)
            | (Charging, Completed)
            | (Charging, Fault)
            | (Charging, EmergencyStop)
            | (Charging, Idle)
            | (FloatCharging, Completed)
            | (FloatCharging, Fault)
            | (FloatCharging, EmergencyStop)
            | (Completed, Idle)
            | (Completed, Fault)
            | (Fault, Idle)
            | (EmergencyStop, Idle)
            | (EmergencyStop, Fault)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: PortState,
    pub to: PortState,
}

// ---------------------------------------------------------------------------
// Automaton
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: PortState,
    pub to: PortState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
    /// Raw status code or similar context.
    pub detail: Option<String>,
}

#[derive(Debug)]
struct PortAutomaton {
    state: PortState,
    order_no: Option<String>,
    history: VecDeque<Transition>,
}

impl PortAutomaton {
    fn new() -> Self {
        PortAutomaton {
            state: PortState::Idle,
            order_no: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    /// Apply a transition. `Ok(false)` means same-state no-op.
    fn apply(
        &mut self,
        to: PortState,
        reason: TransitionReason,
        detail: Option<String>,
    ) -> Result<bool, InvalidTransition> {
        if self.state == to {
            return Ok(false);
        }
        if !transition_allowed(self.state, to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from: self.state,
            to,
            reason,
            at: Utc::now(),
            detail,
        });
        self.state = to;
        Ok(true)
    }

    /// Force the machine back to Idle at session end, stepping through
    /// whatever legal intermediate the table requires.
    fn finalize(&mut self, reason: TransitionReason) {
        self.order_no = None;
        if self.state == PortState::Idle {
            return;
        }
        if self.apply(PortState::Idle, reason, None).is_ok() {
            return;
        }
        // FloatCharging has no direct edge to Idle; go via Completed.
        let _ = self.apply(PortState::Completed, reason, None);
        let _ = self.apply(PortState::Idle, reason, None);
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type PortKey = (DeviceId, u8);

/// Owner of every port automaton; the only writer to them.
pub struct PortStateManager {
    entries: Mutex<HashMap<PortKey, Arc<Mutex<PortAutomaton>>>>,
    events: Arc<EventRecorder>,
}

/// Outcome of a status observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    Rejected,
}

impl PortStateManager {
    pub fn new(events: Arc<EventRecorder>) -> Self {
        PortStateManager {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    async fn entry(&self, device_id: DeviceId, port: u8) -> Arc<Mutex<PortAutomaton>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry((device_id, port))
            .or_insert_with(|| Arc::new(Mutex::new(PortAutomaton::new())))
            .clone()
    }

    /// Apply an explicit transition, recording a `port_status_change` event
    /// (and `port_error` for faults) when the state actually changes.
    pub async fn apply(
        &self,
        device_id: DeviceId,
        port: u8,
        to: PortState,
        reason: TransitionReason,
        detail: Option<String>,
    ) -> Result<Applied, InvalidTransition> {
        let entry = self.entry(device_id, port).await;
        let mut automaton = entry.lock().await;
        let from = automaton.state;
        match automaton.apply(to, reason, detail.clone()) {
            Ok(true) => {
                let order_no = automaton.order_no.clone();
                drop(automaton);
                debug!(device_id = %device_id, port, from = from.as_str(), to = to.as_str(),
                       reason = reason.as_str(), "port state change");
                let mut event = Event::new(EventType::PortStatusChange, device_id)
                    .with_port(port + 1)
                    .with_data("from", from.as_str())
                    .with_data("to", to.as_str())
                    .with_data("reason", reason.as_str());
                if let Some(order_no) = order_no {
                    event = event.with_data("order_no", order_no);
                }
                if let Some(detail) = detail {
                    event = event.with_data("detail", detail);
                }
                self.events.record(event).await;
                if to == PortState::Fault {
                    self.events
                        .record(
                            Event::new(EventType::PortError, device_id)
                                .with_port(port + 1)
                                .with_data("from", from.as_str()),
                        )
                        .await;
                }
                Ok(Applied::Changed)
            }
            Ok(false) => Ok(Applied::Unchanged),
            Err(e) => {
                warn!(device_id = %device_id, port, from = from.as_str(), to = to.as_str(),
                      "illegal port transition rejected");
                Err(e)
            }
        }
    }

    /// Apply a raw device status code (heartbeat path). Illegal transitions
    /// are rejected internally and reported as `Rejected`.
    pub async fn on_status_code(&self, device_id: DeviceId, port: u8, code: u8) -> Applied {
        let (to, unknown) = PortState::from_status_code(code);
        let detail = unknown.map(|c| format!("status-code-{c}"));
        let reason = if unknown.is_some() {
            TransitionReason::Fault
        } else {
            TransitionReason::Heartbeat
        };
        match self.apply(device_id, port, to, reason, detail).await {
            Ok(applied) => applied,
            Err(_) => Applied::Rejected,
        }
    }

    /// Attach an order number to the port's current session.
    pub async fn set_order(&self, device_id: DeviceId, port: u8, order_no: &str) {
        let entry = self.entry(device_id, port).await;
        entry.lock().await.order_no = Some(order_no.to_owned());
    }

    pub async fn order_no(&self, device_id: DeviceId, port: u8) -> Option<String> {
        let entry = self.entry(device_id, port).await;
        let automaton = entry.lock().await;
        automaton.order_no.clone()
    }

    pub async fn state(&self, device_id: DeviceId, port: u8) -> PortState {
        let entry = self.entry(device_id, port).await;
        let automaton = entry.lock().await;
        automaton.state
    }

    /// Start a charging session: attach the order number and walk the
    /// automaton to Charging through legal edges (an Idle port passes
    /// through Plugged first).
    pub async fn begin_session(
        &self,
        device_id: DeviceId,
        port: u8,
        order_no: &str,
        reason: TransitionReason,
    ) -> Result<(), InvalidTransition> {
        self.set_order(device_id, port, order_no).await;
        let state = self.state(device_id, port).await;
        if matches!(
            state,
            PortState::Completed | PortState::Fault | PortState::EmergencyStop
        ) {
            self.apply(device_id, port, PortState::Idle, reason, None)
                .await?;
        }
        if self.state(device_id, port).await == PortState::Idle {
            self.apply(device_id, port, PortState::Plugged, reason, None)
                .await?;
        }
        self.apply(device_id, port, PortState::Charging, reason, None)
            .await?;
        Ok(())
    }

    /// Force the port back to Idle and clear its order number; called when
    /// the order reaches a terminal status.
    pub async fn finalize_session(&self, device_id: DeviceId, port: u8, reason: TransitionReason) {
        let entry = self.entry(device_id, port).await;
        let mut automaton = entry.lock().await;
        let from = automaton.state;
        automaton.finalize(reason);
        if from != PortState::Idle {
            drop(automaton);
            self.events
                .record(
                    Event::new(EventType::PortStatusChange, device_id)
                        .with_port(port + 1)
                        .with_data("from", from.as_str())
                        .with_data("to", PortState::Idle.as_str())
                        .with_data("reason", reason.as_str()),
                )
                .await;
        }
    }

    /// Transition history of one port, oldest first.
    pub async fn history(&self, device_id: DeviceId, port: u8) -> Vec<Transition> {
        let entry = self.entry(device_id, port).await;
        let automaton = entry.lock().await;
        automaton.history.iter().cloned().collect()
    }

    /// Per-port snapshot for the device detail endpoint (1-based ports).
    pub async fn snapshot(&self, device_id: DeviceId) -> Vec<PortDetail> {
        let entries = self.entries.lock().await;
        let mut keys: Vec<_> = entries
            .iter()
            .filter(|((d, _), _)| *d == device_id)
            .map(|((_, p), a)| (*p, a.clone()))
            .collect();
        drop(entries);
        keys.sort_by_key(|(p, _)| *p);
        let mut out = Vec::with_capacity(keys.len());
        for (port, entry) in keys {
            let automaton = entry.lock().await;
            out.push(PortDetail {
                port: port + 1,
                state: automaton.state.as_str().to_owned(),
                order_no: automaton.order_no.clone(),
            });
        }
        out
    }
}
