//! Authoritative device registry.
//!
//! Sole owner and mutator of the Group and Device maps and of the
//! connection bindings. Everything else refers to devices by value-typed
//! key ([`DeviceId`], ICCID string, connection id) and resolves through
//! this registry; no component holds a pointer into another component's
//! internals.
//!
//! Invariants maintained here:
//! 1. For every online device exactly one connection maps to it.
//! 2. Every connection maps to at most one device.
//! 3. A device's ICCID equals its group key.
//! 4. `list_online` enumerates exactly the devices whose status is Online.

use crate::events::EventRecorder;
use crate::writer::ConnWriter;
use cg_protocol::{DeviceStatus, Event, EventType};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dny_core::DeviceId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Cloneable handle to an accepted connection: identity plus the
/// serialized write path. The session task holds the receiving end of the
/// close signal and exits when the registry (or a reconnect) asks it to.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: u64,
    pub remote_addr: String,
    pub writer: ConnWriter,
    pub created_at: DateTime<Utc>,
    close: Arc<watch::Sender<bool>>,
}

impl ConnHandle {
    pub fn new(conn_id: u64, remote_addr: String, writer: ConnWriter) -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        (
            ConnHandle {
                conn_id,
                remote_addr,
                writer,
                created_at: Utc::now(),
                close: Arc::new(close_tx),
            },
            close_rx,
        )
    }

    /// Ask the owning session to shut the socket down.
    pub fn request_close(&self) {
        let _ = self.close.send(true);
    }
}

// ---------------------------------------------------------------------------
// Device entry
// ---------------------------------------------------------------------------

/// Kinds of inbound heartbeat, counted separately in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    Link,
    Main,
    Device,
    Power,
}

impl HeartbeatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HeartbeatKind::Link => "link",
            HeartbeatKind::Main => "main",
            HeartbeatKind::Device => "device",
            HeartbeatKind::Power => "power",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub iccid: String,
    pub status: DeviceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Opaque registration payload, hex-encoded.
    pub firmware: Option<String>,
    pub reconnect_count: u32,
    pub heartbeat_count: u64,
    pub command_count: u64,
    pub registered_at: DateTime<Utc>,
    pub offline_since: Option<DateTime<Utc>>,
    warned_stale: bool,
}

impl Device {
    fn new(id: DeviceId, iccid: String) -> Self {
        Device {
            id,
            iccid,
            status: DeviceStatus::Registered,
            last_heartbeat: None,
            firmware: None,
            reconnect_count: 0,
            heartbeat_count: 0,
            command_count: 0,
            registered_at: Utc::now(),
            offline_since: None,
            warned_stale: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    /// ICCID -> device set. A group exists iff it holds at least one device.
    groups: HashMap<String, HashSet<DeviceId>>,
    conn_to_device: HashMap<u64, DeviceId>,
    device_to_conn: HashMap<DeviceId, ConnHandle>,
}

/// Outcome of a bind call.
pub struct BindOutcome {
    pub device_id: DeviceId,
    /// Present when an older connection held the binding; the caller (or
    /// the registry's own close request) retires it.
    pub replaced: Option<ConnHandle>,
    pub reconnected: bool,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RegistryStats {
    pub devices: usize,
    pub online: usize,
    pub groups: usize,
    pub connections: usize,
}

#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub offlined: Vec<DeviceId>,
    pub warned: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
}

pub struct DeviceRegistry {
    inner: RwLock<Inner>,
    events: Arc<EventRecorder>,
    next_conn_id: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(events: Arc<EventRecorder>) -> Self {
        DeviceRegistry {
            inner: RwLock::new(Inner::default()),
            events,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn new_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Placeholder group key for connections that register before sending
    /// an ICCID; the device migrates when the real ICCID arrives.
    pub fn synthetic_iccid(conn_id: u64) -> String {
        format!("conn:{conn_id}")
    }

    /// Bind a connection to the device identified by `physical_id`,
    /// creating or refreshing the device inside the `iccid` group.
    ///
    /// A new connection presenting an already-bound device replaces the
    /// prior binding; the displaced connection is asked to close.
    pub async fn bind(
        &self,
        conn: &ConnHandle,
        iccid: &str,
        physical_id: u32,
        firmware: Option<String>,
    ) -> BindOutcome {
        let device_id = DeviceId::from_physical(physical_id);
        let mut replaced = None;
        let reconnected;
        {
            let mut inner = self.inner.write().await;
            let was_offline = inner
                .devices
                .get(&device_id)
                .is_some_and(|d| d.status == DeviceStatus::Offline);

            // Retire an older connection holding this device.
            if let Some(old) = inner.device_to_conn.get(&device_id) {
                if old.conn_id != conn.conn_id {
                    let old = old.clone();
                    inner.conn_to_device.remove(&old.conn_id);
                    replaced = Some(old);
                }
            }
            // A connection re-registering as a different device drops its
            // previous binding.
            if let Some(prev) = inner.conn_to_device.insert(conn.conn_id, device_id) {
                if prev != device_id {
                    inner.device_to_conn.remove(&prev);
                }
            }
            inner.device_to_conn.insert(device_id, conn.clone());

            let old_iccid = inner
                .devices
                .get(&device_id)
                .map(|d| d.iccid.clone())
                .filter(|old| old != iccid);
            if let Some(old_iccid) = old_iccid {
                Self::remove_from_group(&mut inner.groups, &old_iccid, device_id);
            }
            let device = inner
                .devices
                .entry(device_id)
                .or_insert_with(|| Device::new(device_id, iccid.to_owned()));
            device.iccid = iccid.to_owned();
            if firmware.is_some() {
                device.firmware = firmware;
            }
            if device.status == DeviceStatus::Offline {
                device.status = DeviceStatus::Registered;
            }
            device.offline_since = None;
            device.warned_stale = false;
            reconnected = replaced.is_some() || was_offline;
            if reconnected {
                device.reconnect_count += 1;
            }
            inner.groups.entry(iccid.to_owned()).or_default().insert(device_id);
        }

        if let Some(old) = &replaced {
            info!(device_id = %device_id, old_conn = old.conn_id, new_conn = conn.conn_id,
                  "binding replaced by reconnect");
            old.request_close();
        }
        info!(device_id = %device_id, iccid, conn_id = conn.conn_id, "device registered");
        self.events
            .record(
                Event::new(EventType::DeviceRegister, device_id)
                    .with_data("iccid", iccid)
                    .with_data("conn_id", conn.conn_id)
                    .with_data("reconnect", reconnected),
            )
            .await;

        BindOutcome {
            device_id,
            replaced,
            reconnected,
        }
    }

    fn remove_from_group(groups: &mut HashMap<String, HashSet<DeviceId>>, iccid: &str, id: DeviceId) {
        if let Some(members) = groups.get_mut(iccid) {
            members.remove(&id);
            if members.is_empty() {
                groups.remove(iccid);
            }
        }
    }

    /// Move the device bound to `conn_id` into the group keyed by
    /// `new_iccid`. Used when an ICCID arrives on an already-bound
    /// connection (or after a synthetic-group registration).
    pub async fn migrate_iccid(&self, conn_id: u64, new_iccid: &str) -> Option<DeviceId> {
        let mut inner = self.inner.write().await;
        let device_id = *inner.conn_to_device.get(&conn_id)?;
        let old_iccid = inner.devices.get(&device_id)?.iccid.clone();
        if old_iccid == new_iccid {
            return Some(device_id);
        }
        Self::remove_from_group(&mut inner.groups, &old_iccid, device_id);
        inner.groups.entry(new_iccid.to_owned()).or_default().insert(device_id);
        if let Some(device) = inner.devices.get_mut(&device_id) {
            device.iccid = new_iccid.to_owned();
        }
        debug!(device_id = %device_id, from = %old_iccid, to = %new_iccid, "device group migrated");
        Some(device_id)
    }

    /// Remove the binding for a closed connection and mark its device
    /// offline. The device entry itself survives for the grace window.
    pub async fn unbind(&self, conn_id: u64) -> Option<DeviceId> {
        let device_id;
        {
            let mut inner = self.inner.write().await;
            device_id = inner.conn_to_device.remove(&conn_id)?;
            // Only clear the reverse mapping if it still points at us; a
            // reconnect may already have replaced it.
            let still_bound = inner
                .device_to_conn
                .get(&device_id)
                .is_some_and(|c| c.conn_id == conn_id);
            if !still_bound {
                return Some(device_id);
            }
            inner.device_to_conn.remove(&device_id);
            if let Some(device) = inner.devices.get_mut(&device_id) {
                device.status = DeviceStatus::Offline;
                device.offline_since = Some(Utc::now());
            }
        }
        info!(device_id = %device_id, conn_id, "device offline (connection closed)");
        self.events
            .record(
                Event::new(EventType::DeviceOffline, device_id)
                    .with_data("reason", "connection-closed"),
            )
            .await;
        Some(device_id)
    }

    /// Record an inbound heartbeat of any kind; promotes the device to
    /// Online on the first one.
    pub async fn record_heartbeat(&self, device_id: DeviceId, kind: HeartbeatKind) -> bool {
        let came_online;
        {
            let mut inner = self.inner.write().await;
            let Some(device) = inner.devices.get_mut(&device_id) else {
                return false;
            };
            device.last_heartbeat = Some(Utc::now());
            device.heartbeat_count += 1;
            device.warned_stale = false;
            came_online = device.status != DeviceStatus::Online;
            device.status = DeviceStatus::Online;
            device.offline_since = None;
        }
        if came_online {
            info!(device_id = %device_id, kind = kind.as_str(), "device online");
            self.events
                .record(
                    Event::new(EventType::DeviceOnline, device_id)
                        .with_data("heartbeat", kind.as_str()),
                )
                .await;
        }
        true
    }

    /// Count an outbound command against the device.
    pub async fn record_command(&self, device_id: DeviceId) {
        let mut inner = self.inner.write().await;
        if let Some(device) = inner.devices.get_mut(&device_id) {
            device.command_count += 1;
        }
    }

    /// Mark a device offline (stale heartbeat, administrative) and retire
    /// its connection if one is still bound.
    pub async fn mark_offline(&self, device_id: DeviceId, reason: &str) -> bool {
        let conn;
        {
            let mut inner = self.inner.write().await;
            let Some(device) = inner.devices.get_mut(&device_id) else {
                return false;
            };
            if device.status == DeviceStatus::Offline {
                return false;
            }
            device.status = DeviceStatus::Offline;
            device.offline_since = Some(Utc::now());
            conn = inner.device_to_conn.remove(&device_id);
            if let Some(conn) = &conn {
                inner.conn_to_device.remove(&conn.conn_id);
            }
        }
        if let Some(conn) = conn {
            conn.request_close();
        }
        warn!(device_id = %device_id, reason, "device offline");
        self.events
            .record(Event::new(EventType::DeviceOffline, device_id).with_data("reason", reason))
            .await;
        true
    }

    pub async fn connection_by_device(&self, device_id: DeviceId) -> Option<ConnHandle> {
        self.inner.read().await.device_to_conn.get(&device_id).cloned()
    }

    pub async fn device_by_conn(&self, conn_id: u64) -> Option<DeviceId> {
        self.inner.read().await.conn_to_device.get(&conn_id).copied()
    }

    pub async fn device(&self, device_id: DeviceId) -> Option<Device> {
        self.inner.read().await.devices.get(&device_id).cloned()
    }

    pub async fn list_online(&self) -> Vec<Device> {
        let inner = self.inner.read().await;
        let mut online: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Online)
            .cloned()
            .collect();
        online.sort_by_key(|d| d.id);
        online
    }

    /// Devices in the group keyed by `iccid`, if any.
    pub async fn group_devices(&self, iccid: &str) -> Vec<Device> {
        let inner = self.inner.read().await;
        let Some(members) = inner.groups.get(iccid) else {
            return Vec::new();
        };
        let mut devices: Vec<Device> = members
            .iter()
            .filter_map(|id| inner.devices.get(id).cloned())
            .collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            devices: inner.devices.len(),
            online: inner
                .devices
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .count(),
            groups: inner.groups.len(),
            connections: inner.conn_to_device.len(),
        }
    }

    /// One supervisor pass: offline stale devices, emit one-shot stale
    /// warnings, and garbage-collect offline devices past the grace window.
    pub async fn sweep(
        &self,
        offline_threshold: std::time::Duration,
        warning_threshold: std::time::Duration,
        grace_window: std::time::Duration,
    ) -> SweepOutcome {
        let now = Utc::now();
        let offline_cutoff = now - ChronoDuration::from_std(offline_threshold).unwrap_or_default();
        let warning_cutoff = now - ChronoDuration::from_std(warning_threshold).unwrap_or_default();
        let grace_cutoff = now - ChronoDuration::from_std(grace_window).unwrap_or_default();

        let mut outcome = SweepOutcome::default();
        {
            let mut inner = self.inner.write().await;
            for device in inner.devices.values_mut() {
                let last_seen = device.last_heartbeat.unwrap_or(device.registered_at);
                if device.status == DeviceStatus::Online && last_seen < offline_cutoff {
                    outcome.offlined.push(device.id);
                }
                if last_seen < warning_cutoff && !device.warned_stale {
                    device.warned_stale = true;
                    outcome.warned.push(device.id);
                }
            }
            let removable: Vec<DeviceId> = inner
                .devices
                .values()
                .filter(|d| {
                    d.status == DeviceStatus::Offline
                        && d.offline_since.is_some_and(|t| t < grace_cutoff)
                        && !inner.device_to_conn.contains_key(&d.id)
                })
                .map(|d| d.id)
                .collect();
            for id in removable {
                if let Some(device) = inner.devices.remove(&id) {
                    Self::remove_from_group(&mut inner.groups, &device.iccid, id);
                    outcome.removed.push(id);
                }
            }
        }

        for id in outcome.offlined.clone() {
            self.mark_offline(id, "heartbeat timeout").await;
        }
        for id in &outcome.warned {
            warn!(device_id = %id, "device heartbeat stale");
            self.events
                .record(
                    Event::new(EventType::DeviceError, *id).with_data("warning", "heartbeat-stale"),
                )
                .await;
        }
        for id in &outcome.removed {
            debug!(device_id = %id, "offline device garbage-collected");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventConfig;
    use std::time::Duration;

    fn recorder() -> (Arc<EventRecorder>, tokio::sync::mpsc::Receiver<Event>) {
        let cfg = EventConfig {
            ring_capacity: 100,
            queue_capacity: 100,
            workers: 1,
            debounce: Duration::from_millis(100),
            power_sample_rate: 1,
            subscriber_buffer: 16,
        };
        let (events, rx) = EventRecorder::new(&cfg);
        (Arc::new(events), rx)
    }

    fn registry() -> DeviceRegistry {
        let (events, _rx) = recorder();
        DeviceRegistry::new(events)
    }

    fn conn(registry: &DeviceRegistry) -> (ConnHandle, watch::Receiver<bool>) {
        let (client, _server) = tokio::io::duplex(256);
        let writer = ConnWriter::new(client, Duration::from_secs(1));
        ConnHandle::new(registry.new_conn_id(), "10.0.0.1:50000".to_owned(), writer)
    }

    const ICCID: &str = "89860404D91623904882";
    const PHYS: u32 = 0x04A2_28CD;

    #[tokio::test]
    async fn bind_creates_device_in_group() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        assert_eq!(outcome.device_id.to_string(), "04A228CD");
        assert!(!outcome.reconnected);
        assert!(outcome.replaced.is_none());

        let device = registry.device(outcome.device_id).await.unwrap();
        assert_eq!(device.iccid, ICCID);
        assert_eq!(device.status, DeviceStatus::Registered);
        let group = registry.group_devices(ICCID).await;
        assert_eq!(group.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_promotes_to_online() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        assert!(registry.list_online().await.is_empty());
        registry
            .record_heartbeat(outcome.device_id, HeartbeatKind::Device)
            .await;
        let online = registry.list_online().await;
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].heartbeat_count, 1);
        assert!(online[0].last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn reconnect_replaces_binding_and_closes_old_connection() {
        let registry = registry();
        let (old, mut old_close) = conn(&registry);
        registry.bind(&old, ICCID, PHYS, None).await;

        let (new, _rx) = conn(&registry);
        let outcome = registry.bind(&new, ICCID, PHYS, None).await;
        assert!(outcome.reconnected);
        assert_eq!(outcome.replaced.as_ref().unwrap().conn_id, old.conn_id);
        // Old session sees the close request.
        assert!(old_close.has_changed().unwrap());

        // Mapping now points at the new connection.
        let bound = registry.connection_by_device(outcome.device_id).await.unwrap();
        assert_eq!(bound.conn_id, new.conn_id);
        assert_eq!(
            registry.device(outcome.device_id).await.unwrap().reconnect_count,
            1
        );
    }

    #[tokio::test]
    async fn stale_unbind_from_replaced_connection_is_harmless() {
        let registry = registry();
        let (old, _c1) = conn(&registry);
        registry.bind(&old, ICCID, PHYS, None).await;
        let (new, _c2) = conn(&registry);
        let outcome = registry.bind(&new, ICCID, PHYS, None).await;
        registry
            .record_heartbeat(outcome.device_id, HeartbeatKind::Device)
            .await;

        // The displaced session eventually closes and unbinds.
        registry.unbind(old.conn_id).await;

        // The device stays online through the new connection.
        assert_eq!(registry.list_online().await.len(), 1);
        assert!(registry.connection_by_device(outcome.device_id).await.is_some());
    }

    #[tokio::test]
    async fn unbind_marks_offline_but_keeps_the_device() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        registry
            .record_heartbeat(outcome.device_id, HeartbeatKind::Device)
            .await;

        registry.unbind(handle.conn_id).await;
        let device = registry.device(outcome.device_id).await.unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
        assert!(device.offline_since.is_some());
        assert!(registry.list_online().await.is_empty());
        assert!(registry.connection_by_device(outcome.device_id).await.is_none());
    }

    #[tokio::test]
    async fn synthetic_group_then_migration() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let synthetic = DeviceRegistry::synthetic_iccid(handle.conn_id);
        let outcome = registry.bind(&handle, &synthetic, PHYS, None).await;
        assert_eq!(registry.group_devices(&synthetic).await.len(), 1);

        registry.migrate_iccid(handle.conn_id, ICCID).await.unwrap();
        assert!(registry.group_devices(&synthetic).await.is_empty());
        assert_eq!(registry.group_devices(ICCID).await.len(), 1);
        assert_eq!(registry.device(outcome.device_id).await.unwrap().iccid, ICCID);
    }

    #[tokio::test]
    async fn rebind_with_new_iccid_moves_group() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        registry.bind(&handle, ICCID, PHYS, None).await;
        let other = "89860404D91623904899";
        let (handle2, _rx2) = conn(&registry);
        registry.bind(&handle2, other, PHYS, None).await;
        assert!(registry.group_devices(ICCID).await.is_empty());
        assert_eq!(registry.group_devices(other).await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_offlines_stale_devices() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        registry
            .record_heartbeat(outcome.device_id, HeartbeatKind::Device)
            .await;

        // Zero threshold: everything is stale.
        let swept = registry
            .sweep(Duration::ZERO, Duration::from_secs(300), Duration::from_secs(600))
            .await;
        assert_eq!(swept.offlined, vec![outcome.device_id]);
        assert_eq!(
            registry.device(outcome.device_id).await.unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn sweep_warns_once() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        let swept = registry
            .sweep(Duration::from_secs(600), Duration::ZERO, Duration::from_secs(600))
            .await;
        assert_eq!(swept.warned, vec![outcome.device_id]);
        let swept_again = registry
            .sweep(Duration::from_secs(600), Duration::ZERO, Duration::from_secs(600))
            .await;
        assert!(swept_again.warned.is_empty());
    }

    #[tokio::test]
    async fn sweep_removes_offline_devices_after_grace() {
        let registry = registry();
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        registry.unbind(handle.conn_id).await;

        let swept = registry
            .sweep(Duration::from_secs(600), Duration::from_secs(600), Duration::ZERO)
            .await;
        assert_eq!(swept.removed, vec![outcome.device_id]);
        assert!(registry.device(outcome.device_id).await.is_none());
        // Group disappears with its last device.
        assert!(registry.group_devices(ICCID).await.is_empty());
        assert_eq!(registry.stats().await.groups, 0);
    }

    #[tokio::test]
    async fn events_emitted_for_lifecycle() {
        let (events, mut rx) = recorder();
        let registry = DeviceRegistry::new(events);
        let (handle, _rx) = conn(&registry);
        let outcome = registry.bind(&handle, ICCID, PHYS, None).await;
        registry
            .record_heartbeat(outcome.device_id, HeartbeatKind::Device)
            .await;
        registry.unbind(handle.conn_id).await;

        let kinds: Vec<EventType> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.event_type)
        .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::DeviceRegister,
                EventType::DeviceOnline,
                EventType::DeviceOffline
            ]
        );
    }

    #[tokio::test]
    async fn conn_ids_are_monotonic() {
        let registry = registry();
        let a = registry.new_conn_id();
        let b = registry.new_conn_id();
        assert!(b > a);
    }
}
