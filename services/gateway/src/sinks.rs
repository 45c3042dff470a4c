//! Webhook sink dispatch.
//!
//! Consumes the recorder's sink queue and fans every event out to the
//! enabled endpoints subscribed to its type. Port-status-change events are
//! coalesced per (device, port) within the debounce window so rapid flaps
//! deliver only the latest state; power heartbeats may be sampled 1-in-N;
//! per-endpoint throttles cap events per second. Delivery retries on 5xx
//! and network errors with exponential back-off; 4xx is permanent.

use crate::config::{EndpointConfig, EventConfig, GatewayConfig};
use cg_protocol::{Event, EventType};
use dny_core::DeviceId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Delivery attempts per endpoint (first try included).
const MAX_ATTEMPTS: u32 = 3;
/// First retry delay.
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Retry delay ceiling.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// How long shutdown waits for queued events to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct SinkStats {
    pub delivered: AtomicU64,
    pub retried: AtomicU64,
    pub failed_permanent: AtomicU64,
    pub failed_exhausted: AtomicU64,
    pub dropped_sampled: AtomicU64,
    pub dropped_throttled: AtomicU64,
    pub debounce_coalesced: AtomicU64,
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

struct Throttle {
    window_start: Instant,
    count: u32,
}

struct Endpoint {
    cfg: EndpointConfig,
    client: reqwest::Client,
    headers: reqwest::header::HeaderMap,
    throttle: Mutex<Throttle>,
}

impl Endpoint {
    fn new(cfg: EndpointConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &cfg.headers {
            let Ok(name) = reqwest::header::HeaderName::try_from(name.as_str()) else {
                warn!(endpoint = %cfg.name, header = %name, "ignoring invalid header name");
                continue;
            };
            let Ok(value) = reqwest::header::HeaderValue::try_from(value.as_str()) else {
                warn!(endpoint = %cfg.name, header = %name, "ignoring invalid header value");
                continue;
            };
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .unwrap_or_default();
        Endpoint {
            cfg,
            client,
            headers,
            throttle: Mutex::new(Throttle {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Per-endpoint events/second cap. Returns false when over budget.
    async fn admit(&self) -> bool {
        if self.cfg.max_events_per_s == 0 {
            return true;
        }
        let mut throttle = self.throttle.lock().await;
        let now = Instant::now();
        if now.duration_since(throttle.window_start) >= Duration::from_secs(1) {
            throttle.window_start = now;
            throttle.count = 0;
        }
        if throttle.count >= self.cfg.max_events_per_s {
            return false;
        }
        throttle.count += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

type DebounceKey = (DeviceId, Option<u8>);

pub struct SinkDispatcher {
    endpoints: Vec<Arc<Endpoint>>,
    events_cfg: EventConfig,
    workers: Arc<Semaphore>,
    stats: Arc<SinkStats>,
    power_counter: AtomicU64,
}

impl SinkDispatcher {
    pub fn new(cfg: &GatewayConfig) -> Self {
        SinkDispatcher {
            endpoints: cfg
                .endpoints
                .iter()
                .filter(|e| e.enabled)
                .cloned()
                .map(|e| Arc::new(Endpoint::new(e)))
                .collect(),
            events_cfg: cfg.events.clone(),
            workers: Arc::new(Semaphore::new(cfg.events.workers)),
            stats: Arc::new(SinkStats::default()),
            power_counter: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        self.stats.clone()
    }

    /// Drain the sink queue until shutdown, then finish with a bounded
    /// drain pass.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut pending: HashMap<DebounceKey, (Event, Instant)> = HashMap::new();
        let flush_period = (self.events_cfg.debounce / 2).max(Duration::from_millis(10));
        let mut flush = tokio::time::interval(flush_period);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
                _ = flush.tick() => {
                    self.flush_expired(&mut pending, Instant::now()).await;
                }
                maybe = rx.recv() => {
                    match maybe {
                        None => break,
                        Some(event) => self.intake(event, &mut pending).await,
                    }
                }
            }
        }

        // Shutdown: flush every coalesced event, deliver what is already
        // queued, then wait for in-flight deliveries up to the deadline.
        let deadline = Instant::now() + DRAIN_DEADLINE;
        let keys: Vec<DebounceKey> = pending.keys().copied().collect();
        for key in keys {
            if let Some((event, _)) = pending.remove(&key) {
                self.dispatch(event).await;
            }
        }
        while let Ok(event) = rx.try_recv() {
            self.dispatch(event).await;
            if Instant::now() >= deadline {
                break;
            }
        }
        let _ = tokio::time::timeout_at(
            deadline,
            self.workers.acquire_many(self.events_cfg.workers as u32),
        )
        .await;
        debug!("sink dispatcher stopped");
    }

    async fn intake(&self, event: Event, pending: &mut HashMap<DebounceKey, (Event, Instant)>) {
        // 1-in-N sampling of power heartbeats.
        if event.event_type == EventType::PowerHeartbeat && self.events_cfg.power_sample_rate > 1 {
            let n = self.power_counter.fetch_add(1, Ordering::Relaxed);
            if n % u64::from(self.events_cfg.power_sample_rate) != 0 {
                self.stats.dropped_sampled.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        // Coalesce port status flaps; the latest state wins.
        if event.event_type == EventType::PortStatusChange {
            let key = (event.device_id, event.port_number);
            let deadline = Instant::now() + self.events_cfg.debounce;
            if pending.insert(key, (event, deadline)).is_some() {
                self.stats.debounce_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        self.dispatch(event).await;
    }

    async fn flush_expired(
        &self,
        pending: &mut HashMap<DebounceKey, (Event, Instant)>,
        now: Instant,
    ) {
        let expired: Vec<DebounceKey> = pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some((event, _)) = pending.remove(&key) {
                self.dispatch(event).await;
            }
        }
    }

    /// Route one event to every subscribed endpoint.
    async fn dispatch(&self, event: Event) {
        for endpoint in &self.endpoints {
            if !endpoint.cfg.accepts(event.event_type) {
                continue;
            }
            if !endpoint.admit().await {
                self.stats.dropped_throttled.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let endpoint = endpoint.clone();
            let event = event.clone();
            let stats = self.stats.clone();
            let workers = self.workers.clone();
            tokio::spawn(async move {
                let Ok(_permit) = workers.acquire().await else {
                    return;
                };
                deliver(&endpoint, &event, &stats).await;
            });
        }
    }
}

/// POST one event to one endpoint, with bounded retries.
async fn deliver(endpoint: &Endpoint, event: &Event, stats: &SinkStats) {
    let mut delay = INITIAL_RETRY_DELAY;
    for attempt in 1..=MAX_ATTEMPTS {
        let result = endpoint
            .client
            .post(&endpoint.cfg.url)
            .headers(endpoint.headers.clone())
            .json(event)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(response) if response.status().is_client_error() => {
                stats.failed_permanent.fetch_add(1, Ordering::Relaxed);
                warn!(endpoint = %endpoint.cfg.name, status = %response.status(),
                      event_type = %event.event_type, "webhook rejected, not retrying");
                return;
            }
            Ok(response) => {
                warn!(endpoint = %endpoint.cfg.name, status = %response.status(), attempt,
                      "webhook server error");
            }
            Err(e) => {
                warn!(endpoint = %endpoint.cfg.name, error = %e, attempt, "webhook send failed");
            }
        }

        if attempt < MAX_ATTEMPTS {
            stats.retried.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }
    stats.failed_exhausted.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex as StdMutex;

    const DEV: DeviceId = DeviceId::from_physical(0x04A2_28CD);

    #[derive(Clone, Default)]
    struct Hook {
        seen: Arc<StdMutex<Vec<serde_json::Value>>>,
        /// Number of requests to fail with 500 before succeeding.
        fail_first: Arc<AtomicU64>,
    }

    async fn hook_handler(
        State(hook): State<Hook>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        if hook
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        hook.seen.lock().unwrap().push(body);
        StatusCode::OK
    }

    async fn reject_handler() -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    async fn spawn_hook(hook: Hook, reject: bool) -> String {
        let app = if reject {
            Router::new().route("/hook", post(reject_handler))
        } else {
            Router::new().route("/hook", post(hook_handler)).with_state(hook)
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn gateway_cfg(endpoints: Vec<EndpointConfig>) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.events.debounce = Duration::from_millis(50);
        cfg.endpoints = endpoints;
        cfg
    }

    fn endpoint(url: String, event_types: Vec<EventType>) -> EndpointConfig {
        EndpointConfig {
            name: "test".to_owned(),
            url,
            enabled: true,
            event_types,
            headers: HashMap::new(),
            timeout: Duration::from_secs(2),
            max_events_per_s: 0,
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn start(cfg: GatewayConfig) -> (mpsc::Sender<Event>, Arc<SinkStats>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(64);
        let dispatcher = Arc::new(SinkDispatcher::new(&cfg));
        let stats = dispatcher.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(dispatcher.run(rx, shutdown_rx));
        (tx, stats, shutdown_tx)
    }

    #[tokio::test]
    async fn subscribed_events_are_delivered_with_the_envelope() {
        let hook = Hook::default();
        let url = spawn_hook(hook.clone(), false).await;
        let cfg = gateway_cfg(vec![endpoint(url, vec![EventType::ChargingStart])]);
        let (tx, stats, _shutdown) = start(cfg);

        tx.send(
            Event::new(EventType::ChargingStart, DEV)
                .with_port(1)
                .with_data("order_no", "ORDER001"),
        )
        .await
        .unwrap();

        wait_for("delivery", || {
            stats.delivered.load(Ordering::Relaxed) == 1
        })
        .await;
        let seen = hook.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["event_type"], "charging_start");
        assert_eq!(seen[0]["device_id"], "04A228CD");
        assert_eq!(seen[0]["port_number"], 1);
        assert_eq!(seen[0]["data"]["order_no"], "ORDER001");
    }

    #[tokio::test]
    async fn unsubscribed_events_never_appear() {
        let hook = Hook::default();
        let url = spawn_hook(hook.clone(), false).await;
        let cfg = gateway_cfg(vec![endpoint(url, vec![EventType::ChargingStart])]);
        let (tx, stats, _shutdown) = start(cfg);

        tx.send(Event::new(EventType::DeviceOnline, DEV)).await.unwrap();
        tx.send(Event::new(EventType::ChargingStart, DEV)).await.unwrap();

        wait_for("delivery", || {
            stats.delivered.load(Ordering::Relaxed) == 1
        })
        .await;
        let seen = hook.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["event_type"], "charging_start");
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let hook = Hook::default();
        hook.fail_first.store(2, Ordering::SeqCst);
        let url = spawn_hook(hook.clone(), false).await;
        let cfg = gateway_cfg(vec![endpoint(url, vec![])]);
        let (tx, stats, _shutdown) = start(cfg);

        tx.send(Event::new(EventType::DeviceOnline, DEV)).await.unwrap();

        // Two 500s, then success on the third attempt (~3 s of back-off).
        for _ in 0..60 {
            if stats.delivered.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 1);
        assert_eq!(stats.retried.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn client_errors_are_permanent() {
        let url = spawn_hook(Hook::default(), true).await;
        let cfg = gateway_cfg(vec![endpoint(url, vec![])]);
        let (tx, stats, _shutdown) = start(cfg);

        tx.send(Event::new(EventType::DeviceOnline, DEV)).await.unwrap();
        wait_for("permanent failure", || {
            stats.failed_permanent.load(Ordering::Relaxed) == 1
        })
        .await;
        assert_eq!(stats.retried.load(Ordering::Relaxed), 0);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn port_status_flaps_coalesce_to_latest() {
        let hook = Hook::default();
        let url = spawn_hook(hook.clone(), false).await;
        let cfg = gateway_cfg(vec![endpoint(url, vec![EventType::PortStatusChange])]);
        let (tx, stats, _shutdown) = start(cfg);

        for to in ["plugged", "idle", "charging"] {
            tx.send(
                Event::new(EventType::PortStatusChange, DEV)
                    .with_port(1)
                    .with_data("to", to),
            )
            .await
            .unwrap();
        }

        wait_for("debounced delivery", || {
            stats.delivered.load(Ordering::Relaxed) == 1
        })
        .await;
        assert_eq!(stats.debounce_coalesced.load(Ordering::Relaxed), 2);
        let seen = hook.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["data"]["to"], "charging");
    }

    #[tokio::test]
    async fn power_heartbeats_are_sampled() {
        let hook = Hook::default();
        let url = spawn_hook(hook.clone(), false).await;
        let mut cfg = gateway_cfg(vec![endpoint(url, vec![EventType::PowerHeartbeat])]);
        cfg.events.power_sample_rate = 5;
        let (tx, stats, _shutdown) = start(cfg);

        for _ in 0..10 {
            tx.send(Event::new(EventType::PowerHeartbeat, DEV)).await.unwrap();
        }
        wait_for("sampled deliveries", || {
            stats.delivered.load(Ordering::Relaxed) == 2
        })
        .await;
        assert_eq!(stats.dropped_sampled.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn throttle_caps_events_per_second() {
        let hook = Hook::default();
        let url = spawn_hook(hook.clone(), false).await;
        let mut ep = endpoint(url, vec![]);
        ep.max_events_per_s = 2;
        let cfg = gateway_cfg(vec![ep]);
        let (tx, stats, _shutdown) = start(cfg);

        for _ in 0..6 {
            tx.send(Event::new(EventType::DeviceOnline, DEV)).await.unwrap();
        }
        wait_for("throttled deliveries", || {
            stats.delivered.load(Ordering::Relaxed) == 2
                && stats.dropped_throttled.load(Ordering::Relaxed) == 4
        })
        .await;
    }
}
