//! HTTP control plane for business systems.
//!
//! Routes:
//!   GET  /healthz                      - always 200 (process is running)
//!   GET  /readyz                       - 200 once serving
//!   GET  /api/v1/devices               - online devices (paged)
//!   GET  /api/v1/device/{id}/status    - device detail with port states
//!   POST /api/v1/device/locate         - beep/blink a device
//!   POST /api/v1/charging/start        - create order + dispatch 0x82
//!   POST /api/v1/charging/stop         - validate + dispatch stop
//!   POST /api/v1/charging/update_power - overload-power update
//!   GET  /api/v1/notifications/recent  - recent-events ring
//!   GET  /api/v1/notifications/stream  - SSE live event stream
//!   GET  /api/v1/stats                 - per-subsystem counters
//!
//! The (device, order-no) idempotency guard here is an HTTP concern: a
//! duplicate start submission within the TTL gets 409 without touching
//! the order manager, which stays authoritative for domain idempotency.

use crate::dispatcher::SendError;
use crate::gateway::{Gateway, OpError, StartOutcome};
use crate::orders::OrderError;
use crate::sinks::SinkStats;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cg_protocol::{
    CommandAccepted, DeviceDetailResponse, DeviceListResponse, DeviceSummary, ErrorBody,
    LocateRequest, StartChargingRequest, StopChargingRequest, UpdatePowerRequest,
};
use dny_core::DeviceId;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub sink_stats: Arc<SinkStats>,
    /// (device_id, order_no) -> submission time, for the duplicate guard.
    start_guard: Mutex<HashMap<(String, String), Instant>>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, sink_stats: Arc<SinkStats>) -> Arc<Self> {
        Arc::new(AppState {
            gateway,
            sink_stats,
            start_guard: Mutex::new(HashMap::new()),
        })
    }

    /// Returns false when this (device, order) pair was submitted within
    /// the TTL. Expired entries are purged on the way through.
    async fn admit_start(&self, device_id: &str, order_no: &str) -> bool {
        let ttl = self.gateway.config.http.idempotency_ttl;
        let now = Instant::now();
        let mut guard = self.start_guard.lock().await;
        guard.retain(|_, at| now.duration_since(*at) < ttl);
        let key = (device_id.to_owned(), order_no.to_owned());
        if guard.contains_key(&key) {
            return false;
        }
        guard.insert(key, now);
        true
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/device/{id}/status", get(device_status))
        .route("/api/v1/device/locate", post(locate))
        .route("/api/v1/charging/start", post(charging_start))
        .route("/api/v1/charging/stop", post(charging_stop))
        .route("/api/v1/charging/update_power", post(update_power))
        .route("/api/v1/notifications/recent", get(recent_notifications))
        .route("/api/v1/notifications/stream", get(crate::sse::event_stream))
        .route("/api/v1/stats", get(stats))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control API until shutdown.
pub async fn serve(
    state: Arc<AppState>,
    listener: tokio::net::TcpListener,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        })
        .await;
    if let Err(e) = result {
        tracing::error!(error = %e, "control api server error");
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.code.to_owned(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<OpError> for ApiError {
    fn from(err: OpError) -> Self {
        let message = err.to_string();
        match err {
            OpError::BadDeviceId(_) => ApiError::new(StatusCode::BAD_REQUEST, "bad_device_id", message),
            OpError::BadPort => ApiError::new(StatusCode::BAD_REQUEST, "bad_port", message),
            OpError::Order(OrderError::Conflict { .. }) => {
                ApiError::new(StatusCode::CONFLICT, "conflict", message)
            }
            OpError::Order(OrderError::OrderMismatch) => {
                ApiError::new(StatusCode::CONFLICT, "order_mismatch", message)
            }
            OpError::Order(OrderError::WrongState { .. }) => {
                ApiError::new(StatusCode::CONFLICT, "wrong_state", message)
            }
            OpError::Order(OrderError::NoActiveOrder) => {
                ApiError::new(StatusCode::NOT_FOUND, "no_active_order", message)
            }
            OpError::Order(OrderError::BadOrderNo) => {
                ApiError::new(StatusCode::BAD_REQUEST, "bad_order_no", message)
            }
            OpError::Send(SendError::NotOnline) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_online", message)
            }
            OpError::Send(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "dispatch_failed", message)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz() -> &'static str {
    "ready"
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Json<DeviceListResponse> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50).clamp(1, 500);
    let online = state.gateway.registry.list_online().await;
    let total = online.len();
    let mut devices = Vec::new();
    for d in online.into_iter().skip((page - 1) * page_size).take(page_size) {
        let remote_addr = state
            .gateway
            .registry
            .connection_by_device(d.id)
            .await
            .map(|c| c.remote_addr);
        devices.push(DeviceSummary {
            device_id: d.id,
            status: d.status,
            last_heartbeat: d.last_heartbeat,
            iccid: d.iccid,
            remote_addr,
        });
    }
    Json(DeviceListResponse {
        devices,
        total,
        page,
        page_size,
    })
}

async fn device_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeviceDetailResponse>, ApiError> {
    let device_id = DeviceId::parse(&id)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "bad_device_id", e.to_string()))?;
    let device = state
        .gateway
        .registry
        .device(device_id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_device", "device not found"))?;
    let ports = state.gateway.ports.snapshot(device_id).await;
    Ok(Json(DeviceDetailResponse {
        device_id: device.id,
        iccid: device.iccid,
        status: device.status,
        last_heartbeat: device.last_heartbeat,
        reconnect_count: device.reconnect_count,
        heartbeat_count: device.heartbeat_count,
        command_count: device.command_count,
        firmware: device.firmware,
        ports,
    }))
}

async fn locate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LocateRequest>,
) -> Result<Json<CommandAccepted>, ApiError> {
    state.gateway.locate(&req).await?;
    Ok(Json(CommandAccepted {
        device_id: req.device_id,
        order_no: None,
    }))
}

async fn charging_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartChargingRequest>,
) -> Result<Json<CommandAccepted>, ApiError> {
    if !state.admit_start(&req.device_id, &req.order_no).await {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "duplicate_submission",
            "this order was already submitted moments ago",
        ));
    }
    let outcome = state.gateway.start_charging(&req).await?;
    debug!(device_id = %req.device_id, order_no = %req.order_no, ?outcome, "start accepted");
    Ok(Json(CommandAccepted {
        device_id: req.device_id,
        order_no: Some(req.order_no),
    }))
}

async fn charging_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StopChargingRequest>,
) -> Result<Json<CommandAccepted>, ApiError> {
    state.gateway.stop_charging(&req).await?;
    Ok(Json(CommandAccepted {
        device_id: req.device_id,
        order_no: req.order_no,
    }))
}

async fn update_power(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdatePowerRequest>,
) -> Result<Json<CommandAccepted>, ApiError> {
    state.gateway.update_power(&req).await?;
    Ok(Json(CommandAccepted {
        device_id: req.device_id,
        order_no: None,
    }))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_notifications(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = state.gateway.events.recent(limit);
    let count = events.len();
    Json(serde_json::json!({ "events": events, "count": count }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let gateway = &state.gateway;
    let registry = gateway.registry.stats().await;
    let orders = gateway.orders.stats().await;
    let events = gateway.events.stats();
    let acks = gateway.acks.stats();
    let sinks = &state.sink_stats;
    Json(serde_json::json!({
        "registry": registry,
        "orders": orders,
        "protocol_errors": gateway.protocol_errors.load(Ordering::Relaxed),
        "events": {
            "recorded": events.recorded.load(Ordering::Relaxed),
            "dropped_telemetry": events.dropped_telemetry.load(Ordering::Relaxed),
            "dropped_lifecycle": events.dropped_lifecycle.load(Ordering::Relaxed),
        },
        "acks": {
            "registered": acks.registered.load(Ordering::Relaxed),
            "completed": acks.completed.load(Ordering::Relaxed),
            "reissued": acks.reissued.load(Ordering::Relaxed),
            "timed_out": acks.timed_out.load(Ordering::Relaxed),
            "unmatched": acks.unmatched.load(Ordering::Relaxed),
        },
        "sinks": {
            "delivered": sinks.delivered.load(Ordering::Relaxed),
            "retried": sinks.retried.load(Ordering::Relaxed),
            "failed_permanent": sinks.failed_permanent.load(Ordering::Relaxed),
            "failed_exhausted": sinks.failed_exhausted.load(Ordering::Relaxed),
            "dropped_sampled": sinks.dropped_sampled.load(Ordering::Relaxed),
            "dropped_throttled": sinks.dropped_throttled.load(Ordering::Relaxed),
            "debounce_coalesced": sinks.debounce_coalesced.load(Ordering::Relaxed),
        },
    }))
}
