//! Axum-based HTTP + WebSocket gateway in front of the hub.
//!
//! - `GET /ws` carries one persistent connection per device. The first
//!   envelope must be `authentication` with a token from `/api/auth/token`.
//! - REST endpoints cover registration, token issue, one-shot message
//!   submission, device status, sync history, conflicts and metrics.
//! - Request bodies are size-limited and requests time out, both from
//!   `[gateway]` config.

use crate::auth::TokenClaims;
use crate::collab::StoreQuery;
use crate::envelope::MessageEnvelope;
use crate::error::HubError;
use crate::hub::connection::{ConnectionHandle, ConnectionState};
use crate::hub::{error_kind, Hub};
use crate::registry::DeviceDescriptor;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

/// Header carrying the enrollment secret or startup pairing code.
const PAIRING_HEADER: &str = "x-pairing-code";

/// Concrete return type for JSON handlers.
type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Build the router with all routes and middleware.
pub fn build_router(hub: Arc<Hub>) -> Router {
    let gateway = hub.config().gateway.clone();

    // ── CORS: web and desktop clients connect from any origin ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(PAIRING_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/ws", get(handle_ws))
        .route("/api/devices", post(handle_register_device))
        .route("/api/devices", get(handle_list_devices))
        .route("/api/devices/{device_id}/status", get(handle_device_status))
        .route("/api/auth/token", post(handle_issue_token))
        .route("/api/messages", post(handle_submit_message))
        .route("/api/stats", get(handle_stats))
        .route("/api/sync/history", get(handle_sync_history))
        .route("/api/conflicts", get(handle_list_conflicts))
        .route(
            "/api/conflicts/{conflict_id}/resolve",
            post(handle_resolve_conflict),
        )
        .with_state(AppState { hub })
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(gateway.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(gateway.request_timeout_secs),
        ))
}

/// Bind and serve until `shutdown` is cancelled.
pub async fn run_gateway(hub: Arc<Hub>, shutdown: CancellationToken) -> Result<()> {
    let host = hub.config().gateway.host.clone();
    let port = hub.config().gateway.port;
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let actual = listener.local_addr()?;
    tracing::info!(address = %actual, "Gateway listening");

    let app = build_router(hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Gateway stopped");
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// ERRORS & AUTH
// ══════════════════════════════════════════════════════════════════════════════

fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::Validation(_) => StatusCode::BAD_REQUEST,
        HubError::Authentication(_) => StatusCode::UNAUTHORIZED,
        HubError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        HubError::NotAccepting => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &HubError) -> ApiResponse {
    (
        status_for(err),
        Json(json!({
            "error": err.to_string(),
            "kind": error_kind(err),
        })),
    )
}

fn bad_json(err: impl std::fmt::Display) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("Invalid JSON: {err}"), "kind": "validation"})),
    )
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn require_token(state: &AppState, headers: &HeaderMap) -> Result<TokenClaims, ApiResponse> {
    let token = extract_bearer_token(headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing Authorization header", "kind": "authentication"})),
        )
    })?;
    state
        .hub
        .authenticate_token(token)
        .map_err(|e| error_response(&e))
}

// ══════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(json!({
        "status": if stats.accepting { "ok" } else { "draining" },
        "devices": stats.devices,
        "connections": stats.connections,
        "queue_depth": stats.queue.queued,
    }))
}

/// GET /metrics: Prometheus text exposition
async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.hub.metrics().render(),
    )
}

/// GET /api/stats
async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}

#[derive(Deserialize)]
struct RegisterDeviceBody {
    #[serde(flatten)]
    device: DeviceDescriptor,
    #[serde(default)]
    secret: Option<String>,
}

/// POST /api/devices: register or update a device
///
/// The secret comes from the body or the `X-Pairing-Code` header. The
/// response carries the device key used for `/api/auth/token`.
async fn handle_register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RegisterDeviceBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(e),
    };
    let secret = body.secret.as_deref().or_else(|| {
        headers
            .get(PAIRING_HEADER)
            .and_then(|v| v.to_str().ok())
    });
    match state.hub.register_device(body.device, secret).await {
        Ok(enrollment) => {
            let status = if enrollment.handle.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(json!(enrollment)))
        }
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct TokenBody {
    user_id: String,
    device_id: String,
    #[serde(default)]
    device_key: Option<String>,
}

/// POST /api/auth/token: bounded-lifetime token for a registered device
async fn handle_issue_token(
    State(state): State<AppState>,
    body: Result<Json<TokenBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(e),
    };
    match state
        .hub
        .issue_token(&body.user_id, &body.device_id, body.device_key.as_deref())
    {
        Ok(issued) => (StatusCode::OK, Json(json!(issued))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/messages: submit one envelope with a bearer token
async fn handle_submit_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<MessageEnvelope>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let Some(token) = extract_bearer_token(&headers) else {
        return error_response(&HubError::auth("Missing Authorization header"));
    };
    let Json(envelope) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(e),
    };
    let message_id = envelope.id.clone();
    match state.hub.accept_with_token(token, envelope).await {
        Ok(reply) => (
            StatusCode::OK,
            Json(json!({"accepted": true, "message_id": message_id, "reply": reply})),
        ),
        Err(e) => {
            tracing::debug!(message_id = %message_id, "Message rejected: {e}");
            error_response(&e)
        }
    }
}

/// GET /api/devices: devices of the token's user
async fn handle_list_devices(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let claims = match require_token(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let devices = state.hub.devices_for_user(&claims.user_id);
    (StatusCode::OK, Json(json!({"devices": devices})))
}

/// GET /api/devices/{device_id}/status
async fn handle_device_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> ApiResponse {
    let claims = match require_token(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.hub.device_status(&claims.user_id, &device_id) {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => error_response(&e),
    }
}

/// GET /api/sync/history: stored items of the token's user, newest first
async fn handle_sync_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(mut query): Query<StoreQuery>,
) -> ApiResponse {
    let claims = match require_token(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    query.user_id = Some(claims.user_id);
    query.limit = query.limit.clamp(1, 1000);
    match state.hub.services().store.query(&query).await {
        Ok(items) => (StatusCode::OK, Json(json!({"items": items}))),
        Err(e) => {
            tracing::warn!("History query failed: {e}");
            error_response(&HubError::Store(e.to_string()))
        }
    }
}

/// GET /api/conflicts: conflicts waiting for a manual decision
async fn handle_list_conflicts(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let claims = match require_token(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let conflicts = state.hub.conflicts_awaiting_review(&claims.user_id);
    (StatusCode::OK, Json(json!({"conflicts": conflicts})))
}

#[derive(Deserialize)]
struct ResolveBody {
    winning_item_id: String,
}

/// POST /api/conflicts/{conflict_id}/resolve
async fn handle_resolve_conflict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conflict_id): Path<String>,
    body: Result<Json<ResolveBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    let claims = match require_token(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(e),
    };
    match state
        .hub
        .decide_conflict(&claims.user_id, &conflict_id, &body.winning_item_id)
    {
        Ok(operation_id) => (
            StatusCode::OK,
            Json(json!({"resolved": true, "operation_id": operation_id})),
        ),
        Err(e) => error_response(&e),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// WEBSOCKET
// ══════════════════════════════════════════════════════════════════════════════

/// GET /ws: upgrade to a persistent device connection
async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let handle = match state.hub.open_connection() {
        Ok(h) => h,
        Err(e) => return error_response(&e).into_response(),
    };
    let max = state.hub.config().gateway.max_body_bytes;
    let hub = state.hub.clone();
    ws.max_message_size(max)
        .on_upgrade(move |socket| handle_ws_session(socket, hub, handle))
}

/// Drive one WebSocket until either side closes it.
async fn handle_ws_session(socket: WebSocket, hub: Arc<Hub>, handle: ConnectionHandle) {
    use futures_util::{SinkExt, StreamExt};

    let ConnectionHandle {
        id: conn_id,
        outbound,
        mut inbound,
        closed,
    } = handle;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Forward envelopes routed to this connection. Whatever is already
    // buffered when the hub closes the connection still goes out.
    let send_closed = closed.clone();
    let send_conn = conn_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                next = inbound.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
                () = send_closed.cancelled() => {
                    while let Ok(envelope) = inbound.try_recv() {
                        if !send_envelope(&mut ws_sender, &envelope).await {
                            break;
                        }
                    }
                    break;
                }
            };
            if !send_envelope(&mut ws_sender, &envelope).await {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        tracing::trace!(connection = %send_conn, "WebSocket sender finished");
    });

    let auth_deadline = tokio::time::Instant::now() + hub.auth_timeout();
    loop {
        let authenticated =
            hub.connections().state(&conn_id) == Some(ConnectionState::Connected);
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            () = closed.cancelled() => break,
            () = tokio::time::sleep_until(auth_deadline), if !authenticated => {
                tracing::warn!(connection = %conn_id, "WebSocket did not authenticate in time");
                break;
            }
        };
        let Some(Ok(msg)) = next else { break };

        match msg {
            Message::Text(text) => {
                let reply = match MessageEnvelope::from_json(text.as_str()) {
                    Ok(envelope) => {
                        let user_id = envelope.user_id.clone();
                        let message_id = envelope.id.clone();
                        match hub.accept_on(&conn_id, envelope).await {
                            Ok(reply) => reply,
                            Err(e) => {
                                tracing::debug!(connection = %conn_id, message_id = %message_id, "Envelope rejected: {e}");
                                hub.error_envelope(&user_id, Some(&message_id), &e)
                            }
                        }
                    }
                    Err(e) => hub.error_envelope("", None, &HubError::from(e)),
                };
                if let Some(reply) = reply {
                    if outbound.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.close_connection(&conn_id);
    let _ = send_task.await;
    tracing::debug!(connection = %conn_id, "WebSocket disconnected");
}

async fn send_envelope<S>(sender: &mut S, envelope: &MessageEnvelope) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    use futures_util::SinkExt;

    match envelope.to_json() {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(message_id = %envelope.id, "Cannot encode envelope: {e}");
            true
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// TESTS
// ══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Services;
    use crate::config::HubConfig;
    use crate::envelope::{DeviceClass, MessageType};
    use crate::error::ValidationError;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Arc<Hub>, Router) {
        let hub = Hub::new(HubConfig::default(), Services::default()).unwrap();
        (hub.clone(), build_router(hub))
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn get_with(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        req.body(Body::empty()).unwrap()
    }

    fn device_body(device_id: &str, class: &str) -> Value {
        json!({"device_id": device_id, "user_id": "user_1", "device_class": class})
    }

    /// Register with the pairing code header, returning the device key.
    async fn enroll(hub: &Hub, app: &Router, device_id: &str, class: &str) -> String {
        let mut req = post_json("/api/devices", device_body(device_id, class), None);
        req.headers_mut().insert(
            PAIRING_HEADER,
            hub.pairing_code().unwrap().parse().unwrap(),
        );
        let (status, body) = call(app, req).await;
        assert_eq!(status, StatusCode::CREATED);
        body["device_key"].as_str().unwrap().to_owned()
    }

    async fn register_and_token(hub: &Hub, app: &Router, device_id: &str, class: &str) -> String {
        let key = enroll(hub, app, device_id, class).await;
        let (status, body) = call(
            app,
            post_json(
                "/api/auth/token",
                json!({"user_id": "user_1", "device_id": device_id, "device_key": key}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body["token"].as_str().unwrap().to_owned()
    }

    #[test]
    fn error_statuses_follow_error_kind() {
        assert_eq!(
            status_for(&ValidationError::MissingField("id").into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_for(&HubError::auth("x")), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(&HubError::UnknownDevice("d".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&HubError::NotAccepting),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&HubError::Store("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_, app) = app();
        let (status, body) = call(&app, get_with("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn registration_is_idempotent() {
        let (hub, app) = app();
        let mut body = device_body("dev_phone", "mobile");
        body["secret"] = json!(hub.pairing_code().unwrap());
        let (first, _) = call(&app, post_json("/api/devices", body.clone(), None)).await;
        let (second, reply) = call(&app, post_json("/api/devices", body, None)).await;
        assert_eq!(first, StatusCode::CREATED);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(reply["created"], false);
        assert!(reply["device_key"].is_string());
        assert_eq!(hub.registry().len(), 1);
    }

    #[tokio::test]
    async fn anonymous_registration_and_token_requests_are_refused() {
        let (hub, app) = app();
        let (status, body) = call(
            &app,
            post_json("/api/devices", device_body("dev_phone", "mobile"), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "authentication");
        assert!(hub.registry().is_empty());

        let mut wrong = device_body("dev_phone", "mobile");
        wrong["secret"] = json!("000000");
        let (status, _) = call(&app, post_json("/api/devices", wrong, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Registered by the owner; a stranger knowing the ids still gets nothing.
        enroll(&hub, &app, "dev_phone", "mobile").await;
        for body in [
            json!({"user_id": "user_1", "device_id": "dev_phone"}),
            json!({"user_id": "user_1", "device_id": "dev_phone", "device_key": "guess"}),
        ] {
            let (status, body) = call(&app, post_json("/api/auth/token", body, None)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert!(body.get("token").is_none());
        }
        assert_eq!(hub.stats().sessions, 0);
    }

    #[tokio::test]
    async fn token_requires_registered_device() {
        let (_, app) = app();
        let (status, body) = call(
            &app,
            post_json(
                "/api/auth/token",
                json!({"user_id": "user_1", "device_id": "ghost"}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "authentication");
    }

    #[tokio::test]
    async fn submit_requires_bearer_token() {
        let (_, app) = app();
        let env = MessageEnvelope::builder(MessageType::Heartbeat, "dev_phone", "user_1")
            .build()
            .unwrap();
        let (status, _) = call(
            &app,
            post_json("/api/messages", serde_json::to_value(&env).unwrap(), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submitted_sync_update_is_queued() {
        let (hub, app) = app();
        let token = register_and_token(&hub, &app, "dev_phone", "mobile").await;
        register_and_token(&hub, &app, "dev_desktop", "desktop").await;

        let env = MessageEnvelope::builder(MessageType::SyncUpdate, "dev_phone", "user_1")
            .device_type(DeviceClass::Mobile)
            .structured(json!({"item_type": "preference", "key": "theme", "value": "dark"}))
            .build()
            .unwrap();
        let (status, body) = call(
            &app,
            post_json(
                "/api/messages",
                serde_json::to_value(&env).unwrap(),
                Some(&token),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        let ack = &body["reply"]["content"]["structured_data"];
        assert_eq!(ack["status"], "queued");
        assert_eq!(ack["targets"], 1);
        assert_eq!(hub.queue().pending_len(), 1);
    }

    #[tokio::test]
    async fn tampered_envelope_is_a_bad_request() {
        let (hub, app) = app();
        let token = register_and_token(&hub, &app, "dev_phone", "mobile").await;
        let env = MessageEnvelope::builder(MessageType::UserInput, "dev_phone", "user_1")
            .text("hello")
            .build()
            .unwrap();
        let mut raw = serde_json::to_value(&env).unwrap();
        raw["content"]["text"] = json!("tampered");
        let (status, body) = call(&app, post_json("/api/messages", raw, Some(&token))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn device_status_is_scoped_to_token_user() {
        let (hub, app) = app();
        let token = register_and_token(&hub, &app, "dev_phone", "mobile").await;

        let (status, body) = call(
            &app,
            get_with("/api/devices/dev_phone/status", Some(&token)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device"]["device_id"], "dev_phone");
        assert_eq!(body["sync"]["in_sync"], true);

        let (status, _) = call(&app, get_with("/api/devices/nope/status", Some(&token))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, get_with("/api/devices", Some(&token))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metrics_render_prometheus_text() {
        let (_, app) = app();
        let resp = app.oneshot(get_with("/metrics", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("zeroclaw_sync_"));
    }

    #[tokio::test]
    async fn draining_hub_refuses_work() {
        let (hub, app) = app();
        hub.shutdown().await;
        let (status, body) = call(&app, get_with("/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "draining");

        let (status, _) = call(
            &app,
            post_json(
                "/api/devices",
                json!({"device_id": "d", "user_id": "u", "device_class": "web"}),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
