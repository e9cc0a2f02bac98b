//! WebSocket connection manager.
//!
//! Owns the listener and every connection record: accepts sessions on the
//! configured endpoint, authenticates the handshake token, reads frames and
//! hands them to the message callback, and serializes all outbound traffic
//! through a per-connection send queue. Each connection runs a reader loop
//! plus a writer task and a keepalive pinger, all tied to one cancellation
//! token (the shape used for long-lived RPC websockets elsewhere in this
//! stack).
//!
//! Callbacks are replaceable at any time. At shutdown they are swapped for
//! no-ops and the manager waits for the in-flight upcall counter to reach
//! zero before releasing resources, so an I/O task can never call into a
//! component that is being torn down.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use appgw_telemetry::Aggregator;

use crate::context::{ConnectionId, RequestId};
use crate::error::GatewayError;
use crate::jsonrpc::{self, InboundFrame};
use crate::registry::ComplianceRegistry;

/// Route the gateway serves WebSocket upgrades on.
pub const WS_ROUTE: &str = "/jsonrpc";

/// Handshake query parameter carrying the session token.
const SESSION_PARAM: &str = "session";

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on waiting for in-flight upcalls to drain at shutdown.
const QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Decides whether a session token authenticates the connection. On success
/// the callback itself records the app identity.
pub type AuthHandler = Arc<dyn Fn(ConnectionId, &str) -> bool + Send + Sync>;

/// Receives each inbound frame; expected to hand it off to the worker pool
/// and return immediately.
pub type MessageHandler = Arc<dyn Fn(ConnectionId, InboundFrame) + Send + Sync>;

/// Invoked exactly once per connection after it is gone.
pub type DisconnectHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;

struct Handlers {
    auth: AuthHandler,
    message: MessageHandler,
    disconnect: DisconnectHandler,
}

impl Handlers {
    /// Pre-wiring defaults: reject and log, so a misassembled gateway is
    /// visible instead of silent.
    fn unset() -> Self {
        Self {
            auth: Arc::new(|cid, _| {
                warn!(cid, "no auth handler configured, rejecting connection");
                false
            }),
            message: Arc::new(|cid, frame: InboundFrame| {
                warn!(cid, method = %frame.method, "no message handler configured, dropping frame");
            }),
            disconnect: Arc::new(|_| {}),
        }
    }

    /// Silent no-ops installed during shutdown.
    fn noop() -> Self {
        Self {
            auth: Arc::new(|_, _| false),
            message: Arc::new(|_, _| {}),
            disconnect: Arc::new(|_| {}),
        }
    }
}

struct ConnectionHandle {
    queue: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    session_token: String,
}

/// Accepts, authenticates and services gateway WebSocket connections.
pub struct ConnectionManager {
    next_id: AtomicU32,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    handlers: RwLock<Handlers>,
    in_flight: AtomicUsize,
    quiesced: Notify,
    compliance: Arc<ComplianceRegistry>,
    telemetry: Arc<Aggregator>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(compliance: Arc<ComplianceRegistry>, telemetry: Arc<Aggregator>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU32::new(1),
            connections: DashMap::new(),
            handlers: RwLock::new(Handlers::unset()),
            in_flight: AtomicUsize::new(0),
            quiesced: Notify::new(),
            compliance,
            telemetry,
            cancel: CancellationToken::new(),
        })
    }

    // ── Handler wiring ───────────────────────────────────────────────────

    pub fn set_auth_handler(&self, handler: AuthHandler) {
        self.handlers.write().unwrap().auth = handler;
    }

    pub fn set_message_handler(&self, handler: MessageHandler) {
        self.handlers.write().unwrap().message = handler;
    }

    pub fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        self.handlers.write().unwrap().disconnect = handler;
    }

    // ── Serving ──────────────────────────────────────────────────────────

    /// Bind the endpoint and serve until [`stop`](Self::stop) is called.
    /// A bind or listener failure is fatal and surfaced to the caller.
    pub async fn serve(self: &Arc<Self>, endpoint: &str) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(endpoint).await.map_err(|err| {
            GatewayError::IllegalState(format!("failed to bind {endpoint}: {err}"))
        })?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_on(self: &Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, route = WS_ROUTE, "gateway listening");
        }
        let app = Router::new()
            .route(WS_ROUTE, get(ws_upgrade))
            .with_state(self.clone());
        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|err| GatewayError::IllegalState(format!("websocket listener failed: {err}")))
    }

    /// Stop accepting and cancel every open connection. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    // ── Outbound traffic ─────────────────────────────────────────────────

    /// Send a success response correlated to `request_id`.
    ///
    /// When `emit_method` is set and the connection is dialect-v2 compliant,
    /// the result is delivered emit-style as a notification named by the
    /// method; all other combinations use an id-correlated response envelope.
    /// This mirrors the dialect branch clients of the v2 protocol expect at
    /// emission time. Writes to a closed connection are dropped silently.
    pub fn respond(
        &self,
        cid: ConnectionId,
        request_id: RequestId,
        result: &str,
        emit_method: Option<&str>,
    ) {
        let Some(conn) = self.connections.get(&cid) else {
            trace!(cid, request_id, "dropping response for closed connection");
            return;
        };
        let compliant = self.compliance.is_compliant(cid);
        let frame = match emit_method {
            Some(method) if compliant => jsonrpc::emit_frame(compliant, method, result),
            _ => jsonrpc::response_frame(compliant, request_id, result),
        };
        if conn.queue.send(Message::Text(frame.into())).is_ok() {
            self.telemetry.call_completed(true);
        }
    }

    /// Send an error envelope correlated to `request_id`.
    pub fn respond_error(&self, cid: ConnectionId, request_id: RequestId, err: &GatewayError) {
        let Some(conn) = self.connections.get(&cid) else {
            trace!(cid, request_id, "dropping error response for closed connection");
            return;
        };
        let compliant = self.compliance.is_compliant(cid);
        let frame = jsonrpc::error_frame(compliant, request_id, err.code(), &err.to_string());
        if conn.queue.send(Message::Text(frame.into())).is_ok() {
            self.telemetry.call_completed(false);
        }
    }

    /// Send a server-initiated notification by method name.
    pub fn emit(&self, cid: ConnectionId, method: &str, payload: &str) {
        let Some(conn) = self.connections.get(&cid) else {
            trace!(cid, method, "dropping emit for closed connection");
            return;
        };
        let compliant = self.compliance.is_compliant(cid);
        let frame = jsonrpc::emit_frame(compliant, method, payload);
        let _ = conn.queue.send(Message::Text(frame.into()));
    }

    /// Tear a connection down with a policy close code. Idempotent.
    pub fn close(&self, cid: ConnectionId) {
        if let Some(conn) = self.connections.get(&cid) {
            let _ = conn.queue.send(close_message(close_code::POLICY, "closed by gateway"));
            conn.cancel.cancel();
        }
    }

    /// The session token presented by this connection at handshake.
    pub fn session_token(&self, cid: ConnectionId) -> Option<String> {
        self.connections.get(&cid).map(|c| c.session_token.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Replace all handlers with no-ops and wait (bounded) for in-flight
    /// upcalls to drain. After this returns no previously registered
    /// callback will be invoked again.
    pub async fn neutralize(&self) {
        *self.handlers.write().unwrap() = Handlers::noop();

        let quiesce = async {
            loop {
                let notified = self.quiesced.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(QUIESCENCE_TIMEOUT, quiesce).await.is_err() {
            warn!("handler quiescence timed out with upcalls still in flight");
        }
    }

    // ── Connection servicing ─────────────────────────────────────────────

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, query: String, token: Option<String>) {
        let cid = self.next_id.fetch_add(1, Ordering::Relaxed);
        let compliant = self.compliance.check_and_add(cid, &query);
        trace!(cid, compliant, "websocket accepted");

        let (mut sink, mut stream) = socket.split();

        let session_token = token.unwrap_or_default();
        let authenticated = !session_token.is_empty() && self.upcall_auth(cid, &session_token);
        if !authenticated {
            warn!(cid, "session authentication failed, closing");
            let _ = sink
                .send(close_message(close_code::POLICY, "authentication failed"))
                .await;
            self.upcall_disconnect(cid);
            return;
        }

        let (queue, outbound) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        self.connections.insert(
            cid,
            ConnectionHandle {
                queue: queue.clone(),
                cancel: cancel.clone(),
                session_token,
            },
        );
        self.telemetry.connection_opened();
        debug!(cid, "connection authenticated");

        let writer = tokio::spawn(write_loop(sink, outbound, cancel.clone()));
        let pinger = tokio::spawn(ping_loop(queue.clone(), cancel.clone()));

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match jsonrpc::parse_frame(text.as_str()) {
                            Ok(frame) => {
                                self.telemetry.call_received();
                                self.upcall_message(cid, frame);
                            }
                            Err(err) => {
                                warn!(cid, %err, "malformed frame, closing connection");
                                let _ = queue.send(close_message(close_code::POLICY, "malformed frame"));
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by the transport; binary is not
                    // part of the protocol.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(cid, %err, "websocket read error");
                        break;
                    }
                }
            }
        }

        cancel.cancel();
        let _ = writer.await;
        let _ = pinger.await;

        if self.connections.remove(&cid).is_some() {
            self.telemetry.connection_closed();
        }
        self.upcall_disconnect(cid);
        debug!(cid, "connection closed");
    }

    // ── Upcalls ──────────────────────────────────────────────────────────
    //
    // Each upcall clones the handler out of the lock, then invokes it while
    // holding the in-flight counter so `neutralize` can wait for it.

    fn upcall_auth(&self, cid: ConnectionId, token: &str) -> bool {
        let handler = self.handlers.read().unwrap().auth.clone();
        self.enter_upcall();
        let ok = handler(cid, token);
        self.leave_upcall();
        ok
    }

    fn upcall_message(&self, cid: ConnectionId, frame: InboundFrame) {
        let handler = self.handlers.read().unwrap().message.clone();
        self.enter_upcall();
        handler(cid, frame);
        self.leave_upcall();
    }

    fn upcall_disconnect(&self, cid: ConnectionId) {
        let handler = self.handlers.read().unwrap().disconnect.clone();
        self.enter_upcall();
        handler(cid);
        self.leave_upcall();
    }

    fn enter_upcall(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn leave_upcall(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.quiesced.notify_waiters();
        }
    }
}

async fn ws_upgrade(
    State(manager): State<Arc<ConnectionManager>>,
    RawQuery(query): RawQuery,
    ws: WebSocketUpgrade,
) -> Response {
    let query = query.unwrap_or_default();
    let token = session_token_from(&query);
    ws.on_upgrade(move |socket| manager.handle_socket(socket, query, token))
}

fn session_token_from(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == SESSION_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Forward queued messages to the socket; on cancel, drain what was queued
/// before exiting so a final close frame still reaches the peer.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                while let Ok(message) = outbound.try_recv() {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                break;
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Periodic keepalive pings to detect dead peers.
async fn ping_loop(queue: mpsc::UnboundedSender<Message>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; skip it.
    interval.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if queue.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appgw_telemetry::{TelemetryOptions, TelemetrySink};
    use std::sync::atomic::AtomicUsize;

    struct NullSink;

    impl TelemetrySink for NullSink {
        fn send(&self, _marker: &str, _payload: &str) {}
    }

    fn manager() -> Arc<ConnectionManager> {
        let telemetry = Aggregator::new(Arc::new(NullSink), TelemetryOptions::default());
        ConnectionManager::new(Arc::new(ComplianceRegistry::default()), telemetry)
    }

    fn frame() -> InboundFrame {
        InboundFrame {
            id: 1,
            method: "device.name".into(),
            params: "null".into(),
        }
    }

    #[test]
    fn session_token_extraction() {
        assert_eq!(
            session_token_from("session=TKN-A&RPCV2=true").as_deref(),
            Some("TKN-A")
        );
        assert_eq!(session_token_from("RPCV2=true"), None);
        assert_eq!(session_token_from("session="), None);
        assert_eq!(session_token_from(""), None);
    }

    #[tokio::test]
    async fn handlers_are_replaceable_and_neutralized() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        manager.set_message_handler(Arc::new(move |_, _| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        manager.upcall_message(1, frame());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Replacement takes effect for subsequent upcalls.
        let counted = calls.clone();
        manager.set_message_handler(Arc::new(move |_, _| {
            counted.fetch_add(10, Ordering::SeqCst);
        }));
        manager.upcall_message(1, frame());
        assert_eq!(calls.load(Ordering::SeqCst), 11);

        // After neutralize, the old handler is unreachable.
        manager.neutralize().await;
        manager.upcall_message(1, frame());
        assert_eq!(calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn neutralize_returns_promptly_when_idle() {
        let manager = manager();
        let started = std::time::Instant::now();
        manager.neutralize().await;
        assert!(started.elapsed() < QUIESCENCE_TIMEOUT);
    }

    #[tokio::test]
    async fn outbound_to_unknown_connection_is_dropped() {
        let manager = manager();
        manager.respond(42, 7, "\"ok\"", None);
        manager.respond_error(42, 7, &GatewayError::MethodNotFound);
        manager.emit(42, "device.nameChanged", "{}");
        manager.close(42);

        // No response outcome was recorded for the dropped writes.
        let (_, ok, failed) = manager.telemetry.call_counters();
        assert_eq!((ok, failed), (0, 0));
    }

    #[tokio::test]
    async fn default_auth_handler_rejects() {
        let manager = manager();
        assert!(!manager.upcall_auth(1, "TKN-A"));
    }
}
