//! Request routing and resolution.
//!
//! Each inbound frame reaches the engine as a worker-pool job holding a weak
//! engine handle, so work queued across shutdown degrades to a no-op instead
//! of touching freed state. The engine resolves the method against the
//! resolution table, enforces the rule's permission group, dispatches to the
//! backing plugin, and correlates the outcome back onto the originating
//! connection.
//!
//! Backend interfaces are acquired lazily from the [`InterfaceLookup`] on
//! first use and cached; a failed lookup answers `BackendUnavailable` and is
//! retried on the next request. [`shutdown`](RouterEngine::shutdown)
//! releases the cached handles.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, error, trace, warn};

use appgw_telemetry::{Aggregator, API_ERROR_EVENT, SERVICE_ERROR_EVENT};

use crate::backend::{Authenticator, CommonHandler, InterfaceLookup, RpcClient};
use crate::context::{ConnectionId, GatewayContext};
use crate::error::GatewayError;
use crate::jsonrpc::InboundFrame;
use crate::registry::AppIdRegistry;
use crate::resolver::{ResolutionRule, ResolutionTable, RouteTarget};
use crate::subscriptions::SubscriptionBroker;
use crate::ws::ConnectionManager;

/// Parameters accepted by subscription-suffix calls: either a bare boolean
/// or `{"listen": <bool>}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListenParams {
    Flag(bool),
    Object { listen: bool },
}

impl ListenParams {
    fn enabled(&self) -> bool {
        match self {
            ListenParams::Flag(flag) => *flag,
            ListenParams::Object { listen } => *listen,
        }
    }
}

/// Per-message dispatch engine.
pub struct RouterEngine {
    app_ids: Arc<AppIdRegistry>,
    table: Arc<ResolutionTable>,
    broker: Arc<SubscriptionBroker>,
    manager: Arc<ConnectionManager>,
    authenticator: Arc<dyn Authenticator>,
    lookup: Arc<dyn InterfaceLookup>,
    telemetry: Arc<Aggregator>,
    subscription_suffix: String,
    common: Mutex<Option<Arc<dyn CommonHandler>>>,
    rpc: Mutex<Option<Arc<dyn RpcClient>>>,
    stopping: AtomicBool,
}

impl RouterEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        app_ids: Arc<AppIdRegistry>,
        table: Arc<ResolutionTable>,
        broker: Arc<SubscriptionBroker>,
        manager: Arc<ConnectionManager>,
        authenticator: Arc<dyn Authenticator>,
        lookup: Arc<dyn InterfaceLookup>,
        telemetry: Arc<Aggregator>,
        subscription_suffix: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            app_ids,
            table,
            broker,
            manager,
            authenticator,
            lookup,
            telemetry,
            subscription_suffix,
            common: Mutex::new(None),
            rpc: Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    /// Route one inbound frame and answer on the same connection.
    pub async fn handle_message(&self, cid: ConnectionId, frame: InboundFrame) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }

        let Some(app_id) = self.app_ids.get(cid) else {
            // A frame arrived for a connection whose identity is gone; the
            // session is not usable, so close it without a response.
            error!(cid, method = %frame.method, "no app identity for connection, closing");
            self.manager.close(cid);
            return;
        };

        // Subscription-suffix calls turn into subscribe/unsubscribe when the
        // stripped method resolves to an event rule.
        if let Some(base) = frame.method.strip_suffix(self.subscription_suffix.as_str()) {
            if let Some(rule) = self.table.resolve(base) {
                if let Some(event) = rule.event.as_deref() {
                    self.handle_listen(cid, &app_id, &frame, &rule.alias, event);
                    return;
                }
            }
        }

        let Some(rule) = self.table.resolve(&frame.method) else {
            debug!(cid, method = %frame.method, "method not found");
            self.manager
                .respond_error(cid, frame.id, &GatewayError::MethodNotFound);
            return;
        };
        let rule = rule.clone();

        if let Some(group) = rule.permission_group.as_deref() {
            if !self.authenticator.check_permission(&app_id, group) {
                warn!(cid, app_id = %app_id, method = %frame.method, group, "permission denied");
                self.manager
                    .respond_error(cid, frame.id, &GatewayError::PermissionDenied);
                return;
            }
        }

        let session_token = self.manager.session_token(cid).unwrap_or_default();
        let mut ctx = GatewayContext::new(frame.id, cid, app_id, session_token);
        if rule.include_context {
            ctx.extend(&rule.additional_context);
        }

        let started = Instant::now();
        let outcome = self.call_backend(&rule, ctx, &frame).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(payload) => {
                trace!(cid, method = %frame.method, "request succeeded");
                self.record_call_metric(&rule, &frame.method, true, elapsed_ms);
                // Rules backed by an event prefer emit-style delivery on the
                // newer dialect; the manager branches on the compliance flag.
                let emit_method = rule.event.as_ref().map(|_| rule.alias.as_str());
                self.manager.respond(cid, frame.id, &payload, emit_method);
            }
            Err(err) => {
                debug!(cid, method = %frame.method, %err, "request failed");
                self.record_call_metric(&rule, &frame.method, false, elapsed_ms);
                self.record_error_event(&rule, &frame.method, &err);
                self.manager.respond_error(cid, frame.id, &err);
            }
        }
    }

    /// Notify backends that a connection is gone.
    pub fn connection_closed(&self, cid: ConnectionId) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        if let Ok(handler) = self.common_handler() {
            handler.connection_closed(cid);
        }
    }

    /// Stop routing and release the cached backend handles. Jobs that run
    /// after this observe the stopping flag (or a failed weak upgrade) and
    /// return without side effects.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        self.common.lock().unwrap().take();
        self.rpc.lock().unwrap().take();
    }

    fn handle_listen(
        &self,
        cid: ConnectionId,
        app_id: &str,
        frame: &InboundFrame,
        destination: &str,
        event: &str,
    ) {
        let listen = match serde_json::from_str::<ListenParams>(&frame.params) {
            Ok(params) => params.enabled(),
            Err(_) => {
                self.manager.respond_error(
                    cid,
                    frame.id,
                    &GatewayError::BadRequest("expected {\"listen\": bool}".into()),
                );
                return;
            }
        };

        if listen {
            self.broker
                .subscribe(event, cid, app_id, frame.id, destination);
        } else {
            self.broker.unsubscribe(event, cid);
        }
        let body = format!(r#"{{"listening":{listen}}}"#);
        self.manager.respond(cid, frame.id, &body, None);
    }

    async fn call_backend(
        &self,
        rule: &ResolutionRule,
        ctx: GatewayContext,
        frame: &InboundFrame,
    ) -> Result<String, GatewayError> {
        match rule.target {
            RouteTarget::Direct => {
                let handler = self.common_handler()?;
                handler.call(ctx, &rule.alias, &frame.params).await
            }
            RouteTarget::Rpc => {
                let client = self.rpc_client()?;
                client.invoke(&rule.alias, &frame.method, &frame.params).await
            }
        }
    }

    fn common_handler(&self) -> Result<Arc<dyn CommonHandler>, GatewayError> {
        let mut cache = self.common.lock().unwrap();
        if let Some(handler) = cache.as_ref() {
            return Ok(handler.clone());
        }
        match self.lookup.common_handler() {
            Some(handler) => {
                debug!("acquired common handler interface");
                *cache = Some(handler.clone());
                Ok(handler)
            }
            None => {
                warn!("common handler unavailable");
                Err(GatewayError::BackendUnavailable)
            }
        }
    }

    fn rpc_client(&self) -> Result<Arc<dyn RpcClient>, GatewayError> {
        let mut cache = self.rpc.lock().unwrap();
        if let Some(client) = cache.as_ref() {
            return Ok(client.clone());
        }
        match self.lookup.rpc_client() {
            Some(client) => {
                debug!("acquired rpc bus client");
                *cache = Some(client.clone());
                Ok(client)
            }
            None => {
                warn!("rpc bus client unavailable");
                Err(GatewayError::BackendUnavailable)
            }
        }
    }

    fn record_call_metric(&self, rule: &ResolutionRule, method: &str, success: bool, latency: f64) {
        let outcome = if success { "Success" } else { "Error" };
        let name = match rule.target {
            RouteTarget::Direct => format!(
                "AppGw_PluginName_{}_MethodName_{method}_{outcome}_split",
                rule.alias
            ),
            RouteTarget::Rpc => format!(
                "AppGw_PluginName_{}_ServiceName_{method}_{outcome}_split",
                rule.alias
            ),
        };
        self.telemetry.record_metric(&name, latency, "ms");
    }

    fn record_error_event(&self, rule: &ResolutionRule, method: &str, err: &GatewayError) {
        let (event, data) = match rule.target {
            RouteTarget::Direct => (
                API_ERROR_EVENT,
                serde_json::json!({ "api": method, "message": err.to_string() }),
            ),
            RouteTarget::Rpc => (
                SERVICE_ERROR_EVENT,
                serde_json::json!({ "service": rule.alias, "message": err.to_string() }),
            ),
        };
        self.telemetry.record_event(event, &data.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFuture, EventNotifier, EventUpstream};
    use crate::jobs::TokioJobPool;
    use crate::registry::ComplianceRegistry;
    use crate::resolver::RuleDef;
    use appgw_telemetry::{TelemetryOptions, TelemetrySink};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Weak;

    struct NullSink;

    impl TelemetrySink for NullSink {
        fn send(&self, _marker: &str, _payload: &str) {}
    }

    struct AllowAllAuth;

    impl Authenticator for AllowAllAuth {
        fn authenticate(&self, _token: &str) -> Result<String, GatewayError> {
            Ok("app-1".into())
        }

        fn check_permission(&self, _app_id: &str, group: &str) -> bool {
            group != "restricted"
        }
    }

    struct NoopUpstream;

    impl EventUpstream for NoopUpstream {
        fn subscribe(&self, _event: &str, _notifier: EventNotifier) -> Result<(), GatewayError> {
            Ok(())
        }

        fn unsubscribe(&self, _event: &str) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl CommonHandler for CountingHandler {
        fn call(
            &self,
            _ctx: GatewayContext,
            _method: &str,
            params: &str,
        ) -> BackendFuture<Result<String, GatewayError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let params = params.to_owned();
            Box::pin(async move { Ok(params) })
        }

        fn connection_closed(&self, _cid: ConnectionId) {}
    }

    struct CountingLookup {
        handler: Arc<CountingHandler>,
        lookups: AtomicUsize,
    }

    impl InterfaceLookup for CountingLookup {
        fn common_handler(&self) -> Option<Arc<dyn CommonHandler>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Some(self.handler.clone())
        }

        fn rpc_client(&self) -> Option<Arc<dyn RpcClient>> {
            None
        }
    }

    fn engine() -> (Arc<RouterEngine>, Arc<AppIdRegistry>, Arc<CountingLookup>, Arc<Aggregator>) {
        let telemetry = Aggregator::new(Arc::new(NullSink), TelemetryOptions::default());
        let app_ids = Arc::new(AppIdRegistry::default());
        let manager =
            ConnectionManager::new(Arc::new(ComplianceRegistry::default()), telemetry.clone());
        let table = Arc::new(
            ResolutionTable::from_rules(vec![
                RuleDef {
                    method: "device.name".into(),
                    alias: "org.rdk.Device".into(),
                    direct: true,
                    event: None,
                    permission_group: None,
                    include_context: false,
                    additional_context: Default::default(),
                },
                RuleDef {
                    method: "secret.op".into(),
                    alias: "org.rdk.Secret".into(),
                    direct: true,
                    event: None,
                    permission_group: Some("restricted".into()),
                    include_context: false,
                    additional_context: Default::default(),
                },
            ])
            .unwrap(),
        );
        let pool = Arc::new(TokioJobPool::default());
        let broker = SubscriptionBroker::new(Arc::new(NoopUpstream), pool, Weak::new());
        let lookup = Arc::new(CountingLookup {
            handler: Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
            }),
            lookups: AtomicUsize::new(0),
        });
        let engine = RouterEngine::new(
            app_ids.clone(),
            table,
            broker,
            manager,
            Arc::new(AllowAllAuth),
            lookup.clone(),
            telemetry.clone(),
            ".listen".into(),
        );
        (engine, app_ids, lookup, telemetry)
    }

    fn frame(method: &str) -> InboundFrame {
        InboundFrame {
            id: 1,
            method: method.into(),
            params: "{}".into(),
        }
    }

    #[tokio::test]
    async fn unknown_connection_is_closed_without_response() {
        let (engine, _, lookup, telemetry) = engine();
        engine.handle_message(99, frame("device.name")).await;
        assert_eq!(lookup.lookups.load(Ordering::SeqCst), 0);
        let (_, ok, failed) = telemetry.call_counters();
        assert_eq!((ok, failed), (0, 0));
    }

    #[tokio::test]
    async fn backend_is_called_for_resolved_methods() {
        let (engine, app_ids, lookup, _) = engine();
        app_ids.add(1, "app-1".into());

        engine.handle_message(1, frame("device.name")).await;
        assert_eq!(lookup.handler.calls.load(Ordering::SeqCst), 1);

        // The interface handle is cached after the first acquisition.
        engine.handle_message(1, frame("device.name")).await;
        assert_eq!(lookup.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(lookup.handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permission_group_denies_before_dispatch() {
        let (engine, app_ids, lookup, _) = engine();
        app_ids.add(1, "app-1".into());

        engine.handle_message(1, frame("secret.op")).await;
        assert_eq!(lookup.handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_makes_pending_work_a_noop() {
        let (engine, app_ids, lookup, telemetry) = engine();
        app_ids.add(1, "app-1".into());

        engine.shutdown();
        engine.handle_message(1, frame("device.name")).await;

        assert_eq!(lookup.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(lookup.handler.calls.load(Ordering::SeqCst), 0);
        let (_, ok, failed) = telemetry.call_counters();
        assert_eq!((ok, failed), (0, 0));
    }

    #[tokio::test]
    async fn call_metrics_use_structured_names() {
        let (engine, app_ids, _, telemetry) = engine();
        app_ids.add(1, "app-1".into());

        engine.handle_message(1, frame("device.name")).await;
        let stats = telemetry
            .api_method_stats("org.rdk.Device|device.name")
            .unwrap();
        assert_eq!(stats.success_count, 1);
    }
}
