//! Development host backends.
//!
//! Standalone stand-ins for the host plugin framework, so the gateway binary
//! can run (and be driven end-to-end) without a real plugin bus: a token
//! table authenticator, an echoing common handler, an in-process event
//! upstream, and a telemetry sink that writes to the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace};

use appgw_core::{
    Authenticator, BackendFuture, CommonHandler, ConnectionId, EventNotifier, EventUpstream,
    GatewayContext, GatewayError, InterfaceLookup, RpcClient,
};
use appgw_telemetry::TelemetrySink;

/// Authenticates sessions against a static token → app id table.
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<String, GatewayError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(GatewayError::Unauthorized)
    }

    fn check_permission(&self, app_id: &str, group: &str) -> bool {
        trace!(app_id, group, "permission check (dev host allows all)");
        true
    }
}

/// Echoes the request parameters back as the result.
pub struct EchoHandler;

impl CommonHandler for EchoHandler {
    fn call(
        &self,
        ctx: GatewayContext,
        method: &str,
        params: &str,
    ) -> BackendFuture<Result<String, GatewayError>> {
        debug!(app_id = %ctx.app_id, method, "echo handler invoked");
        let params = params.to_owned();
        Box::pin(async move { Ok(params) })
    }

    fn connection_closed(&self, cid: ConnectionId) {
        debug!(cid, "connection resources released");
    }
}

/// Interface lookup over the dev host backends. No RPC bus is available, so
/// indirect rules answer `BackendUnavailable`.
pub struct DevInterfaces {
    common: Arc<dyn CommonHandler>,
}

impl DevInterfaces {
    pub fn new(common: Arc<dyn CommonHandler>) -> Self {
        Self { common }
    }
}

impl InterfaceLookup for DevInterfaces {
    fn common_handler(&self) -> Option<Arc<dyn CommonHandler>> {
        Some(self.common.clone())
    }

    fn rpc_client(&self) -> Option<Arc<dyn RpcClient>> {
        None
    }
}

/// In-process event upstream: keeps the registered notifier per event so
/// local code (or tests) can publish events into the gateway.
#[derive(Default)]
pub struct LoopbackUpstream {
    notifiers: Mutex<HashMap<String, EventNotifier>>,
}

impl LoopbackUpstream {
    /// Publish an event to the gateway, if anything subscribed to it.
    pub fn publish(&self, event: &str, payload: &str) {
        let notifier = self.notifiers.lock().unwrap().get(event).cloned();
        if let Some(notifier) = notifier {
            notifier(event, payload);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.notifiers.lock().unwrap().len()
    }
}

impl EventUpstream for LoopbackUpstream {
    fn subscribe(&self, event: &str, notifier: EventNotifier) -> Result<(), GatewayError> {
        info!(event, "upstream subscription registered");
        self.notifiers
            .lock()
            .unwrap()
            .insert(event.to_owned(), notifier);
        Ok(())
    }

    fn unsubscribe(&self, event: &str) -> Result<(), GatewayError> {
        info!(event, "upstream subscription removed");
        self.notifiers.lock().unwrap().remove(event);
        Ok(())
    }
}

/// Telemetry sink that writes reports to the log.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn send(&self, marker: &str, payload: &str) {
        debug!(target: "appgw::telemetry", marker, payload, "telemetry report");
    }
}
