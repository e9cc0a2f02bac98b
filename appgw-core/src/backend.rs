//! Contracts for the host-framework collaborators the gateway consumes.
//!
//! The connection plane never owns these services; it talks to them through
//! the traits below and re-acquires interface handles lazily via
//! [`InterfaceLookup`], releasing them at shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{AppId, ConnectionId, GatewayContext};
use crate::error::GatewayError;

/// Boxed future returned by backend calls.
pub type BackendFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The authentication authority.
pub trait Authenticator: Send + Sync {
    /// Validate a session token and return the app identity behind it.
    fn authenticate(&self, token: &str) -> Result<AppId, GatewayError>;

    /// Whether the app may call methods guarded by `group`.
    fn check_permission(&self, app_id: &str, group: &str) -> bool;
}

/// The in-process command handler behind direct-call rules.
pub trait CommonHandler: Send + Sync {
    /// Invoke the handler for `method` (the rule alias). The result is the
    /// raw JSON payload to return to the client.
    fn call(
        &self,
        ctx: GatewayContext,
        method: &str,
        params: &str,
    ) -> BackendFuture<Result<String, GatewayError>>;

    /// A connection closed; release any resources keyed by its id.
    fn connection_closed(&self, cid: ConnectionId);
}

/// Client for the internal JSON-RPC bus used by indirect rules.
pub trait RpcClient: Send + Sync {
    fn invoke(
        &self,
        callsign: &str,
        method: &str,
        params: &str,
    ) -> BackendFuture<Result<String, GatewayError>>;
}

/// Pushes an upstream event into the gateway's fan-out.
pub type EventNotifier = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// The host framework's event subscription surface.
///
/// The gateway guarantees at most one `subscribe` per event while it has
/// local subscribers, matched by one `unsubscribe` when the last one leaves.
pub trait EventUpstream: Send + Sync {
    fn subscribe(&self, event: &str, notifier: EventNotifier) -> Result<(), GatewayError>;
    fn unsubscribe(&self, event: &str) -> Result<(), GatewayError>;
}

/// Hands out backend interface handles on demand.
///
/// Returning `None` means the interface is currently unavailable; callers
/// respond with `BackendUnavailable` and retry the lookup on the next use.
pub trait InterfaceLookup: Send + Sync {
    fn common_handler(&self) -> Option<Arc<dyn CommonHandler>>;
    fn rpc_client(&self) -> Option<Arc<dyn RpcClient>>;
}
