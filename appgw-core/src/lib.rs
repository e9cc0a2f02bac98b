//! Connection plane for the appgw WebSocket API gateway.
//!
//! Terminates local WebSocket sessions from on-device applications and
//! mediates their JSON-RPC traffic with a host plugin framework: token
//! authentication, declarative method resolution, worker-pool dispatch with
//! response correlation, and deduplicated event subscription fan-out.
//! Payload bodies stay opaque on the hot path.

pub mod backend;
pub mod context;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod jsonrpc;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod subscriptions;
pub mod ws;

pub use backend::{
    Authenticator, BackendFuture, CommonHandler, EventNotifier, EventUpstream, InterfaceLookup,
    RpcClient,
};
pub use context::{AppId, ConnectionId, GatewayContext, RequestId};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayBackends};
pub use jobs::{Job, JobPool, TokioJobPool};
pub use jsonrpc::InboundFrame;
pub use registry::{AppIdRegistry, ComplianceRegistry};
pub use resolver::{ResolutionRule, ResolutionTable, RouteTarget, RuleDef};
pub use router::RouterEngine;
pub use subscriptions::{SubscriberEntry, SubscriptionBroker};
pub use ws::{ConnectionManager, WS_ROUTE};
