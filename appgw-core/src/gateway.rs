//! Gateway assembly.
//!
//! Wires the connection manager, router engine, registries and subscription
//! broker together, owns the strong references, and runs the ordered
//! shutdown protocol. The manager's callbacks hold only weak engine handles,
//! so there is no reference cycle between the I/O plane and the router: once
//! the gateway drops its engine, queued jobs fail their upgrade and degrade
//! to no-ops.

use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::{info, warn};

use appgw_telemetry::Aggregator;

use crate::backend::{Authenticator, EventUpstream, InterfaceLookup};
use crate::error::GatewayError;
use crate::jobs::JobPool;
use crate::registry::{AppIdRegistry, ComplianceRegistry};
use crate::resolver::ResolutionTable;
use crate::router::RouterEngine;
use crate::subscriptions::SubscriptionBroker;
use crate::ws::ConnectionManager;

/// The host-framework collaborators a gateway is built against.
pub struct GatewayBackends {
    pub authenticator: Arc<dyn Authenticator>,
    pub interfaces: Arc<dyn InterfaceLookup>,
    pub upstream: Arc<dyn EventUpstream>,
}

/// A fully wired gateway instance.
pub struct Gateway {
    manager: Arc<ConnectionManager>,
    broker: Arc<SubscriptionBroker>,
    app_ids: Arc<AppIdRegistry>,
    compliance: Arc<ComplianceRegistry>,
    router: Mutex<Option<Arc<RouterEngine>>>,
    telemetry: Arc<Aggregator>,
}

impl Gateway {
    pub fn new(
        table: Arc<ResolutionTable>,
        subscription_suffix: impl Into<String>,
        backends: GatewayBackends,
        telemetry: Arc<Aggregator>,
        pool: Arc<dyn JobPool>,
    ) -> Arc<Self> {
        let app_ids = Arc::new(AppIdRegistry::default());
        let compliance = Arc::new(ComplianceRegistry::default());
        let manager = ConnectionManager::new(compliance.clone(), telemetry.clone());
        let broker = SubscriptionBroker::new(
            backends.upstream.clone(),
            pool.clone(),
            Arc::downgrade(&manager),
        );
        let router = RouterEngine::new(
            app_ids.clone(),
            table,
            broker.clone(),
            manager.clone(),
            backends.authenticator.clone(),
            backends.interfaces.clone(),
            telemetry.clone(),
            subscription_suffix.into(),
        );

        // Authentication: on success the callback records the identity.
        let authenticator = backends.authenticator.clone();
        let ids = app_ids.clone();
        manager.set_auth_handler(Arc::new(move |cid, token| {
            match authenticator.authenticate(token) {
                Ok(app_id) => {
                    ids.add(cid, app_id);
                    true
                }
                Err(err) => {
                    warn!(cid, %err, "session token rejected");
                    false
                }
            }
        }));

        // Message dispatch crosses onto the worker pool exactly once; the
        // job upgrades its weak engine handle when it actually runs.
        let engine = Arc::downgrade(&router);
        let jobs = pool.clone();
        manager.set_message_handler(Arc::new(move |cid, frame| {
            let engine = engine.clone();
            jobs.submit(Box::pin(async move {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.handle_message(cid, frame).await;
            }));
        }));

        // Disconnect: purge registries, subscriptions and backend resources.
        let engine = Arc::downgrade(&router);
        let ids = app_ids.clone();
        let compliance_cleanup = compliance.clone();
        let broker_cleanup = broker.clone();
        manager.set_disconnect_handler(Arc::new(move |cid| {
            broker_cleanup.cleanup(cid);
            if let Some(engine) = engine.upgrade() {
                engine.connection_closed(cid);
            }
            ids.remove(cid);
            compliance_cleanup.cleanup(cid);
        }));

        Arc::new(Self {
            manager,
            broker,
            app_ids,
            compliance,
            router: Mutex::new(Some(router)),
            telemetry,
        })
    }

    /// Bind the endpoint and serve until [`stop`](Self::stop); runs the
    /// shutdown protocol before returning.
    pub async fn serve(&self, endpoint: &str) -> Result<(), GatewayError> {
        let result = self.manager.serve(endpoint).await;
        self.shutdown().await;
        result
    }

    /// Serve on an already-bound listener (useful for ephemeral test ports).
    pub async fn serve_on(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let result = self.manager.serve_on(listener).await;
        self.shutdown().await;
        result
    }

    /// Request shutdown: stops the listener and cancels open connections.
    pub fn stop(&self) {
        self.manager.stop();
    }

    /// Ordered teardown: stop accepting, neutralize the manager's callbacks
    /// and wait for in-flight upcalls, then drop the engine so queued jobs
    /// fail their weak upgrade, releasing backend handles last. Idempotent.
    pub async fn shutdown(&self) {
        self.manager.stop();
        self.manager.neutralize().await;
        let engine = self.router.lock().unwrap().take();
        if let Some(engine) = engine {
            engine.shutdown();
            info!("router engine released");
        }
    }

    // ── Shared component access ──────────────────────────────────────────

    pub fn telemetry(&self) -> &Arc<Aggregator> {
        &self.telemetry
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn broker(&self) -> &Arc<SubscriptionBroker> {
        &self.broker
    }

    pub fn app_ids(&self) -> &Arc<AppIdRegistry> {
        &self.app_ids
    }

    pub fn compliance(&self) -> &Arc<ComplianceRegistry> {
        &self.compliance
    }
}
