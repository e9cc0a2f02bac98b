//! Event subscription fan-out.
//!
//! Backends publish named events through the host framework; the broker
//! keeps one subscriber set per event and multiplexes each published payload
//! to every interested connection. The framework must see exactly one
//! upstream subscribe per event while local subscribers exist: the
//! empty↔non-empty transition is decided under the broker lock, and the
//! upstream call is issued after the lock is released. When an upstream call
//! fails, local state stays authoritative and the recorded upstream state is
//! rolled back so the next relevant operation issues a compensating call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace, warn};

use crate::backend::{EventNotifier, EventUpstream};
use crate::context::{AppId, ConnectionId, RequestId};
use crate::jobs::JobPool;
use crate::ws::ConnectionManager;

/// One logical subscription: at most one entry per `(event, connection)`.
#[derive(Debug, Clone)]
pub struct SubscriberEntry {
    pub event: String,
    pub connection_id: ConnectionId,
    pub app_id: AppId,
    pub request_id: RequestId,
    /// Method name used when emitting this event to the connection.
    pub destination: String,
}

#[derive(Default)]
struct BrokerState {
    subscribers: HashMap<String, Vec<SubscriberEntry>>,
    /// Events we believe the upstream currently has a subscription for.
    upstream_active: HashSet<String>,
}

/// Per-event subscriber registry with deduplicated upstream subscriptions.
pub struct SubscriptionBroker {
    state: Mutex<BrokerState>,
    upstream: Arc<dyn EventUpstream>,
    pool: Arc<dyn JobPool>,
    manager: Weak<ConnectionManager>,
    self_weak: Weak<SubscriptionBroker>,
}

impl SubscriptionBroker {
    pub fn new(
        upstream: Arc<dyn EventUpstream>,
        pool: Arc<dyn JobPool>,
        manager: Weak<ConnectionManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            state: Mutex::new(BrokerState::default()),
            upstream,
            pool,
            manager,
            self_weak: self_weak.clone(),
        })
    }

    /// Register a connection for an event. Re-subscribing from the same
    /// connection is a no-op success. The first subscriber triggers the
    /// upstream subscription.
    pub fn subscribe(
        &self,
        event: &str,
        cid: ConnectionId,
        app_id: &str,
        request_id: RequestId,
        destination: &str,
    ) {
        let activate = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let entries = state.subscribers.entry(event.to_owned()).or_default();
            if entries.iter().any(|e| e.connection_id == cid) {
                trace!(event, cid, "already subscribed");
                false
            } else {
                entries.push(SubscriberEntry {
                    event: event.to_owned(),
                    connection_id: cid,
                    app_id: app_id.to_owned(),
                    request_id,
                    destination: destination.to_owned(),
                });
                // Claim the upstream slot under the lock; the call itself
                // happens outside it.
                state.upstream_active.insert(event.to_owned())
            }
        };

        if activate {
            debug!(event, "subscribing upstream");
            let notifier = self.notifier();
            if let Err(err) = self.upstream.subscribe(event, notifier) {
                warn!(event, %err, "upstream subscribe failed, will retry on next transition");
                self.state.lock().unwrap().upstream_active.remove(event);
            }
        }
    }

    /// Remove a connection's subscription. Unsubscribing a non-existent
    /// entry is a no-op success. The last subscriber leaving triggers the
    /// upstream unsubscribe.
    pub fn unsubscribe(&self, event: &str, cid: ConnectionId) {
        let deactivate = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let mut emptied = false;
            if let Some(entries) = state.subscribers.get_mut(event) {
                entries.retain(|e| e.connection_id != cid);
                emptied = entries.is_empty();
            }
            if emptied {
                state.subscribers.remove(event);
                state.upstream_active.remove(event)
            } else {
                false
            }
        };

        if deactivate {
            debug!(event, "unsubscribing upstream");
            if let Err(err) = self.upstream.unsubscribe(event) {
                warn!(event, %err, "upstream unsubscribe failed, will retry on next transition");
                self.state
                    .lock()
                    .unwrap()
                    .upstream_active
                    .insert(event.to_owned());
            }
        }
    }

    /// Fan a published payload out to every subscriber of the event.
    ///
    /// Emission happens on the worker pool, not inline with the publisher's
    /// thread; per-connection ordering is provided by the manager's send
    /// queue.
    pub fn dispatch(&self, event: &str, payload: &str) {
        let targets: Vec<(ConnectionId, String)> = {
            let state = self.state.lock().unwrap();
            state
                .subscribers
                .get(event)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|e| (e.connection_id, e.destination.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        if targets.is_empty() {
            trace!(event, "event without subscribers dropped");
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };

        trace!(event, subscribers = targets.len(), "dispatching event");
        let payload = payload.to_owned();
        self.pool.submit(Box::pin(async move {
            for (cid, method) in targets {
                manager.emit(cid, &method, &payload);
            }
        }));
    }

    /// Drop every subscription held by a closed connection, issuing upstream
    /// unsubscribes for events whose sets became empty.
    pub fn cleanup(&self, cid: ConnectionId) {
        let emptied: Vec<String> = {
            let mut state = self.state.lock().unwrap();
            let mut emptied = Vec::new();
            state.subscribers.retain(|event, entries| {
                entries.retain(|e| e.connection_id != cid);
                if entries.is_empty() {
                    emptied.push(event.clone());
                    false
                } else {
                    true
                }
            });
            for event in &emptied {
                state.upstream_active.remove(event);
            }
            emptied
        };

        for event in emptied {
            debug!(%event, cid, "last subscriber disconnected, unsubscribing upstream");
            if let Err(err) = self.upstream.unsubscribe(&event) {
                warn!(%event, %err, "upstream unsubscribe failed, will retry on next transition");
                self.state.lock().unwrap().upstream_active.insert(event);
            }
        }
    }

    /// Number of subscribers currently registered for an event.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Whether any event still lists this connection.
    pub fn has_connection(&self, cid: ConnectionId) -> bool {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .values()
            .any(|entries| entries.iter().any(|e| e.connection_id == cid))
    }

    fn notifier(&self) -> EventNotifier {
        let broker = self.self_weak.clone();
        Arc::new(move |event, payload| {
            if let Some(broker) = broker.upgrade() {
                broker.dispatch(event, payload);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::jobs::TokioJobPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingUpstream {
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
        fail_subscribe: std::sync::atomic::AtomicBool,
    }

    impl EventUpstream for CountingUpstream {
        fn subscribe(&self, _event: &str, _notifier: EventNotifier) -> Result<(), GatewayError> {
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(GatewayError::BackendUnavailable);
            }
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn unsubscribe(&self, _event: &str) -> Result<(), GatewayError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn broker_with(
        upstream: Arc<CountingUpstream>,
    ) -> Arc<SubscriptionBroker> {
        SubscriptionBroker::new(upstream, Arc::new(TokioJobPool::default()), Weak::new())
    }

    #[tokio::test]
    async fn double_subscribe_is_one_entry_and_one_upstream_call() {
        let upstream = Arc::new(CountingUpstream::default());
        let broker = broker_with(upstream.clone());

        broker.subscribe("nameChanged", 1, "app-1", 1, "device.nameChanged");
        broker.subscribe("nameChanged", 1, "app-1", 5, "device.nameChanged");

        assert_eq!(broker.subscriber_count("nameChanged"), 1);
        assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_connection_reuses_upstream_subscription() {
        let upstream = Arc::new(CountingUpstream::default());
        let broker = broker_with(upstream.clone());

        broker.subscribe("nameChanged", 1, "app-1", 1, "device.nameChanged");
        broker.subscribe("nameChanged", 2, "app-2", 2, "device.nameChanged");
        assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscriber_count("nameChanged"), 2);

        // First connection leaving keeps the upstream subscription alive.
        broker.cleanup(1);
        assert_eq!(upstream.unsubscribes.load(Ordering::SeqCst), 0);
        assert!(!broker.has_connection(1));

        // The last one out turns off the light, exactly once.
        broker.unsubscribe("nameChanged", 2);
        assert_eq!(upstream.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.subscriber_count("nameChanged"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_of_absent_entry_is_a_noop() {
        let upstream = Arc::new(CountingUpstream::default());
        let broker = broker_with(upstream.clone());

        broker.unsubscribe("nameChanged", 7);
        broker.cleanup(7);
        assert_eq!(upstream.unsubscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resubscribing_after_empty_triggers_upstream_again() {
        let upstream = Arc::new(CountingUpstream::default());
        let broker = broker_with(upstream.clone());

        broker.subscribe("nameChanged", 1, "app-1", 1, "device.nameChanged");
        broker.unsubscribe("nameChanged", 1);
        broker.subscribe("nameChanged", 2, "app-2", 2, "device.nameChanged");

        assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 2);
        assert_eq!(upstream.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_upstream_subscribe_is_retried_on_next_transition() {
        let upstream = Arc::new(CountingUpstream::default());
        upstream.fail_subscribe.store(true, Ordering::SeqCst);
        let broker = broker_with(upstream.clone());

        broker.subscribe("nameChanged", 1, "app-1", 1, "device.nameChanged");
        assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 0);
        // Local state stays authoritative.
        assert_eq!(broker.subscriber_count("nameChanged"), 1);

        // The next transition to non-empty retries the upstream call.
        upstream.fail_subscribe.store(false, Ordering::SeqCst);
        broker.unsubscribe("nameChanged", 1);
        broker.subscribe("nameChanged", 1, "app-1", 2, "device.nameChanged");
        assert_eq!(upstream.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleanup_only_touches_the_closed_connection() {
        let upstream = Arc::new(CountingUpstream::default());
        let broker = broker_with(upstream.clone());

        broker.subscribe("nameChanged", 1, "app-1", 1, "device.nameChanged");
        broker.subscribe("volumeChanged", 1, "app-1", 2, "device.volumeChanged");
        broker.subscribe("nameChanged", 2, "app-2", 3, "device.nameChanged");

        broker.cleanup(1);
        assert_eq!(broker.subscriber_count("nameChanged"), 1);
        assert_eq!(broker.subscriber_count("volumeChanged"), 0);
        // Only the events emptied by the cleanup unsubscribe upstream.
        assert_eq!(upstream.unsubscribes.load(Ordering::SeqCst), 1);
    }
}
