//! Per-connection identity registries.
//!
//! Two small maps keyed by connection id, each behind its own mutex. Both are
//! purely in-memory; entries live from authentication to disconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::context::{AppId, ConnectionId};

/// Maps a connection id to the app identity established at authentication.
#[derive(Debug, Default)]
pub struct AppIdRegistry {
    inner: Mutex<HashMap<ConnectionId, AppId>>,
}

impl AppIdRegistry {
    /// Record the app id for a connection. An existing entry is overwritten.
    pub fn add(&self, cid: ConnectionId, app_id: AppId) {
        self.inner.lock().unwrap().insert(cid, app_id);
    }

    pub fn get(&self, cid: ConnectionId) -> Option<AppId> {
        self.inner.lock().unwrap().get(&cid).cloned()
    }

    /// Remove a connection's entry. Removing a missing key is silent.
    pub fn remove(&self, cid: ConnectionId) {
        self.inner.lock().unwrap().remove(&cid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Well-known handshake query marker for the newer JSON-RPC dialect.
const COMPLIANCE_PARAM: &str = "RPCV2";

/// Tracks which connections speak the newer JSON-RPC dialect.
///
/// The marker is carried as `RPCV2=true` in the handshake query string and
/// recorded once at accept time; lookups after cleanup report non-compliant.
#[derive(Debug, Default)]
pub struct ComplianceRegistry {
    inner: Mutex<HashMap<ConnectionId, bool>>,
}

impl ComplianceRegistry {
    /// Inspect the handshake query string and record whether this connection
    /// uses the newer dialect. Returns the recorded flag.
    pub fn check_and_add(&self, cid: ConnectionId, handshake_query: &str) -> bool {
        let compliant = form_urlencoded::parse(handshake_query.as_bytes())
            .any(|(key, value)| key == COMPLIANCE_PARAM && value == "true");
        self.inner.lock().unwrap().insert(cid, compliant);
        compliant
    }

    pub fn is_compliant(&self, cid: ConnectionId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&cid)
            .copied()
            .unwrap_or(false)
    }

    pub fn cleanup(&self, cid: ConnectionId) {
        self.inner.lock().unwrap().remove(&cid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_overwrites_and_remove_is_silent() {
        let registry = AppIdRegistry::default();
        registry.add(1, "app-1".into());
        registry.add(1, "app-2".into());
        assert_eq!(registry.get(1).as_deref(), Some("app-2"));

        registry.remove(1);
        registry.remove(1);
        assert!(registry.get(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn compliance_parses_handshake_query() {
        let registry = ComplianceRegistry::default();
        assert!(registry.check_and_add(1, "session=TKN-A&RPCV2=true"));
        assert!(!registry.check_and_add(2, "session=TKN-B"));
        assert!(!registry.check_and_add(3, "session=TKN-C&RPCV2=false"));

        assert!(registry.is_compliant(1));
        assert!(!registry.is_compliant(2));
        assert!(!registry.is_compliant(99));
    }

    #[test]
    fn compliance_cleanup_forgets_connection() {
        let registry = ComplianceRegistry::default();
        registry.check_and_add(1, "RPCV2=true");
        registry.cleanup(1);
        assert!(!registry.is_compliant(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn registries_are_shareable_across_threads() {
        use std::sync::Arc;

        let registry = Arc::new(AppIdRegistry::default());
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.add(i, format!("app-{i}"));
                assert_eq!(registry.get(i), Some(format!("app-{i}")));
                registry.remove(i);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
