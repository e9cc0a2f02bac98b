use std::collections::BTreeMap;

use serde::Serialize;

/// Identifier for one WebSocket connection, unique within a process lifetime.
///
/// Assigned sequentially by the connection manager at accept time; a wrap of
/// the 32-bit space is a programming error, not a supported condition.
pub type ConnectionId = u32;

/// Client-chosen request identifier, scoped to one connection.
pub type RequestId = u32;

/// Opaque application identity established at authentication.
pub type AppId = String;

/// Per-request context handed to backends.
///
/// Built by the connection manager when a frame arrives and enriched by the
/// resolver with rule-supplied `additional_context` before dispatch. Cheap to
/// clone; backends receive it by value.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayContext {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    pub app_id: AppId,
    pub session_token: String,
    pub additional_context: BTreeMap<String, String>,
}

impl GatewayContext {
    pub fn new(
        request_id: RequestId,
        connection_id: ConnectionId,
        app_id: AppId,
        session_token: String,
    ) -> Self {
        Self {
            request_id,
            connection_id,
            app_id,
            session_token,
            additional_context: BTreeMap::new(),
        }
    }

    /// Merge resolver-supplied context entries. Existing keys are kept.
    pub fn extend(&mut self, entries: &BTreeMap<String, String>) {
        for (key, value) in entries {
            self.additional_context
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_keeps_existing_keys() {
        let mut ctx = GatewayContext::new(1, 2, "app-1".into(), "TKN".into());
        ctx.additional_context
            .insert("origin".into(), "request".into());

        let mut extra = BTreeMap::new();
        extra.insert("origin".into(), "rule".into());
        extra.insert("region".into(), "eu".into());
        ctx.extend(&extra);

        assert_eq!(ctx.additional_context["origin"], "request");
        assert_eq!(ctx.additional_context["region"], "eu");
    }
}
