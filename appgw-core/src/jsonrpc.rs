//! JSON-RPC framing for the client-facing wire.
//!
//! The gateway never interprets request bodies: inbound parsing pulls only
//! `method`, `params`, and the request id, leaving `params` as an opaque JSON
//! string. Outbound framing depends on the connection's dialect: v2-compliant
//! connections (`RPCV2=true` at handshake) receive strict JSON-RPC 2.0
//! envelopes carrying the `"jsonrpc":"2.0"` tag, legacy connections the same
//! envelopes without it.

use serde::Deserialize;
use serde_json::value::RawValue;

use crate::context::RequestId;
use crate::error::GatewayError;

/// One inbound text frame, reduced to the fields the gateway routes on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub id: RequestId,
    pub method: String,
    /// Raw JSON parameter text, passed through to backends untouched.
    pub params: String,
}

#[derive(Deserialize)]
struct RawRequest<'a> {
    id: Option<RequestId>,
    method: Option<String>,
    #[serde(borrow)]
    params: Option<&'a RawValue>,
}

/// Parse an inbound text frame. Bodies beyond `method`/`params`/`id` are
/// ignored; a missing id or method is a malformed frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, GatewayError> {
    let raw: RawRequest<'_> = serde_json::from_str(text)
        .map_err(|err| GatewayError::BadRequest(format!("invalid frame: {err}")))?;

    let id = raw
        .id
        .ok_or_else(|| GatewayError::BadRequest("missing request id".into()))?;
    let method = match raw.method {
        Some(method) if !method.is_empty() => method,
        _ => return Err(GatewayError::BadRequest("missing method".into())),
    };
    let params = raw
        .params
        .map(|p| p.get().to_owned())
        .unwrap_or_else(|| "null".to_owned());

    Ok(InboundFrame { id, method, params })
}

/// Response envelope correlated to a request id. `result` must be valid JSON.
pub fn response_frame(compliant: bool, id: RequestId, result: &str) -> String {
    if compliant {
        format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{result}}}"#)
    } else {
        format!(r#"{{"id":{id},"result":{result}}}"#)
    }
}

/// Error envelope correlated to a request id.
pub fn error_frame(compliant: bool, id: RequestId, code: i64, message: &str) -> String {
    let message = escape(message);
    if compliant {
        format!(r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":{code},"message":{message}}}}}"#)
    } else {
        format!(r#"{{"id":{id},"error":{{"code":{code},"message":{message}}}}}"#)
    }
}

/// Server-initiated notification by method name. `payload` must be valid JSON.
pub fn emit_frame(compliant: bool, method: &str, payload: &str) -> String {
    let method = escape(method);
    if compliant {
        format!(r#"{{"jsonrpc":"2.0","method":{method},"params":{payload}}}"#)
    } else {
        format!(r#"{{"method":{method},"params":{payload}}}"#)
    }
}

fn escape(text: &str) -> String {
    serde_json::Value::String(text.to_owned()).to_string()
}
