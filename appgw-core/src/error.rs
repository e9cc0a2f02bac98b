/// Error kinds used across the connection plane.
///
/// Per-request kinds map to a JSON-RPC error envelope via [`GatewayError::code`];
/// the remaining kinds terminate a connection or surface from startup paths
/// and never become fatal to other connections.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The session token was rejected by the authenticator.
    Unauthorized,
    /// No resolution rule exists for the requested method.
    MethodNotFound,
    /// The authenticated app is not allowed to call this method.
    PermissionDenied,
    /// The frame or its parameters could not be understood.
    BadRequest(String),
    /// The backend interface could not be acquired; retried on the next request.
    BackendUnavailable,
    /// An error produced by a backend, passed through to the client.
    Backend { code: i64, message: String },
    /// An internal invariant was violated (e.g. the listener failed).
    IllegalState(String),
    /// The component is shutting down.
    Shutdown,
}

impl GatewayError {
    /// JSON-RPC error code for the wire envelope.
    pub fn code(&self) -> i64 {
        match self {
            GatewayError::MethodNotFound => -32601,
            GatewayError::BadRequest(_) => -32600,
            GatewayError::Backend { code, .. } => *code,
            GatewayError::BackendUnavailable => -32000,
            // Generic server error with a well-known message.
            GatewayError::PermissionDenied
            | GatewayError::Unauthorized
            | GatewayError::IllegalState(_)
            | GatewayError::Shutdown => -32603,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Unauthorized => write!(f, "Unauthorized"),
            GatewayError::MethodNotFound => write!(f, "Method not found"),
            GatewayError::PermissionDenied => write!(f, "Permission denied"),
            GatewayError::BadRequest(msg) => write!(f, "Bad request: {msg}"),
            GatewayError::BackendUnavailable => write!(f, "Backend unavailable"),
            GatewayError::Backend { message, .. } => write!(f, "{message}"),
            GatewayError::IllegalState(msg) => write!(f, "Illegal state: {msg}"),
            GatewayError::Shutdown => write!(f, "Shutting down"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes() {
        assert_eq!(GatewayError::MethodNotFound.code(), -32601);
        assert_eq!(GatewayError::BadRequest("x".into()).code(), -32600);
        assert_eq!(GatewayError::PermissionDenied.code(), -32603);
        assert_eq!(
            GatewayError::Backend {
                code: -31999,
                message: "device busy".into()
            }
            .code(),
            -31999
        );
    }

    #[test]
    fn backend_error_display_is_passthrough() {
        let err = GatewayError::Backend {
            code: -31999,
            message: "device busy".into(),
        };
        assert_eq!(err.to_string(), "device busy");
    }
}
