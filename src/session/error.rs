use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::SessionStatus;

/// Per-backend connect failures. Isolated: one backend failing to connect
/// never affects the others.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to spawn backend '{backend}': {source}")]
    Spawn {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MCP handshake with backend '{backend}' timed out after {timeout:?}")]
    HandshakeTimeout { backend: String, timeout: Duration },

    #[error("MCP handshake with backend '{backend}' failed: {detail}")]
    Protocol { backend: String, detail: String },

    #[error("gateway is shutting down")]
    ShuttingDown,
}

/// Per-call failures. None of these tear down the session manager; `Timeout`
/// leaves the session itself usable.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("tool call '{tool}' timed out after {deadline:?}")]
    Timeout { tool: String, deadline: Duration },

    #[error("session lost during call to '{tool}'")]
    SessionLost { tool: String },

    #[error("call cancelled by shutdown")]
    Cancelled,

    /// The backend answered, but with an error payload. Carried verbatim so
    /// the client can react to it.
    #[error("backend returned an error payload")]
    Backend(Value),

    #[error("backend '{backend}' is not available (status: {status:?})")]
    BackendUnavailable {
        backend: String,
        status: Option<SessionStatus>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_keeps_tool_and_deadline() {
        let err = CallError::Timeout {
            tool: "exa_search".to_string(),
            deadline: Duration::from_millis(500),
        };
        let msg = err.to_string();
        assert!(msg.contains("exa_search"));
        assert!(msg.contains("500ms"));
    }

    #[test]
    fn test_unavailable_names_backend() {
        let err = CallError::BackendUnavailable {
            backend: "puppeteer".to_string(),
            status: Some(SessionStatus::Failed),
        };
        assert!(err.to_string().contains("puppeteer"));
        assert!(err.to_string().contains("Failed"));
    }

    #[test]
    fn test_backend_error_carries_payload() {
        let payload = serde_json::json!({"message": "rate limited"});
        let CallError::Backend(v) = CallError::Backend(payload.clone()) else {
            unreachable!()
        };
        assert_eq!(v, payload);
    }
}
