use std::time::Duration;

use thiserror::Error;

use crate::jsonrpc;

/// Errors raised at registration time, surfaced directly to the caller.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("backend '{0}' is already registered")]
    DuplicateName(String),

    #[error("invalid backend name '{0}' (expected a non-empty [A-Za-z0-9_.-]+ identifier)")]
    InvalidName(String),

    #[error("backend '{0}': exactly one of a command or an embedded tool set must be provided")]
    AmbiguousKind(String),

    #[error("backend '{name}': invalid or empty command line '{line}'")]
    BadCommandLine { name: String, line: String },

    #[error("backend '{name}': invalid registration entry: {reason}")]
    InvalidSpec { name: String, reason: String },
}

/// Errors raised while starting a backend. An immediate child exit carries
/// whatever the child wrote to stderr before dying.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn backend '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend '{name}' exited immediately after start: {stderr}")]
    ExitedEarly { name: String, stderr: String },

    #[error("failed to capture stdio of backend '{name}'")]
    MissingStdio { name: String },
}

/// Per-request backend failures. Each variant maps onto the JSON-RPC error
/// code the router reports to the client.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend '{backend}' is not running")]
    NotRunning { backend: String },

    #[error("no response from backend '{backend}' within {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("backend '{backend}' closed its stdout")]
    ChannelClosed { backend: String },

    #[error("i/o error communicating with backend '{backend}': {source}")]
    Io {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid response from backend '{backend}': {reason}")]
    Protocol { backend: String, reason: String },
}

impl BackendError {
    /// JSON-RPC error code reported to the client for this failure.
    /// Protocol violations are internal errors; everything else is a
    /// backend communication failure.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            BackendError::Protocol { .. } => jsonrpc::INTERNAL_ERROR,
            _ => jsonrpc::BACKEND_UNAVAILABLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_code_mapping() {
        let timeout = BackendError::Timeout {
            backend: "slow".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.jsonrpc_code(), jsonrpc::BACKEND_UNAVAILABLE);

        let protocol = BackendError::Protocol {
            backend: "bad".to_string(),
            reason: "id mismatch".to_string(),
        };
        assert_eq!(protocol.jsonrpc_code(), jsonrpc::INTERNAL_ERROR);

        let closed = BackendError::ChannelClosed {
            backend: "dead".to_string(),
        };
        assert_eq!(closed.jsonrpc_code(), jsonrpc::BACKEND_UNAVAILABLE);
    }

    #[test]
    fn error_messages_name_the_backend() {
        let err = BackendError::NotRunning {
            backend: "browser".to_string(),
        };
        assert!(err.to_string().contains("browser"));

        let err = SpawnError::ExitedEarly {
            name: "math".to_string(),
            stderr: "bad flag".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("math"));
        assert!(msg.contains("bad flag"));
    }
}
