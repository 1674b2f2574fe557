use serde::Serialize;

/// Structured error type for the bridge. Serialized as `{code, detail}` so the
/// UI can match on error codes and render connection problems separately
/// from per-command failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "code", content = "detail")]
#[cfg_attr(feature = "ts-bindings", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts-bindings", ts(export))]
pub enum BridgeError {
    /// Arguments rejected by the schema validator; nothing was dispatched.
    #[error("{message}")]
    Validation { message: String },
    /// Manifest/registry mismatch.
    #[error("Unknown command: {command}")]
    UnknownCommand { command: String },
    #[error("Command '{command}' timed out after {timeout_ms} ms")]
    DispatchTimeout { command: String, timeout_ms: u64 },
    #[error("Engine rejected '{command}': {message}")]
    EngineReported { command: String, message: String },
    /// Transport failure. Requires a reconnect.
    #[error("Engine channel error: {message}")]
    Channel { message: String },
    #[error("Connection to engine lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },
    #[error("I/O error: {message}")]
    Io { message: String },
    #[error("Model error: {message}")]
    Model { message: String },
}

impl BridgeError {
    /// Channel-level failures poison every in-flight command and must reach
    /// the agent loop instead of being folded into a tool result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Channel { .. } | Self::ConnectionLost { .. })
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Io {
            message: e.to_string(),
        }
    }
}

impl From<crate::project::ProjectError> for BridgeError {
    fn from(e: crate::project::ProjectError) -> Self {
        match e {
            crate::project::ProjectError::Io(io_err) => BridgeError::Io {
                message: io_err.to_string(),
            },
            crate::project::ProjectError::Json(json_err) => BridgeError::Validation {
                message: json_err.to_string(),
            },
            crate::project::ProjectError::InvalidDocument(msg) => {
                BridgeError::Validation { message: msg }
            }
        }
    }
}

impl From<BridgeError> for String {
    fn from(e: BridgeError) -> String {
        e.to_string()
    }
}
