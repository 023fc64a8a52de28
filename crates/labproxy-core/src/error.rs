//! Error types for labproxy.
//!
//! `ProxyError` is what callers of the server and client APIs see. Device
//! handlers report failures with `DeviceError`; the dispatcher turns those into
//! error replies so a failing driver never takes the server down.
//! `RegistryError` is raised while a device type declares its capabilities.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::SessionId;

/// Main error type for labproxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    // Session and handshake errors
    #[error("Handshake failed: {message}")]
    Handshake { message: String },

    #[error("Session {0} not recognised")]
    UnknownSession(SessionId),

    #[error("Admin rights required for \"{command}\"")]
    NotAdmin { command: String },

    #[error("A non-blocking task is already pending")]
    TaskPending,

    // Target errors
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Server at {address} unreachable after {attempts} reconnection attempts")]
    ReconnectExhausted { address: String, attempts: u32 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Client is not connected")]
    NotConnected,

    /// Error reported by the server in a reply envelope.
    #[error("Server error: {0}")]
    Remote(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ProxyError {
    /// Check if this error means the connection is unusable and the client
    /// should re-establish it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProxyError::Transport { .. } | ProxyError::Timeout(_) | ProxyError::Io { .. }
        )
    }
}

/// Failure reported by a device handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Missing argument \"{0}\"")]
    MissingArgument(String),

    #[error("Invalid argument \"{name}\": {message}")]
    InvalidArgument { name: String, message: String },

    #[error("Property \"{0}\" is read-only")]
    ReadOnly(String),

    #[error("Could not encode result: {0}")]
    Serialization(String),

    #[error("{0}")]
    Failed(String),
}

impl DeviceError {
    pub fn failed(message: impl Into<String>) -> Self {
        DeviceError::Failed(message.into())
    }

    pub fn invalid(name: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError::InvalidArgument {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}

/// Capability declaration errors, raised when a registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Capability names must not be empty")]
    EmptyName,

    #[error("Capability \"{0}\" is declared twice")]
    Duplicate(String),

    #[error("Capability \"{0}\" collides with the control-command namespace")]
    Reserved(String),

    #[error("Interrupt handler already declared as \"{existing}\", cannot add \"{name}\"")]
    DuplicateInterrupt { existing: String, name: String },
}
