//! Error types for the relay core.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the connection layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No call or route matched the requested path.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The principal failed an access requirement or identity refresh.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A registered call or route handler failed.
    #[error("Handler fault: {0}")]
    HandlerFault(String),

    /// The registry was asked to do something that would break its indices.
    #[error("Registry invariant violated: {0}")]
    RegistryInvariant(String),

    /// An external collaborator (identity, authorization) failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The shared presence store failed.
    #[error("Presence store error: {0}")]
    Store(String),

    #[error("Event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Route chain timed out after {0:?}")]
    RouteTimeout(Duration),

    /// The connection transport rejected a frame.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn handler_fault(msg: impl Into<String>) -> Self {
        Self::HandlerFault(msg.into())
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Silent-drop errors never produce a client-visible response.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Unauthorized(_))
    }
}

/// Errors raised by the process message bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Bus closed")]
    Closed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}

pub type Result<T> = std::result::Result<T, RelayError>;
