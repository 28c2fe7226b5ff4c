//! Typed error definitions.
//!
//! [`MxError`] covers domain failures inside the process (config, parsing,
//! persistence). [`ExchangeError`] is the only error allowed to cross the
//! exchange adapter boundary: it carries one of the five [`ErrorKind`]s and a
//! human-readable reason, never an exchange-native type.

use thiserror::Error;

use crate::types::ErrorKind;

/// Domain-specific errors.
#[derive(Debug, Error)]
pub enum MxError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Exchange payload parsing error.
    #[error("parse error: {0}")]
    Parse(String),

    /// Trading operation error (order placement, cancellation, etc.).
    #[error("trading error: {0}")]
    Trading(String),

    /// Persistence layer read/write error.
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// A classified exchange failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ExchangeError {
    pub kind: ErrorKind,
    pub message: String,
    /// The order the call was about is no longer open on the exchange.
    pub order_gone: bool,
}

impl ExchangeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), order_gone: false }
    }

    /// Mark the order as closed on the exchange despite the failure.
    pub fn with_order_gone(mut self) -> Self {
        self.order_gone = true;
        self
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retry, message)
    }

    pub fn ignore(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ignore, message)
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Block, message)
    }

    pub fn cancel(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancel, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

impl From<MxError> for ExchangeError {
    fn from(err: MxError) -> Self {
        match err {
            MxError::Config(_) => Self::cancel(err.to_string()),
            _ => Self::fatal(err.to_string()),
        }
    }
}

/// Result alias for adapter and connection operations.
pub type ExResult<T> = Result<T, ExchangeError>;
