//! Gateway error types.

use thiserror::Error;

/// Errors returned to the caller of [`ConnectionSupervisor::start`].
///
/// [`ConnectionSupervisor::start`]: crate::ConnectionSupervisor::start
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No configuration exists for the requested account.
    #[error("no configuration for account '{account_id}'")]
    MissingAccount { account_id: String },

    /// The account exists but is switched off.
    #[error("account '{account_id}' is disabled")]
    AccountDisabled { account_id: String },

    /// Another account already holds the connection.
    #[error("account '{active}' is already connected; cannot start '{requested}'")]
    Conflict { active: String, requested: String },

    /// The transport handle could not be built.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `start` was called outside a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Errors raised by a stream connection.
///
/// Cloneable so a failed session can hand the same error to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to construct connection: {0}")]
    Construct(String),

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("failed to close connection: {0}")]
    Disconnect(String),

    /// The connection dropped and will not recover.
    #[error("connection lost: {0}")]
    Closed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Per-event failures inside the ingest handler. Never leave the handler.
#[derive(Debug, Error)]
pub(crate) enum IngestError {
    #[error("malformed payload: {0}")]
    Parse(#[from] serde_json::Error),
}
