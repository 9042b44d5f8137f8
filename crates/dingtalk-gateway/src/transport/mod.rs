//! Stream connection boundary.
//!
//! The gateway never talks to DingTalk directly. A [`Connector`] turns account
//! credentials into a [`StreamConnection`], and the supervisor drives that
//! connection: it registers the ingest callback, opens it, waits for it to end
//! and always disconnects it.

mod jsonl;

use std::sync::Arc;

use async_trait::async_trait;

use dingtalk_gateway_protocol::{Ack, StreamFrame};

use crate::config::AccountConfig;
use crate::error::TransportError;

pub use jsonl::{JsonLinesConnection, StdinConnector};

/// Synchronous per-event callback. Must return quickly.
pub type EventCallback = Arc<dyn Fn(Delivery) -> Ack + Send + Sync>;

/// One event handed to a callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    /// Delivery-level id from the frame headers, if the transport sent one.
    pub message_id: Option<String>,
    /// JSON payload.
    pub data: String,
}

impl From<StreamFrame> for Delivery {
    fn from(frame: StreamFrame) -> Self {
        Self {
            topic: frame.headers.topic,
            message_id: frame.headers.message_id,
            data: frame.data,
        }
    }
}

/// Builds connections from account credentials.
pub trait Connector: Send + Sync {
    /// Construct, but do not open, a connection.
    ///
    /// Runs outside the supervisor's session lock. If a concurrent start wins,
    /// the returned connection is dropped without being opened.
    fn build(
        &self,
        account_id: &str,
        account: &AccountConfig,
    ) -> Result<Box<dyn StreamConnection>, TransportError>;
}

/// A server-pushed event stream.
#[async_trait]
pub trait StreamConnection: Send {
    /// Route frames on `topic` to `callback`. Called before [`connect`].
    ///
    /// [`connect`]: StreamConnection::connect
    fn register_callback(&mut self, topic: &str, callback: EventCallback);

    /// Open the connection.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Resolves when the connection ends on its own: `Ok` for a clean end of
    /// stream, `Err` for a failure the transport cannot recover from.
    ///
    /// Transports that reconnect internally never resolve.
    async fn closed(&mut self) -> Result<(), TransportError> {
        std::future::pending::<Result<(), TransportError>>().await
    }

    /// Close the connection. Called exactly once per session, on every exit path.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
