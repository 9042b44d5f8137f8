//! DingTalk stream gateway.
//!
//! Holds one long-lived DingTalk stream connection for a configured robot
//! account, filters out redelivered and repeated events, and hands each unique
//! message to a [`MessageProcessor`].
//!
//! # Architecture
//!
//! ```text
//!  DingTalk stream (or JSON Lines relay on stdin)
//!       │  StreamFrame (CALLBACK, topic /v1.0/im/bot/messages/get)
//!       ▼
//!  StreamConnection                                  [transport]
//!       │  Delivery
//!       ▼
//!  IngestHandler::handle()                           [ingest.rs]
//!       │  1. Parse RawEvent, normalize to InboundMessage
//!       │  2. Deduplicator::check()                  [dedup.rs]
//!       │       ├─ identity key seen   → ack, skip
//!       │       ├─ signature key seen  → ack, skip
//!       │       └─ unique              → mark, continue
//!       │  3. Spawn processor call, ack immediately
//!       ▼
//!  MessageProcessor::process()                       [dispatch.rs]
//! ```
//!
//! [`ConnectionSupervisor`] owns the connection lifecycle: at most one session
//! at a time, joined by repeated starts for the same account and torn down
//! exactly once on cancellation, [`ConnectionSupervisor::stop`] or transport
//! failure.

pub mod cache;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod supervisor;
pub mod transport;

pub use config::{AccountConfig, DedupConfig, GatewayConfig};
pub use dispatch::{DispatchRequest, JsonLinesForwarder, MessageProcessor};
pub use error::{GatewayError, TransportError};
pub use supervisor::{
    Completion, ConnectionState, ConnectionSupervisor, SessionResult, ShutdownReason,
    SupervisorStatus,
};
