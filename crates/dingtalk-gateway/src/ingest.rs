//! Per-event transport callback.
//!
//! The handler does a short synchronous pass (parse, normalize, dedup
//! check-and-mark) and then spawns the processor call. It returns a success
//! [`Ack`] every time: a failure ack makes DingTalk redeliver, and one bad
//! event is not worth a redelivery storm.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info_span, warn};

use dingtalk_gateway_protocol::{Ack, InboundMessage, RawEvent};

use crate::config::AccountConfig;
use crate::dedup::{DedupKeys, Deduplicator};
use crate::dispatch::{DispatchRequest, MessageProcessor};
use crate::error::IngestError;
use crate::transport::{Delivery, EventCallback};

// ============================================================================
// Stats
// ============================================================================

/// Running event counters, shared across sessions.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounts {
    pub received: u64,
    pub duplicates: u64,
    pub malformed: u64,
    /// Events that arrived after shutdown began.
    pub dropped: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounts {
        IngestCounts {
            received: self.received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// SessionScope
// ============================================================================

/// Runtime resources tied to one connection session.
#[derive(Debug, Clone)]
pub struct SessionScope {
    /// Dispatches are spawned here, whichever thread the transport calls from.
    pub runtime: Handle,
    /// Cancelled when the owning session shuts down.
    pub shutdown: CancellationToken,
    /// In-flight dispatches. The session drains it before reporting completion.
    pub tasks: TaskTracker,
}

impl SessionScope {
    pub fn new(runtime: Handle, shutdown: CancellationToken) -> Self {
        Self {
            runtime,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }
}

// ============================================================================
// IngestHandler
// ============================================================================

pub struct IngestHandler {
    account_id: String,
    account: Arc<AccountConfig>,
    dedup: Arc<Deduplicator>,
    processor: Arc<dyn MessageProcessor>,
    scope: SessionScope,
    stats: Arc<IngestStats>,
}

impl IngestHandler {
    pub fn new(
        account_id: &str,
        account: Arc<AccountConfig>,
        dedup: Arc<Deduplicator>,
        processor: Arc<dyn MessageProcessor>,
        scope: SessionScope,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            account_id: account_id.to_string(),
            account,
            dedup,
            processor,
            scope,
            stats,
        }
    }

    /// Wrap the handler as a transport callback.
    pub fn into_callback(self: Arc<Self>) -> EventCallback {
        Arc::new(move |delivery| self.handle(delivery))
    }

    /// Handle one delivery. Never blocks on processing, never fails.
    pub fn handle(&self, delivery: Delivery) -> Ack {
        let ack = Ack::success(delivery.message_id.clone());
        IngestStats::bump(&self.stats.received);

        if self.scope.shutdown.is_cancelled() {
            IngestStats::bump(&self.stats.dropped);
            debug!(account = %self.account_id, "Session shutting down, dropping event");
            return ack;
        }

        match self.accept(delivery) {
            Ok(Some(message)) => self.dispatch(message),
            Ok(None) => {}
            Err(e) => {
                IngestStats::bump(&self.stats.malformed);
                warn!(account = %self.account_id, error = %e, "Dropping malformed event");
            }
        }

        ack
    }

    /// Parse and dedup. `None` means the event was a duplicate.
    fn accept(&self, delivery: Delivery) -> Result<Option<InboundMessage>, IngestError> {
        let raw: RawEvent = serde_json::from_str(&delivery.data)?;
        let message = InboundMessage::from_raw(&self.account_id, raw, delivery.message_id);

        let verdict = self
            .dedup
            .check(&DedupKeys::for_message(&message), Instant::now());
        if verdict.is_duplicate() {
            IngestStats::bump(&self.stats.duplicates);
            debug!(
                account = %self.account_id,
                message_id = message.message_id.as_deref().unwrap_or("-"),
                sender = %message.sender_id,
                ?verdict,
                "Skipping duplicate event"
            );
            return Ok(None);
        }

        Ok(Some(message))
    }

    fn dispatch(&self, message: InboundMessage) {
        IngestStats::bump(&self.stats.dispatched);
        let span = info_span!(
            "dispatch",
            account = %self.account_id,
            message_id = message.message_id.as_deref().unwrap_or("-"),
        );
        debug!(
            parent: &span,
            msg_type = %message.msg_type,
            group = message.is_group(),
            "Dispatching message"
        );

        let request = DispatchRequest {
            account_id: self.account_id.clone(),
            account: self.account.clone(),
            message,
        };
        let processor = self.processor.clone();
        let stats = self.stats.clone();

        self.scope.tasks.spawn_on(
            async move {
                if let Err(e) = processor.process(request).await {
                    IngestStats::bump(&stats.dispatch_failures);
                    error!(error = %e, "Message processing failed");
                }
            }
            .instrument(span),
            &self.scope.runtime,
        );
    }
}
