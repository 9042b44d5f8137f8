//! Two-tier duplicate suppression for inbound messages.
//!
//! DingTalk redelivers messages it considers unacknowledged, sometimes under a
//! new delivery id. Two signals catch these:
//!
//! - **Identity**: `account:message_id`, remembered for the identity TTL in a
//!   capacity-bounded cache. Exact, long window.
//! - **Content signature**: a hash of type and trimmed text scoped to
//!   account, conversation and sender, remembered for a short sliding window.
//!   Catches redeliveries without a stable id, at the cost of also dropping a
//!   user who genuinely repeats themselves inside the window.
//!
//! Both caches sit behind one lock so check-and-mark is a single critical
//! section even when the transport calls back from several threads.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use dingtalk_gateway_protocol::InboundMessage;

use crate::cache::TtlCache;
use crate::config::DedupConfig;

/// Characters of text used in the fallback identity key.
const FALLBACK_TEXT_CHARS: usize = 50;

// ============================================================================
// Keys
// ============================================================================

/// The two cache keys derived from one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKeys {
    pub identity: String,
    pub signature: String,
}

impl DedupKeys {
    pub fn for_message(msg: &InboundMessage) -> Self {
        Self {
            identity: identity_key(msg),
            signature: signature_key(msg),
        }
    }
}

/// `account:message_id`, or a best-effort key built from the conversation,
/// sender and leading text when the transport supplied no id.
pub fn identity_key(msg: &InboundMessage) -> String {
    if let Some(id) = msg.message_id.as_deref().filter(|id| !id.is_empty()) {
        return format!("{}:{}", msg.account_id, id);
    }

    let head: String = if msg.text.is_empty() {
        msg.msg_type.clone()
    } else {
        msg.text.chars().take(FALLBACK_TEXT_CHARS).collect()
    };
    format!(
        "{}:{}_{}_{}",
        msg.account_id, msg.conversation_id, msg.sender_id, head
    )
}

/// Fast non-cryptographic hash of `msg_type:text`, hex encoded.
pub fn content_signature(msg_type: &str, text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    format!("{}:{}", msg_type, text.trim()).hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Content signature scoped to account, conversation and sender.
pub fn signature_key(msg: &InboundMessage) -> String {
    format!(
        "{}:{}:{}:{}",
        msg.account_id,
        msg.conversation_id,
        msg.sender_id,
        content_signature(&msg.msg_type, &msg.text)
    )
}

// ============================================================================
// Deduplicator
// ============================================================================

/// Outcome of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unique,
    /// Same identity key seen within the identity TTL.
    DuplicateId,
    /// Same content signature seen within the signature window.
    DuplicateContent,
}

impl Verdict {
    pub fn is_duplicate(self) -> bool {
        !matches!(self, Verdict::Unique)
    }
}

/// Current entry counts, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupSizes {
    pub identity: usize,
    pub signature: usize,
}

struct Caches {
    identity: TtlCache,
    signature: TtlCache,
}

pub struct Deduplicator {
    caches: Mutex<Caches>,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            caches: Mutex::new(Caches {
                identity: TtlCache::bounded(config.identity_ttl(), config.identity_max_entries),
                signature: TtlCache::new(config.signature_ttl()),
            }),
        }
    }

    /// Decide whether a message is a duplicate and record it for later checks.
    ///
    /// A unique message has its identity key marked before this returns, so a
    /// concurrent redelivery of the same id is caught even if dispatch has not
    /// started yet. The signature is refreshed whenever the identity check
    /// passes, making the content window slide with repeated deliveries.
    pub fn check(&self, keys: &DedupKeys, now: Instant) -> Verdict {
        let mut caches = self.lock();
        caches.identity.sweep(now);
        caches.signature.sweep(now);

        if caches.identity.contains(&keys.identity, now) {
            return Verdict::DuplicateId;
        }

        let seen_content = caches.signature.contains(&keys.signature, now);
        caches.signature.mark(&keys.signature, now);
        if seen_content {
            return Verdict::DuplicateContent;
        }

        caches.identity.mark(&keys.identity, now);
        Verdict::Unique
    }

    pub fn is_duplicate(&self, msg: &InboundMessage, now: Instant) -> bool {
        self.check(&DedupKeys::for_message(msg), now).is_duplicate()
    }

    /// Forget everything. Safe to call while a connection is live.
    pub fn clear(&self) {
        let mut caches = self.lock();
        caches.identity.clear();
        caches.signature.clear();
    }

    pub fn sizes(&self) -> DedupSizes {
        let caches = self.lock();
        DedupSizes {
            identity: caches.identity.len(),
            signature: caches.signature.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Caches> {
        // Cache state stays consistent even if a holder panicked.
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
