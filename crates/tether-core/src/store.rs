//! Message persistence collaborator and sequence allocation.

use crate::error::DomainError;
use crate::ids::{ChannelId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::trace;

/// Default page size for `msg.list`.
pub const DEFAULT_PAGE_SIZE: usize = 50;
/// Largest page `msg.list` will return.
pub const MAX_PAGE_SIZE: usize = 100;

/// A message as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub channel_id: ChannelId,
    pub seq: u64,
    pub author_id: UserId,
    pub text: String,
    /// Client-supplied deduplication hint, echoed back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub created_at: u64,
}

/// Persistence collaborator interface.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably store a message whose `seq` was already reserved.
    async fn append(&self, message: StoredMessage) -> Result<StoredMessage, DomainError>;

    /// Messages of a channel with `seq < before_seq`, newest `limit` of them,
    /// returned in ascending `seq` order.
    async fn list(
        &self,
        channel_id: &str,
        before_seq: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DomainError>;

    /// Highest stored sequence number of a channel, 0 when empty.
    async fn last_seq(&self, channel_id: &str) -> Result<u64, DomainError>;
}

/// In-memory message store.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    channels: DashMap<ChannelId, Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: StoredMessage) -> Result<StoredMessage, DomainError> {
        let mut log = self.channels.entry(message.channel_id.clone()).or_default();
        // Writes may land out of reservation order; keep the log sorted by seq.
        let at = log.partition_point(|m| m.seq < message.seq);
        if log.get(at).is_some_and(|m| m.seq == message.seq) {
            return Err(DomainError::conflict(format!(
                "Sequence {} already stored",
                message.seq
            )));
        }
        log.insert(at, message.clone());
        trace!(channel = %message.channel_id, seq = message.seq, "Message stored");
        Ok(message)
    }

    async fn list(
        &self,
        channel_id: &str,
        before_seq: Option<u64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DomainError> {
        let Some(log) = self.channels.get(channel_id) else {
            return Ok(Vec::new());
        };
        let end = match before_seq {
            Some(before) => log.partition_point(|m| m.seq < before),
            None => log.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(log[start..end].to_vec())
    }

    async fn last_seq(&self, channel_id: &str) -> Result<u64, DomainError> {
        Ok(self
            .channels
            .get(channel_id)
            .and_then(|log| log.last().map(|m| m.seq))
            .unwrap_or(0))
    }
}

#[derive(Debug, Default)]
struct ChannelCounter {
    /// Seeded once from the store's last sequence.
    next: OnceCell<AtomicU64>,
}

/// Per-channel sequence numbers.
///
/// The first reservation for a channel seeds the counter from the store; every
/// reservation after that is synchronous, so numbers are taken in arrival
/// order before the durable write is awaited.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: DashMap<ChannelId, Arc<ChannelCounter>>,
}

impl SequenceAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next sequence number for a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot report the channel's last sequence.
    pub async fn reserve(&self, store: &dyn MessageStore, channel_id: &str) -> Result<u64, DomainError> {
        let counter = self
            .counters
            .entry(channel_id.to_string())
            .or_default()
            .clone();
        let next = counter
            .next
            .get_or_try_init(|| async {
                let last = store.last_seq(channel_id).await?;
                Ok::<_, DomainError>(AtomicU64::new(last + 1))
            })
            .await?;
        Ok(next.fetch_add(1, Ordering::SeqCst))
    }

    /// Forget a deleted channel's counter.
    pub fn forget(&self, channel_id: &str) {
        self.counters.remove(channel_id);
    }
}
