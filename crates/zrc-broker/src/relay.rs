//! Signalling relay: per-session, time-bounded message queues.
//!
//! Operator and agent never talk to each other directly. Each side posts offer/answer/ICE
//! payloads into the session's queue and polls for the other side's messages with a
//! `since` cursor. Queues are created on first post and live only in memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{SignalRole, SignalType};

pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 100;
pub const DEFAULT_MAX_SIGNAL_BYTES: usize = 64 * 1024;
pub const DEFAULT_SIGNAL_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("signal payload of {size} bytes exceeds limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("relay backend error: {0}")]
    Backend(String),
}

/// One signalling payload as delivered to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch, strictly increasing within a queue.
    pub timestamp: u64,
    pub sender: SignalRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    pub max_queue_length: usize,
    pub max_signal_bytes: usize,
    pub signal_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            max_signal_bytes: DEFAULT_MAX_SIGNAL_BYTES,
            signal_ttl: DEFAULT_SIGNAL_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostReceipt {
    pub timestamp: u64,
    /// Messages dropped from the front of the queue to respect the length cap.
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub messages_evicted: usize,
    pub queues_removed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub queues: usize,
    pub messages: usize,
}

/// Backend for signalling queues.
///
/// Access control happens before these calls: callers must already hold a token verified
/// for `session_id` whose role matches `sender` / `role`.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Append a message, trimming the queue to its most recent entries.
    async fn post(
        &self,
        session_id: &str,
        signal_type: SignalType,
        data: serde_json::Value,
        sender: SignalRole,
    ) -> Result<PostReceipt, RelayError>;

    /// Messages newer than `since` that were not sent by `role`, oldest first.
    async fn poll(
        &self,
        session_id: &str,
        since: u64,
        role: SignalRole,
    ) -> Result<Vec<SignalMessage>, RelayError>;

    /// Discard a session's queue. Returns whether a queue existed.
    async fn clear(&self, session_id: &str) -> Result<bool, RelayError>;

    /// Drop messages past their TTL and remove queues left empty.
    async fn evict_expired(&self) -> Result<SweepStats, RelayError>;

    fn stats(&self) -> RelayStats;
}

// ----------------------------------------------------------------------------
// Clock
// ----------------------------------------------------------------------------

/// Wall-clock milliseconds derived from a monotonic clock.
///
/// Anchored to the Unix epoch once, at construction, so timestamps never go backwards when
/// the system clock is adjusted.
#[derive(Debug, Clone, Copy)]
struct RelayClock {
    anchor_ms: u64,
    anchor: Instant,
}

impl RelayClock {
    fn new() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            anchor_ms,
            anchor: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }
}

// ----------------------------------------------------------------------------
// Queue
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredSignal {
    message: SignalMessage,
    posted_at: Instant,
}

/// Ordered messages for one session.
#[derive(Debug, Default)]
struct SignalQueue {
    messages: VecDeque<StoredSignal>,
}

impl SignalQueue {
    fn push(&mut self, message: SignalMessage, posted_at: Instant, max_len: usize) -> usize {
        self.messages.push_back(StoredSignal { message, posted_at });

        let mut evicted = 0;
        while self.messages.len() > max_len {
            self.messages.pop_front();
            evicted += 1;
        }
        evicted
    }

    fn messages_for(&self, since: u64, role: SignalRole) -> Vec<SignalMessage> {
        self.messages
            .iter()
            .filter(|s| s.message.timestamp > since && s.message.sender != role)
            .map(|s| s.message.clone())
            .collect()
    }

    fn evict_expired(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.messages.front() {
            if now.saturating_duration_since(front.posted_at) > ttl {
                self.messages.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ----------------------------------------------------------------------------
// In-process backend
// ----------------------------------------------------------------------------

/// Single-process relay on a sharded concurrent map.
///
/// Each session's queue is guarded by its map shard, so posts and polls for one session are
/// serialized while different sessions proceed in parallel. State is not shared between
/// processes.
#[derive(Debug)]
pub struct InMemorySignalRelay {
    queues: DashMap<String, SignalQueue>,
    config: RelayConfig,
    clock: RelayClock,
    /// Last timestamp handed out by any queue. Outlives cleared and swept queues.
    high_water: AtomicU64,
}

impl Default for InMemorySignalRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

impl InMemorySignalRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            queues: DashMap::new(),
            config,
            clock: RelayClock::new(),
            high_water: AtomicU64::new(0),
        }
    }

    /// `now_ms`, bumped past every timestamp issued so far.
    fn next_timestamp(&self, now_ms: u64) -> u64 {
        let previous = match self.high_water.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now_ms.max(last + 1))
        }) {
            Ok(last) | Err(last) => last,
        };
        now_ms.max(previous + 1)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Sweep as if the current instant were `now`.
    pub fn evict_expired_at(&self, now: Instant) -> SweepStats {
        let ttl = self.config.signal_ttl;
        let mut stats = SweepStats::default();
        self.queues.retain(|_, queue| {
            stats.messages_evicted += queue.evict_expired(now, ttl);
            if queue.is_empty() {
                stats.queues_removed += 1;
                false
            } else {
                true
            }
        });
        stats
    }

    pub fn queue_len(&self, session_id: &str) -> usize {
        self.queues.get(session_id).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SignalRelay for InMemorySignalRelay {
    async fn post(
        &self,
        session_id: &str,
        signal_type: SignalType,
        data: serde_json::Value,
        sender: SignalRole,
    ) -> Result<PostReceipt, RelayError> {
        let size = serde_json::to_vec(&data)
            .map_err(|e| RelayError::Backend(e.to_string()))?
            .len();
        if size > self.config.max_signal_bytes {
            return Err(RelayError::MessageTooLarge {
                size,
                limit: self.config.max_signal_bytes,
            });
        }

        let mut queue = self.queues.entry(session_id.to_string()).or_default();
        let timestamp = self.next_timestamp(self.clock.now_ms());
        let message = SignalMessage {
            signal_type,
            data,
            timestamp,
            sender,
        };
        let evicted = queue.push(message, Instant::now(), self.config.max_queue_length);

        tracing::debug!(
            session_id,
            signal_type = %signal_type,
            sender = %sender,
            timestamp,
            queue_len = queue.len(),
            "signal queued"
        );

        Ok(PostReceipt { timestamp, evicted })
    }

    async fn poll(
        &self,
        session_id: &str,
        since: u64,
        role: SignalRole,
    ) -> Result<Vec<SignalMessage>, RelayError> {
        Ok(self
            .queues
            .get(session_id)
            .map(|queue| queue.messages_for(since, role))
            .unwrap_or_default())
    }

    async fn clear(&self, session_id: &str) -> Result<bool, RelayError> {
        Ok(self.queues.remove(session_id).is_some())
    }

    async fn evict_expired(&self) -> Result<SweepStats, RelayError> {
        Ok(self.evict_expired_at(Instant::now()))
    }

    fn stats(&self) -> RelayStats {
        self.queues.iter().fold(RelayStats::default(), |mut acc, entry| {
            acc.queues += 1;
            acc.messages += entry.value().len();
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn relay() -> InMemorySignalRelay {
        InMemorySignalRelay::default()
    }

    #[tokio::test]
    async fn test_echo_suppression_and_cursor() {
        let relay = relay();
        let offer = relay
            .post("s1", SignalType::Offer, json!({"sdp": "v=0"}), SignalRole::Operator)
            .await
            .unwrap();

        assert!(relay.poll("s1", 0, SignalRole::Operator).await.unwrap().is_empty());

        let for_agent = relay.poll("s1", 0, SignalRole::Agent).await.unwrap();
        assert_eq!(for_agent.len(), 1);
        assert_eq!(for_agent[0].signal_type, SignalType::Offer);
        assert_eq!(for_agent[0].timestamp, offer.timestamp);

        // Cursor at the last seen timestamp returns nothing new.
        assert!(relay
            .poll("s1", offer.timestamp, SignalRole::Agent)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let relay = relay();
        let mut last = 0;
        for i in 0..50 {
            let receipt = relay
                .post("s1", SignalType::IceCandidate, json!({"candidate": i}), SignalRole::Agent)
                .await
                .unwrap();
            assert!(receipt.timestamp > last);
            last = receipt.timestamp;
        }

        let all = relay.poll("s1", 0, SignalRole::Operator).await.unwrap();
        assert_eq!(all.len(), 50);
        assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_cursor_survives_clear() {
        let relay = relay();
        let mut cursor = 0;
        for i in 0..500 {
            cursor = relay
                .post("s1", SignalType::IceCandidate, json!(i), SignalRole::Operator)
                .await
                .unwrap()
                .timestamp;
        }
        relay.clear("s1").await.unwrap();

        let receipt = relay
            .post("s1", SignalType::Offer, json!("again"), SignalRole::Operator)
            .await
            .unwrap();
        assert!(receipt.timestamp > cursor);

        let fresh = relay.poll("s1", cursor, SignalRole::Agent).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].data, json!("again"));
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest() {
        let relay = relay();
        for i in 0..DEFAULT_MAX_QUEUE_LENGTH {
            relay
                .post("s1", SignalType::IceCandidate, json!(i), SignalRole::Agent)
                .await
                .unwrap();
        }
        let receipt = relay
            .post("s1", SignalType::IceCandidate, json!(100), SignalRole::Agent)
            .await
            .unwrap();
        assert_eq!(receipt.evicted, 1);

        let all = relay.poll("s1", 0, SignalRole::Operator).await.unwrap();
        assert_eq!(all.len(), DEFAULT_MAX_QUEUE_LENGTH);
        assert_eq!(all[0].data, json!(1));
        assert_eq!(all[DEFAULT_MAX_QUEUE_LENGTH - 1].data, json!(100));
    }

    #[tokio::test]
    async fn test_oversize_payload_rejected() {
        let relay = InMemorySignalRelay::new(RelayConfig {
            max_signal_bytes: 16,
            ..RelayConfig::default()
        });
        let err = relay
            .post("s1", SignalType::Offer, json!("x".repeat(64)), SignalRole::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MessageTooLarge { limit: 16, .. }));
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let relay = relay();
        relay
            .post("s1", SignalType::Offer, json!("sdp"), SignalRole::Operator)
            .await
            .unwrap();

        assert!(relay.clear("s1").await.unwrap());
        assert!(!relay.clear("s1").await.unwrap());
        assert!(relay.poll("s1", 0, SignalRole::Agent).await.unwrap().is_empty());
        assert_eq!(relay.stats().queues, 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_messages_and_empty_queues() {
        let relay = relay();
        relay
            .post("s1", SignalType::Offer, json!("sdp"), SignalRole::Operator)
            .await
            .unwrap();
        relay
            .post("s2", SignalType::Answer, json!("sdp"), SignalRole::Agent)
            .await
            .unwrap();

        let nothing = relay.evict_expired_at(Instant::now());
        assert_eq!(nothing, SweepStats::default());

        let later = Instant::now() + DEFAULT_SIGNAL_TTL + Duration::from_secs(60);
        let stats = relay.evict_expired_at(later);
        assert_eq!(stats.messages_evicted, 2);
        assert_eq!(stats.queues_removed, 2);
        assert!(relay.poll("s1", 0, SignalRole::Agent).await.unwrap().is_empty());
        assert_eq!(relay.stats(), RelayStats::default());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let relay = relay();
        relay
            .post("s1", SignalType::Offer, json!("one"), SignalRole::Operator)
            .await
            .unwrap();
        relay
            .post("s2", SignalType::Offer, json!("two"), SignalRole::Operator)
            .await
            .unwrap();

        let s2 = relay.poll("s2", 0, SignalRole::Agent).await.unwrap();
        assert_eq!(s2.len(), 1);
        assert_eq!(s2[0].data, json!("two"));
        assert_eq!(relay.stats(), RelayStats { queues: 2, messages: 2 });
    }

    #[test]
    fn test_message_wire_shape() {
        let msg = SignalMessage {
            signal_type: SignalType::IceCandidate,
            data: json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"}),
            timestamp: 1_700_000_000_000,
            sender: SignalRole::Agent,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["sender"], "agent");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
    }
}
