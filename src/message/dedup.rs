//! Deduplication Cache
//!
//! Time-bounded "already seen" set keyed by sender, message id and chunk
//! index. Entries expire after a fixed TTL: each insert schedules its own
//! eviction, and lookups treat stale entries as absent even if the timer has
//! not fired yet.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::bluetooth::adapter::LinkAddress;
use crate::bluetooth::protocol::{Frame, MessageId, PeerId};

/// Who a frame is attributed to for duplicate detection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SenderKey {
    Peer(PeerId),
    /// Frames without a usable sender id fall back to the link they came in on
    Address(LinkAddress),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeenFrameKey {
    pub sender: SenderKey,
    pub message_id: MessageId,
    pub chunk_index: u8,
}

impl SeenFrameKey {
    pub fn for_frame(frame: &Frame, from: Option<&LinkAddress>) -> Self {
        let sender = match from {
            Some(address) if frame.header.sender.is_broadcast() => SenderKey::Address(address.clone()),
            _ => SenderKey::Peer(frame.header.sender),
        };
        Self {
            sender,
            message_id: frame.header.message_id,
            chunk_index: frame.header.chunk_index,
        }
    }
}

pub struct DedupCache {
    entries: Arc<DashMap<SeenFrameKey, Instant>>,
    ttl: Duration,
    capacity: usize,
}

impl DedupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record `key` as seen. Returns `true` on first sight within the TTL
    /// window, `false` for a duplicate.
    pub fn check_and_insert(&self, key: SeenFrameKey) -> bool {
        let now = Instant::now();
        let fresh = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) < self.ttl {
                    false
                } else {
                    seen.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };

        if fresh {
            self.schedule_eviction(key, now);
            if self.entries.len() > self.capacity {
                self.enforce_capacity();
            }
        }
        fresh
    }

    pub fn contains(&self, key: &SeenFrameKey) -> bool {
        self.entries
            .get(key)
            .map(|seen| seen.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    fn schedule_eviction(&self, key: SeenFrameKey, inserted: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let entries = self.entries.clone();
        let ttl = self.ttl;
        runtime.spawn(async move {
            tokio::time::sleep_until(inserted + ttl).await;
            // a re-insert after expiry owns the entry now
            entries.remove_if(&key, |_, seen| *seen == inserted);
        });
    }

    /// Drop expired entries; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, seen| seen.elapsed() < ttl);
        before - self.entries.len()
    }

    fn enforce_capacity(&self) {
        let swept = self.sweep_expired();
        let excess = self.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            if swept > 0 {
                debug!("Dedup cache swept {} expired entries", swept);
            }
            return;
        }

        let mut oldest: Vec<(SeenFrameKey, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        oldest.sort_by_key(|(_, seen)| *seen);
        for (key, _) in oldest.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        warn!(
            "Dedup cache over capacity, evicted {} entries still inside the window",
            excess
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sender: u16, id: u64, chunk: u8) -> SeenFrameKey {
        SeenFrameKey {
            sender: SenderKey::Peer(PeerId(sender)),
            message_id: MessageId(id),
            chunk_index: chunk,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_within_ttl_is_suppressed() {
        let cache = DedupCache::new(Duration::from_secs(5), 100);
        assert!(cache.check_and_insert(key(1, 7, 0)));
        assert!(!cache.check_and_insert(key(1, 7, 0)));
        // same message, other chunk
        assert!(cache.check_and_insert(key(1, 7, 1)));
        // same id, other sender
        assert!(cache.check_and_insert(key(2, 7, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = DedupCache::new(Duration::from_secs(5), 100);
        assert!(cache.check_and_insert(key(1, 7, 0)));

        tokio::time::advance(Duration::from_millis(4_900)).await;
        assert!(cache.contains(&key(1, 7, 0)));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!cache.contains(&key(1, 7, 0)));
        cache.sweep_expired();
        assert!(cache.is_empty());
        assert!(cache.check_and_insert(key(1, 7, 0)));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest() {
        let cache = DedupCache::new(Duration::from_secs(60), 3);
        for id in 0..3 {
            cache.check_and_insert(key(1, id, 0));
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        cache.check_and_insert(key(1, 3, 0));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&key(1, 0, 0)));
        assert!(cache.contains(&key(1, 3, 0)));
    }

    #[test]
    fn broadcast_sender_falls_back_to_address() {
        let frame = Frame::app_message(PeerId::BROADCAST, PeerId(2), MessageId(1), vec![]);
        let from = LinkAddress::from("aa:bb");
        assert_eq!(
            SeenFrameKey::for_frame(&frame, Some(&from)).sender,
            SenderKey::Address(from)
        );
        let frame = Frame::app_message(PeerId(9), PeerId(2), MessageId(1), vec![]);
        assert_eq!(
            SeenFrameKey::for_frame(&frame, None).sender,
            SenderKey::Peer(PeerId(9))
        );
    }
}
