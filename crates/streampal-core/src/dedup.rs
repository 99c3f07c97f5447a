//! Duplicate suppression for repeated event deliveries.

use crate::events::Fingerprint;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Fingerprint cache with TTL expiry and a hard size cap.
///
/// All entries share one TTL, so insertion order is also expiry order: expired
/// entries are always at the front of the queue.
#[derive(Debug)]
pub struct DedupStore {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<DedupInner>,
}

#[derive(Debug, Default)]
struct DedupInner {
    expiry: HashMap<Fingerprint, Instant>,
    order: VecDeque<Fingerprint>,
}

impl DedupInner {
    fn purge_expired(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            match self.expiry.get(front) {
                Some(expires) if *expires > now => break,
                _ => {
                    if let Some(fp) = self.order.pop_front() {
                        self.expiry.remove(&fp);
                    }
                }
            }
        }
    }
}

impl DedupStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(DedupInner::default()),
        }
    }

    /// `true` when the fingerprint was recorded and has not expired; otherwise records it and returns `false`.
    pub fn seen(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.purge_expired(now);
        if inner.expiry.contains_key(fingerprint) {
            return true;
        }
        inner.expiry.insert(fingerprint.clone(), now + self.ttl);
        inner.order.push_back(fingerprint.clone());
        if inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.expiry.remove(&oldest);
            }
        }
        false
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .expiry
            .get(fingerprint)
            .map(|expires| *expires > Instant::now())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(n: usize) -> Fingerprint {
        Fingerprint::of(&["comment", "u", &n.to_string()])
    }

    #[tokio::test(start_paused = true)]
    async fn second_sighting_within_ttl_is_duplicate() {
        let store = DedupStore::new(Duration::from_secs(600), 5000);
        assert!(!store.seen(&fp(1)));
        assert!(store.seen(&fp(1)));
        assert!(!store.seen(&fp(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let store = DedupStore::new(Duration::from_secs(600), 5000);
        assert!(!store.seen(&fp(1)));
        tokio::time::advance(Duration::from_secs(599)).await;
        assert!(store.seen(&fp(1)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.contains(&fp(1)));
        assert!(!store.seen(&fp(1)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cap_evicts_oldest_first() {
        let store = DedupStore::new(Duration::from_secs(600), 3);
        for n in 0..5 {
            assert!(!store.seen(&fp(n)));
            assert!(store.len() <= 3);
        }
        assert!(!store.contains(&fp(0)));
        assert!(!store.contains(&fp(1)));
        assert!(store.contains(&fp(2)));
        assert!(store.contains(&fp(4)));
    }
}
