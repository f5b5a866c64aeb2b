//! Bounded buffers for events that arrived before their predecessor.
//!
//! Items wait under the key of whatever they are waiting on. A consumer
//! `take`s a key when its predecessor lands, and periodically `sweep`s:
//! expired items are handed back for escalation, the rest are retried.
//! Time is always passed in, never read from the clock, so buffers behave
//! the same under replay and in tests.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// A buffered item.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending<K, V> {
    pub key: K,
    pub value: V,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of a sweep.
#[derive(Debug)]
pub struct Sweep<K, V> {
    /// Items older than the TTL; removed from the buffer.
    pub expired: Vec<Pending<K, V>>,
    /// Items still within the TTL; removed so the caller can retry them and
    /// [`requeue`](PendingQueue::requeue) those still blocked.
    pub retry: Vec<Pending<K, V>>,
}

/// FIFO buffer with a capacity bound and a time-to-live.
#[derive(Debug)]
pub struct PendingQueue<K, V> {
    items: VecDeque<Pending<K, V>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: PartialEq + Clone, V> PendingQueue<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Buffered items, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Pending<K, V>> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Pending<K, V>> {
        self.items.iter_mut()
    }

    /// Buffer `value` under `key`. When full, the oldest item is evicted and
    /// returned.
    pub fn push(&mut self, key: K, value: V, now: DateTime<Utc>) -> Option<Pending<K, V>> {
        self.requeue(Pending {
            key,
            value,
            enqueued_at: now,
        })
    }

    /// Put back an item taken by a sweep, keeping its original enqueue time.
    pub fn requeue(&mut self, item: Pending<K, V>) -> Option<Pending<K, V>> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Remove and return every item waiting on `key`, oldest first.
    pub fn take(&mut self, key: &K) -> Vec<Pending<K, V>> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if &item.key == key {
                taken.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        taken
    }

    /// Empty the buffer, splitting items into expired and retryable.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Sweep<K, V> {
        let ttl = self.ttl;
        let (expired, retry) = self
            .items
            .drain(..)
            .partition(|item| now - item.enqueued_at > ttl);
        Sweep { expired, retry }
    }
}
