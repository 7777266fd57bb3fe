//! Time-ordered expiry schedule for tracked connections.
//!
//! A binary min-heap keyed on `min(active_expire, idle_expire)`. Rescheduling a
//! key pushes a fresh node and bumps the key's generation; heap nodes whose
//! generation no longer matches are stale and skipped on `peek`/`pop`. The
//! heap is rebuilt once stale nodes outnumber live keys by more than
//! [`COMPACT_SLACK`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::SystemTime;

/// Stale nodes tolerated beyond the live count before compacting.
const COMPACT_SLACK: usize = 64;

/// Expiry deadlines of one tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryItem {
    pub active_expire: SystemTime,
    pub idle_expire: SystemTime,
}

impl ExpiryItem {
    /// The time this entry becomes due.
    pub fn expire_time(&self) -> SystemTime {
        self.active_expire.min(self.idle_expire)
    }

    /// Whether the entry is due because the flow went idle.
    pub fn is_idle_at(&self, now: SystemTime) -> bool {
        self.idle_expire <= now
    }
}

struct HeapNode<K> {
    expire: SystemTime,
    generation: u64,
    key: K,
}

impl<K> PartialEq for HeapNode<K> {
    fn eq(&self, other: &Self) -> bool {
        self.expire == other.expire && self.generation == other.generation
    }
}

impl<K> Eq for HeapNode<K> {}

impl<K> PartialOrd for HeapNode<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for HeapNode<K> {
    // Generations are unique, so equal deadlines pop in scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.expire
            .cmp(&other.expire)
            .then(self.generation.cmp(&other.generation))
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveEntry {
    generation: u64,
    item: ExpiryItem,
}

/// Priority queue of connection keys ordered by expiry time.
///
/// Holds at most one live entry per key.
pub struct ExpiryQueue<K> {
    heap: BinaryHeap<Reverse<HeapNode<K>>>,
    live: HashMap<K, LiveEntry>,
    next_generation: u64,
}

impl<K> Default for ExpiryQueue<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ExpiryQueue<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Inserts or reschedules `key`. Any previous entry for the key is replaced.
    pub fn schedule(&mut self, key: K, item: ExpiryItem) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.heap.push(Reverse(HeapNode {
            expire: item.expire_time(),
            generation,
            key: key.clone(),
        }));
        self.live.insert(key, LiveEntry { generation, item });

        self.maybe_compact();
    }

    /// Removes the entry for `key`, returning its deadlines if it was queued.
    pub fn remove(&mut self, key: &K) -> Option<ExpiryItem> {
        let removed = self.live.remove(key).map(|entry| entry.item);
        if removed.is_some() {
            self.maybe_compact();
        }
        removed
    }

    pub fn get(&self, key: &K) -> Option<&ExpiryItem> {
        self.live.get(key).map(|entry| &entry.item)
    }

    /// Returns the earliest-due live entry without removing it.
    pub fn peek(&mut self) -> Option<(&K, &ExpiryItem)> {
        self.discard_stale_top();
        let Reverse(node) = self.heap.peek()?;
        let entry = self.live.get(&node.key)?;
        Some((&node.key, &entry.item))
    }

    /// Removes and returns the earliest-due live entry.
    pub fn pop(&mut self) -> Option<(K, ExpiryItem)> {
        while let Some(Reverse(node)) = self.heap.pop() {
            if !self.is_live(&node) {
                continue;
            }
            if let Some(entry) = self.live.remove(&node.key) {
                return Some((node.key, entry.item));
            }
        }
        None
    }

    /// Pops every entry due at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: SystemTime) -> Vec<(K, ExpiryItem)> {
        let mut expired = Vec::new();
        loop {
            match self.peek() {
                Some((_, item)) if item.expire_time() <= now => {}
                _ => break,
            }
            match self.pop() {
                Some(entry) => expired.push(entry),
                None => break,
            }
        }
        expired
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_live(&self, node: &HeapNode<K>) -> bool {
        self.live
            .get(&node.key)
            .is_some_and(|entry| entry.generation == node.generation)
    }

    fn discard_stale_top(&mut self) {
        while let Some(Reverse(node)) = self.heap.peek() {
            if self.is_live(node) {
                return;
            }
            self.heap.pop();
        }
    }

    fn maybe_compact(&mut self) {
        let stale = self.heap.len().saturating_sub(self.live.len());
        if stale <= self.live.len() + COMPACT_SLACK {
            return;
        }

        let live = &self.live;
        self.heap.retain(|Reverse(node)| {
            live.get(&node.key)
                .is_some_and(|entry| entry.generation == node.generation)
        });
    }

    #[cfg(test)]
    fn heap_len(&self) -> usize {
        self.heap.len()
    }
}
