use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::list::{EntrySlot, LruList, NIL};
use crate::constants::MAX_KEY_SIZE_BYTES;
use crate::error::{CacheError, Result};

/// Snapshot of a cache entry handed back by [`InMemoryStorage::get`]. The
/// value shares the stored buffer (entries are immutable; replacement swaps
/// in a fresh buffer) so no copy is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Bytes,
    pub size: usize,
    pub remaining_ttl: Duration,
}

struct StoreInner {
    map: HashMap<String, usize>,
    slots: Vec<EntrySlot>,
    free_head: usize,
    lru: LruList,
    memory_used: u64,
}

/// Bounded-memory key-value store with LRU eviction and per-entry TTLs.
///
/// All public operations serialise on one mutex; each is a single short
/// critical section with no suspension points. Memory accounting counts
/// `len(key) + len(value)` for every resident entry and never exceeds the
/// cap configured at construction.
pub struct InMemoryStorage {
    inner: Mutex<StoreInner>,
    max_memory: u64,
}

impl InMemoryStorage {
    pub fn new(max_memory: u64) -> Self {
        Self::with_capacity(max_memory, 0)
    }

    /// `initial_capacity` pre-sizes the index and arena to reduce rehashing
    /// under a known working set.
    pub fn with_capacity(max_memory: u64, initial_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                map: HashMap::with_capacity(initial_capacity),
                slots: Vec::with_capacity(initial_capacity),
                free_head: NIL,
                lru: LruList::new(),
                memory_used: 0,
            }),
            max_memory,
        }
    }

    /// Look up a live entry, promoting it to most recently used. An entry
    /// whose TTL has lapsed is deleted under the same lock and reported as
    /// not found.
    pub fn get(&self, key: &str) -> Result<StoredEntry> {
        validate_key(key)?;

        let inner = &mut *self.inner.lock();
        let Some(&idx) = inner.map.get(key) else {
            return Err(CacheError::KeyNotFound);
        };

        let now = Instant::now();
        if inner.slots[idx].expires_at <= now {
            inner.delete_slot(idx);
            return Err(CacheError::KeyNotFound);
        }

        inner.lru.move_to_tail(&mut inner.slots, idx);

        let slot = &inner.slots[idx];
        Ok(StoredEntry {
            value: slot.value.clone(),
            size: slot.value.len(),
            remaining_ttl: slot.expires_at.saturating_duration_since(now),
        })
    }

    /// Store a value, reclaiming space if needed: expired entries first (in
    /// LRU order), then live entries from the LRU head, stopping as soon as
    /// enough bytes are free.
    pub fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        validate_key(key)?;
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        if value.is_empty() {
            return Err(CacheError::ValueTooShort);
        }

        let inner = &mut *self.inner.lock();

        let new_size = (key.len() + value.len()) as u64;
        if new_size > self.max_memory {
            return Err(CacheError::ObjectTooLarge);
        }

        // Net memory needed, accounting for a pre-existing entry under the
        // same key which replacement will release.
        let mut existing_size = inner.entry_size(key);
        let additional_needed = new_size.saturating_sub(existing_size);

        if inner.memory_used + additional_needed > self.max_memory {
            let mut freed = inner.limited_ttl_cleanup(additional_needed);
            if freed < additional_needed {
                freed += inner.limited_eviction(additional_needed - freed);
            }
            if freed < additional_needed {
                return Err(CacheError::MemoryLimitExceeded);
            }

            // The eviction walk may have removed this very key; re-read its
            // size so the replacement path below does not delete it twice.
            existing_size = inner.entry_size(key);
        }

        if existing_size > 0 {
            if let Some(&idx) = inner.map.get(key) {
                inner.delete_slot(idx);
            }
        }

        // Final capacity check: eviction may have satisfied the net delta by
        // removing the old entry itself, leaving no room for the full new
        // object.
        if inner.memory_used + new_size > self.max_memory {
            return Err(CacheError::MemoryLimitExceeded);
        }

        let expires_at = Instant::now() + ttl;
        let idx = inner.alloc_slot(key.to_string(), value, expires_at);
        inner.map.insert(key.to_string(), idx);
        inner.lru.append(&mut inner.slots, idx);
        inner.memory_used += new_size;

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let inner = &mut *self.inner.lock();
        inner.delete_key(key)
    }

    /// Whether an object of this shape could ever fit, regardless of current
    /// occupancy. Used for early admission rejection before body transfer.
    pub fn can_fit(&self, key_len: usize, value_len: usize) -> bool {
        (key_len + value_len) as u64 <= self.max_memory
    }

    pub fn memory_used(&self) -> u64 {
        self.inner.lock().memory_used
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verifies accounting and list symmetry; used by tests after every
    /// mutation.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let inner = self.inner.lock();

        let mut forward = Vec::new();
        let mut cursor = inner.lru.front();
        while let Some(idx) = cursor {
            forward.push(idx);
            let next = inner.slots[idx].next;
            cursor = (next != NIL).then_some(next);
        }

        assert_eq!(forward.len(), inner.map.len(), "list and map disagree");

        let mut accounted = 0u64;
        for &idx in &forward {
            let slot = &inner.slots[idx];
            assert_eq!(inner.map.get(&slot.key), Some(&idx), "map slot mismatch");
            accounted += slot.bytes_used();
        }

        assert_eq!(accounted, inner.memory_used, "memory accounting drifted");
        assert!(
            inner.memory_used <= self.max_memory,
            "memory cap exceeded: {} > {}",
            inner.memory_used,
            self.max_memory
        );
    }
}

impl StoreInner {
    fn entry_size(&self, key: &str) -> u64 {
        self.map
            .get(key)
            .map(|&idx| self.slots[idx].bytes_used())
            .unwrap_or(0)
    }

    fn delete_key(&mut self, key: &str) -> Result<()> {
        match self.map.get(key).copied() {
            Some(idx) => {
                self.delete_slot(idx);
                Ok(())
            }
            None => Err(CacheError::DeleteKeyNotFound),
        }
    }

    fn delete_slot(&mut self, idx: usize) {
        self.lru.remove(&mut self.slots, idx);
        self.memory_used -= self.slots[idx].bytes_used();
        let key = std::mem::take(&mut self.slots[idx].key);
        self.map.remove(&key);
        self.release_slot(idx);
    }

    fn release_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.key = String::new();
        slot.value = Bytes::new();
        slot.prev = NIL;
        slot.next = self.free_head;
        self.free_head = idx;
    }

    fn alloc_slot(&mut self, key: String, value: Bytes, expires_at: Instant) -> usize {
        let slot = EntrySlot {
            key,
            value,
            expires_at,
            prev: NIL,
            next: NIL,
        };
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.slots[idx].next;
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        }
    }

    /// Delete expired entries walking from the LRU head until at least
    /// `minimum_reclaim` bytes are freed. Returns the bytes actually freed.
    fn limited_ttl_cleanup(&mut self, minimum_reclaim: u64) -> u64 {
        let now = Instant::now();
        let mut freed = 0u64;
        let mut cursor = self.lru.front();

        while let Some(idx) = cursor {
            let next = self.slots[idx].next;
            if self.slots[idx].expires_at <= now {
                freed += self.slots[idx].bytes_used();
                self.delete_slot(idx);
                if freed >= minimum_reclaim {
                    break;
                }
            }
            cursor = (next != NIL).then_some(next);
        }

        freed
    }

    /// Evict from the LRU head until at least `minimum_reclaim` bytes are
    /// freed or the list is empty. Returns the bytes actually freed.
    fn limited_eviction(&mut self, minimum_reclaim: u64) -> u64 {
        let mut freed = 0u64;
        let mut cursor = self.lru.front();

        while let Some(idx) = cursor {
            let next = self.slots[idx].next;
            freed += self.slots[idx].bytes_used();
            self.delete_slot(idx);
            if freed >= minimum_reclaim {
                break;
            }
            cursor = (next != NIL).then_some(next);
        }

        freed
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::KeyTooShort);
    }
    if key.len() > MAX_KEY_SIZE_BYTES {
        return Err(CacheError::KeyTooLong);
    }
    Ok(())
}
