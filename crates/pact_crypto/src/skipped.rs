//! Bounded cache of skipped message keys.
//!
//! Keys are derived ahead of time when a message arrives with an index past
//! the next expected one. They stay here until the delayed message shows up,
//! the entry ages out, or capacity pressure evicts the oldest entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kdf::SymmetricKey;

/// (sender ratchet public key, message index)
type SlotId = (String, u64);

#[derive(Clone)]
struct Slot {
    key: SymmetricKey,
    inserted_at: DateTime<Utc>,
}

/// Serialisable form of one cached key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub dh_public_key: String,
    pub message_number: u64,
    pub message_key: SymmetricKey,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SkippedKeyCache {
    slots: HashMap<SlotId, Slot>,
    capacity: usize,
}

impl SkippedKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, dh_public_key: &str, n: u64) -> bool {
        self.slots.contains_key(&(dh_public_key.to_string(), n))
    }

    pub fn insert(&mut self, dh_public_key: &str, n: u64, key: SymmetricKey, now: DateTime<Utc>) {
        self.slots.insert(
            (dh_public_key.to_string(), n),
            Slot {
                key,
                inserted_at: now,
            },
        );
        while self.slots.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Borrow a cached key without consuming it.
    pub fn get(&self, dh_public_key: &str, n: u64) -> Option<&SymmetricKey> {
        self.slots
            .get(&(dh_public_key.to_string(), n))
            .map(|slot| &slot.key)
    }

    /// Remove an entry (dropping it zeroizes the key).
    pub fn remove(&mut self, dh_public_key: &str, n: u64) -> bool {
        self.slots.remove(&(dh_public_key.to_string(), n)).is_some()
    }

    /// Drop every entry inserted before `cutoff`. Returns the count purged.
    pub fn purge_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.inserted_at >= cutoff);
        before - self.slots.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .slots
            .iter()
            .min_by(|(a_id, a), (b_id, b)| {
                a.inserted_at
                    .cmp(&b.inserted_at)
                    .then_with(|| a_id.1.cmp(&b_id.1))
            })
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.slots.remove(&id);
        }
    }

    pub fn entries(&self) -> Vec<SkippedEntry> {
        let mut out: Vec<SkippedEntry> = self
            .slots
            .iter()
            .map(|((dh, n), slot)| SkippedEntry {
                dh_public_key: dh.clone(),
                message_number: *n,
                message_key: slot.key.clone(),
                inserted_at: slot.inserted_at,
            })
            .collect();
        out.sort_by(|a, b| {
            a.inserted_at
                .cmp(&b.inserted_at)
                .then_with(|| a.message_number.cmp(&b.message_number))
        });
        out
    }

    pub fn from_entries(entries: Vec<SkippedEntry>, capacity: usize) -> Self {
        let mut cache = Self::new(capacity);
        for entry in entries {
            cache.insert(
                &entry.dh_public_key,
                entry.message_number,
                entry.message_key.clone(),
                entry.inserted_at,
            );
        }
        cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(b: u8) -> SymmetricKey {
        SymmetricKey::from_bytes([b; 32])
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let t0 = Utc::now();
        let mut cache = SkippedKeyCache::new(2);
        cache.insert("k", 0, key(0), t0);
        cache.insert("k", 1, key(1), t0 + Duration::seconds(1));
        cache.insert("k", 2, key(2), t0 + Duration::seconds(2));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("k", 0));
        assert!(cache.contains("k", 1));
        assert!(cache.contains("k", 2));
    }

    #[test]
    fn purge_drops_stale_entries() {
        let t0 = Utc::now();
        let mut cache = SkippedKeyCache::new(10);
        cache.insert("k", 0, key(0), t0 - Duration::hours(25));
        cache.insert("k", 1, key(1), t0);

        assert_eq!(cache.purge_older_than(t0 - Duration::hours(24)), 1);
        assert_eq!(cache.get("k", 1), Some(&key(1)));
        assert!(cache.get("k", 0).is_none());
    }

    #[test]
    fn entries_restore_into_equivalent_cache() {
        let t0 = Utc::now();
        let mut cache = SkippedKeyCache::new(10);
        cache.insert("a", 3, key(3), t0);
        cache.insert("b", 0, key(9), t0);

        let restored = SkippedKeyCache::from_entries(cache.entries(), 10);
        assert_eq!(restored.get("a", 3), Some(&key(3)));
        assert_eq!(restored.get("b", 0), Some(&key(9)));
    }
}
