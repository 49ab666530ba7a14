/// In-memory per-sheet cache.
///
/// Each entry keeps two copies of a sheet:
/// - `cards`: the latest locally committed state (what a fresh activation sees)
/// - `synced`: the last state known to match the server, used as the
///   rollback point when unsaved edits are discarded
///
/// Every read and write copies, so callers can never alias cached data.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::types::{Card, SheetKey};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub cards: Vec<Card>,
    pub synced: Vec<Card>,
    /// SHA-256 of the synced rows, used to tell whether a refetch changed anything
    pub synced_hash: String,
    pub loaded_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

impl CacheEntry {
    /// True when local commits differ from the last server-confirmed state.
    pub fn has_unsynced_changes(&self) -> bool {
        self.cards != self.synced
    }
}

/// Summary of one cached sheet, for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSummary {
    pub key: SheetKey,
    pub card_count: usize,
    pub unsynced: bool,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SheetCache {
    entries: HashMap<SheetKey, CacheEntry>,
}

impl SheetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint of a card list's wire form. Ids are excluded since they are positional.
    pub fn fingerprint(cards: &[Card]) -> String {
        let mut hasher = Sha256::new();
        for card in cards {
            hasher.update(card.front.as_bytes());
            hasher.update([0x1f]);
            hasher.update(card.back.as_bytes());
            hasher.update([0x1f]);
            hasher.update(card.level.to_le_bytes());
            hasher.update([0x1e]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn has(&self, key: &SheetKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Independent copy of the committed cards for `key`.
    pub fn get(&self, key: &SheetKey) -> Option<Vec<Card>> {
        self.entries.get(key).map(|e| e.cards.clone())
    }

    pub fn entry(&self, key: &SheetKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store server data for `key`. Both the committed and synced copies are replaced.
    pub fn put(&mut self, key: &SheetKey, cards: &[Card]) {
        let now = Utc::now();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                cards: cards.to_vec(),
                synced: cards.to_vec(),
                synced_hash: Self::fingerprint(cards),
                loaded_at: now,
                synced_at: now,
            },
        );
    }

    /// Overwrite the committed cards for `key`, keeping its synced snapshot.
    /// Creates the entry (with an empty synced snapshot) if it does not exist.
    pub fn commit(&mut self, key: &SheetKey, cards: &[Card]) {
        match self.entries.get_mut(key) {
            Some(entry) => entry.cards = cards.to_vec(),
            None => {
                let now = Utc::now();
                self.entries.insert(
                    key.clone(),
                    CacheEntry {
                        cards: cards.to_vec(),
                        synced: Vec::new(),
                        synced_hash: Self::fingerprint(&[]),
                        loaded_at: now,
                        synced_at: now,
                    },
                );
            }
        }
    }

    /// Record `cards` as confirmed by the server.
    pub fn mark_synced(&mut self, key: &SheetKey, cards: &[Card]) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.synced = cards.to_vec();
                entry.synced_hash = Self::fingerprint(cards);
                entry.synced_at = Utc::now();
            }
            None => self.put(key, cards),
        }
    }

    /// Restore committed cards from the synced snapshot. Returns false if `key` is unknown.
    pub fn rollback(&mut self, key: &SheetKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.cards = entry.synced.clone();
                true
            }
            None => false,
        }
    }

    pub fn keys(&self) -> Vec<SheetKey> {
        let mut keys: Vec<SheetKey> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn summaries(&self) -> Vec<CacheSummary> {
        self.keys()
            .into_iter()
            .filter_map(|key| {
                self.entries.get(&key).map(|entry| CacheSummary {
                    card_count: entry.cards.len(),
                    unsynced: entry.has_unsynced_changes(),
                    synced_at: entry.synced_at,
                    key,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Card> {
        vec![Card::new(1, "a", "b", 1), Card::new(2, "c", "d", 2)]
    }

    #[test]
    fn test_put_stores_independent_copy() {
        let mut cache = SheetCache::new();
        let key = SheetKey::from("0");
        let mut cards = sample();
        cache.put(&key, &cards);

        cards[0].front = "changed".to_string();
        assert_eq!(cache.get(&key).unwrap()[0].front, "a");

        let mut copy = cache.get(&key).unwrap();
        copy.pop();
        assert_eq!(cache.get(&key).unwrap().len(), 2);
    }

    #[test]
    fn test_has_and_missing_key() {
        let mut cache = SheetCache::new();
        let key = SheetKey::from("1");
        assert!(!cache.has(&key));
        assert!(cache.get(&key).is_none());
        cache.put(&key, &[]);
        assert!(cache.has(&key));
        assert_eq!(cache.get(&key).unwrap().len(), 0);
    }

    #[test]
    fn test_commit_then_rollback() {
        let mut cache = SheetCache::new();
        let key = SheetKey::from("0");
        cache.put(&key, &sample());

        let mut edited = sample();
        edited[1].level = 5;
        cache.commit(&key, &edited);
        assert!(cache.entry(&key).unwrap().has_unsynced_changes());
        assert_eq!(cache.get(&key).unwrap()[1].level, 5);

        assert!(cache.rollback(&key));
        assert_eq!(cache.get(&key).unwrap()[1].level, 2);
        assert!(!cache.entry(&key).unwrap().has_unsynced_changes());
    }

    #[test]
    fn test_mark_synced_moves_rollback_point() {
        let mut cache = SheetCache::new();
        let key = SheetKey::from("0");
        cache.put(&key, &sample());
        let before = cache.entry(&key).unwrap().synced_hash.clone();

        let mut edited = sample();
        edited.pop();
        cache.commit(&key, &edited);
        cache.mark_synced(&key, &edited);

        let entry = cache.entry(&key).unwrap();
        assert_ne!(entry.synced_hash, before);
        assert!(!entry.has_unsynced_changes());
        cache.rollback(&key);
        assert_eq!(cache.get(&key).unwrap().len(), 1);
    }

    #[test]
    fn test_fingerprint_ignores_ids() {
        let a = vec![Card::new(1, "x", "y", 3)];
        let b = vec![Card::new(9, "x", "y", 3)];
        let c = vec![Card::new(1, "x", "y", 4)];
        assert_eq!(SheetCache::fingerprint(&a), SheetCache::fingerprint(&b));
        assert_ne!(SheetCache::fingerprint(&a), SheetCache::fingerprint(&c));
    }

    #[test]
    fn test_summaries_sorted_with_unsynced_flag() {
        let mut cache = SheetCache::new();
        assert!(cache.is_empty());
        cache.put(&SheetKey::from("3"), &sample());
        cache.put(&SheetKey::from("1"), &[]);
        let mut edited = sample();
        edited[0].back = "changed".to_string();
        cache.commit(&SheetKey::from("3"), &edited);

        let summaries = cache.summaries();
        assert_eq!(cache.len(), 2);
        assert_eq!(summaries[0].key, SheetKey::from("1"));
        assert_eq!(summaries[0].card_count, 0);
        assert!(!summaries[0].unsynced);
        assert_eq!(summaries[1].card_count, 2);
        assert!(summaries[1].unsynced);
    }

    #[test]
    fn test_rollback_unknown_key() {
        let mut cache = SheetCache::new();
        assert!(!cache.rollback(&SheetKey::from("missing")));
    }
}
