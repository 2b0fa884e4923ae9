//! Bounded record of batches this process already submitted.
//!
//! Entries are kept in insertion order and the oldest are dropped once the capacity is exceeded.
//! The cache does not survive a restart; the indexer cross-check covers what it forgets.

use crate::records::PendingRecord;
use indexmap::IndexMap;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub election_id: u64,
    pub voter_ids: HashSet<String>,
    pub fingerprints: HashSet<String>,
}

#[derive(Debug)]
pub struct ProcessedCache {
    entries: IndexMap<String, CacheEntry>,
    max_entries: usize,
}

impl ProcessedCache {
    pub fn new(max_entries: usize) -> Self {
        ProcessedCache {
            entries: IndexMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remember a submitted batch. Drops the oldest entries if this goes over capacity.
    ///
    /// Inserting under an existing batch id adds to that entry.
    pub fn insert<R: PendingRecord>(&mut self, batch_id: &str, election_id: u64, records: &[R]) {
        let entry = self
            .entries
            .entry(batch_id.to_string())
            .or_insert_with(|| CacheEntry {
                election_id,
                voter_ids: HashSet::new(),
                fingerprints: HashSet::new(),
            });
        entry.voter_ids.extend(records.iter().map(|r| r.voter_id()));
        entry
            .fingerprints
            .extend(records.iter().flat_map(|r| r.fingerprints()));
        self.evict_oldest();
    }

    /// Drop entries beyond capacity, oldest first. Returns how many were dropped.
    pub fn evict_oldest(&mut self) -> usize {
        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess > 0 {
            self.entries.drain(..excess);
            tracing::debug!(evicted = excess, "evicted oldest cache entries");
        }
        excess
    }

    pub fn is_processed(&self, election_id: u64, voter_id: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.election_id == election_id && e.voter_ids.contains(voter_id))
    }

    pub fn is_fingerprint_processed(&self, election_id: u64, fingerprint: &str) -> bool {
        self.entries
            .values()
            .any(|e| e.election_id == election_id && e.fingerprints.contains(fingerprint))
    }

    /// True if the record's voter, or any of its payload fingerprints, was already submitted
    pub fn contains<R: PendingRecord>(&self, record: &R) -> bool {
        let election_id = record.election_id();
        self.is_processed(election_id, &record.voter_id())
            || record
                .fingerprints()
                .iter()
                .any(|f| self.is_fingerprint_processed(election_id, f))
    }

    pub fn batch_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
