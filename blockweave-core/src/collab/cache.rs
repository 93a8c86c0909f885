//! Session-scoped cache of the last record this session wrote per key.
//!
//! Entries expire after the configured TTL and are invalidated explicitly
//! whenever a remote change or a delete touches the key.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codec::Record;

#[derive(Debug)]
pub struct RecordCache {
    ttl: Duration,
    entries: HashMap<String, (Record, Instant)>,
}

impl RecordCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Whether `record` equals what was last written for its key and that
    /// write is younger than the TTL.
    pub fn is_fresh(&self, record: &Record, now: Instant) -> bool {
        self.entries
            .get(&record.id)
            .is_some_and(|(cached, at)| cached == record && now.duration_since(*at) < self.ttl)
    }

    pub fn store(&mut self, record: Record, now: Instant) {
        self.entries.insert(record.id.clone(), (record, now));
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries older than the TTL.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (_, at)| now.duration_since(*at) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
