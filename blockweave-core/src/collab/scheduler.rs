//! Time source and per-key debounce scheduling.
//!
//! The engine never sleeps. Callers ask which keys are due at "now" and the
//! clock is injected, so tests drive time by hand with [`ManualClock`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One cancellable deadline per key, re-armed on every [`schedule`](Self::schedule).
#[derive(Debug)]
pub struct DebounceScheduler<K> {
    delay: Duration,
    deadlines: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> DebounceScheduler<K> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadlines: HashMap::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm (or push back) the deadline for `key`. Returns `true` if the key
    /// was not already pending.
    pub fn schedule(&mut self, key: K, now: Instant) -> bool {
        self.deadlines.insert(key, now + self.delay).is_none()
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.deadlines.len();
        self.deadlines.clear();
        count
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &K> {
        self.deadlines.keys()
    }

    /// Earliest deadline still armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn due(&mut self, now: Instant) -> Vec<K> {
        let mut expired: Vec<(K, Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (key.clone(), *deadline))
            .collect();
        expired.sort_by_key(|(_, deadline)| *deadline);
        for (key, _) in &expired {
            self.deadlines.remove(key);
        }
        expired.into_iter().map(|(key, _)| key).collect()
    }

    /// Remove and return every pending key regardless of deadline.
    pub fn drain(&mut self) -> Vec<K> {
        let mut all: Vec<(K, Instant)> = self.deadlines.drain().collect();
        all.sort_by_key(|(_, deadline)| *deadline);
        all.into_iter().map(|(key, _)| key).collect()
    }
}
