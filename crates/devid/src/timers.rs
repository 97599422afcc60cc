//! Host-side timer queue behind `setTimeout` and `setInterval`.
//!
//! The queue only tracks ids and deadlines. The callbacks themselves stay on
//! the JavaScript side and are looked up by id when a timer fires.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Repeating timers never fire more often than this.
pub const MIN_INTERVAL: Duration = Duration::from_millis(4);

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: (Instant, u64),
    interval: Option<Duration>,
}

/// Pending timers ordered by deadline, then by scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u32,
    seq: u64,
    due: BTreeMap<(Instant, u64), u32>,
    entries: HashMap<u32, Entry>,
}

impl TimerQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer `delay` after `now`, returning its id (never 0).
    pub fn schedule(&mut self, now: Instant, delay: Duration, repeat: bool) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        let interval = repeat.then(|| delay.max(MIN_INTERVAL));
        let key = self.insert(id, now + interval.unwrap_or(delay));
        self.entries.insert(id, Entry { key, interval });
        tracing::trace!(id, delay_ms = delay.as_millis() as u64, repeat, "timer scheduled");
        id
    }

    /// Cancel a timer. Unknown ids are ignored.
    pub fn cancel(&mut self, id: u32) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.due.remove(&entry.key);
                true
            }
            None => false,
        }
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.due.keys().next().map(|(at, _)| *at)
    }

    /// Take the next timer due at or before `now`.
    ///
    /// Repeating timers are rescheduled relative to `now` before being
    /// returned; one-shot timers are forgotten.
    pub fn pop_due(&mut self, now: Instant) -> Option<u32> {
        let (&key, &id) = self.due.iter().next().filter(|((at, _), _)| *at <= now)?;
        self.due.remove(&key);

        match self.entries.get(&id).and_then(|e| e.interval) {
            Some(interval) => {
                let key = self.insert(id, now + interval);
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.key = key;
                }
            }
            None => {
                self.entries.remove(&id);
            }
        }
        Some(id)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, id: u32, at: Instant) -> (Instant, u64) {
        self.seq += 1;
        let key = (at, self.seq);
        self.due.insert(key, id);
        key
    }
}
