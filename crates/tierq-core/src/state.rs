use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::GroupKey;

/// Upper bounds (ns) of the queue-time histogram buckets.
pub(crate) const QUEUE_TIME_BUCKETS_NS: [u64; 10] = [
    100_000,
    1_000_000,
    5_000_000,
    10_000_000,
    50_000_000,
    100_000_000,
    500_000_000,
    1_000_000_000,
    10_000_000_000,
    u64::MAX,
];

/// FIFO of waiting items for one (tier, group) pair.
#[derive(Debug)]
pub(crate) struct GroupQueue<T> {
    pub(crate) name: GroupKey,
    items: VecDeque<T>,
}

impl<T> GroupQueue<T> {
    pub(crate) fn new(name: GroupKey) -> Self {
        Self {
            name,
            items: VecDeque::new(),
        }
    }

    pub(crate) fn offer(&mut self, item: T) {
        self.items.push_back(item);
    }

    pub(crate) fn poll(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Removes every matching item; the remainder keeps its order.
    pub(crate) fn extract_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut extracted = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if predicate(&item) {
                extracted.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        extracted
    }
}

#[derive(Debug)]
pub(crate) struct StatsCounters {
    pub(crate) scheduled: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) faults: AtomicU64,
    pub(crate) reprioritized: AtomicU64,
    pub(crate) queue_time_sum_ns: AtomicU64,
    pub(crate) queue_time_samples: AtomicU64,
    pub(crate) queue_time_buckets: [AtomicU64; QUEUE_TIME_BUCKETS_NS.len()],
}

impl StatsCounters {
    pub(crate) fn new() -> Self {
        Self {
            scheduled: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            reprioritized: AtomicU64::new(0),
            queue_time_sum_ns: AtomicU64::new(0),
            queue_time_samples: AtomicU64::new(0),
            queue_time_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Saturating add; counters stick at `u64::MAX` instead of wrapping.
    pub(crate) fn bump(counter: &AtomicU64, delta: u64) {
        if delta > 0 {
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_add(delta))
            });
        }
    }

    pub(crate) fn record_queue_time(&self, queue_time_ns: u64) {
        Self::bump(&self.queue_time_sum_ns, queue_time_ns);
        Self::bump(&self.queue_time_samples, 1);
        let bucket = QUEUE_TIME_BUCKETS_NS.partition_point(|bound| *bound < queue_time_ns);
        if let Some(counter) = self.queue_time_buckets.get(bucket) {
            Self::bump(counter, 1);
        }
    }

    pub(crate) fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
