//! Tiered priority queue with aging.
//!
//! An item's tier is `priority - floor((now - received_at) / deadline)`, clamped
//! at 0, so waiting items climb one tier per deadline. In-flight items always
//! land in tier 0. Polls drain tiers strictly in order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::api::{GroupKey, Priority, TIER_COUNT};
use crate::config::{DispatcherConfig, TieBreak};
use crate::state::GroupQueue;
use crate::tier::Tier;

/// What the queue needs to know about an item to place it.
pub trait Prioritized {
    fn priority(&self) -> Priority;
    fn group(&self) -> &GroupKey;
    fn in_flight(&self) -> bool;
    fn received_at(&self) -> Instant;
}

#[derive(Debug)]
pub struct TieredQueue<T> {
    tiers: [Tier<T>; TIER_COUNT],
    deadline: Duration,
    reprioritize_interval: Duration,
    next_reprioritize_at: Option<Instant>,
    tie_break: TieBreak,
    rng: StdRng,
}

impl<T: Prioritized> TieredQueue<T> {
    pub fn new(config: &DispatcherConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            tiers: std::array::from_fn(Tier::new),
            deadline: config.deadline(),
            reprioritize_interval: config.reprioritize_interval(),
            next_reprioritize_at: None,
            tie_break: config.tie_break,
            rng,
        }
    }

    /// Applies live tunables. Takes effect on the next offer or aging pass.
    pub fn apply(&mut self, config: &DispatcherConfig) {
        self.deadline = config.deadline();
        self.reprioritize_interval = config.reprioritize_interval();
        self.tie_break = config.tie_break;
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn tier_index_at(&self, item: &T, now: Instant) -> usize {
        tier_for(item, now, self.deadline.as_nanos().max(1))
    }

    pub fn offer(&mut self, item: T) {
        self.offer_at(item, Instant::now());
    }

    pub fn offer_at(&mut self, item: T, now: Instant) {
        let tier = self.tier_index_at(&item, now);
        self.tiers[tier].offer(item);
    }

    /// Most urgent item, after an aging pass if one is due. `usage` is the number
    /// of running items per group.
    pub fn poll(&mut self, usage: &HashMap<GroupKey, usize>) -> Option<T> {
        self.poll_at(Instant::now(), usage)
    }

    pub fn poll_at(&mut self, now: Instant, usage: &HashMap<GroupKey, usize>) -> Option<T> {
        self.poll_with_tier_at(now, usage).map(|(_, item)| item)
    }

    pub(crate) fn poll_with_tier_at(
        &mut self,
        now: Instant,
        usage: &HashMap<GroupKey, usize>,
    ) -> Option<(usize, T)> {
        self.reprioritize_at(now);
        let tie_break = self.tie_break;
        for (index, tier) in self.tiers.iter_mut().enumerate() {
            if let Some(item) = tier.poll(usage, tie_break, &mut self.rng) {
                return Some((index, item));
            }
        }
        None
    }

    /// Re-buckets items whose tier has changed, at most once per interval.
    /// Tier 0 is never scanned. Returns how many items moved.
    pub fn reprioritize_at(&mut self, now: Instant) -> usize {
        if let Some(next) = self.next_reprioritize_at {
            if now < next {
                return 0;
            }
        }
        self.next_reprioritize_at = Some(now + self.reprioritize_interval);

        let deadline_ns = self.deadline.as_nanos().max(1);
        let mut moved = Vec::new();
        for index in 1..TIER_COUNT {
            let extracted = self.tiers[index]
                .extract_where(|item| tier_for(item, now, deadline_ns) != index);
            moved.extend(extracted);
        }

        let count = moved.len();
        for item in moved {
            self.offer_at(item, now);
        }
        if count > 0 {
            debug!(moved = count, "reprioritized pending items");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(Tier::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tier_len(&self, index: usize) -> usize {
        self.tiers.get(index).map(Tier::len).unwrap_or(0)
    }

    /// Pending items as (tier name, group, item), most urgent tier first.
    pub fn pending(&self) -> impl Iterator<Item = (&'static str, &GroupKey, &T)> {
        self.tiers.iter().flat_map(|tier| {
            let name = tier.name();
            tier.groups().flat_map(move |group: &GroupQueue<T>| {
                group.iter().map(move |item| (name, &group.name, item))
            })
        })
    }
}

fn tier_for<T: Prioritized>(item: &T, now: Instant, deadline_ns: u128) -> usize {
    if item.in_flight() {
        return 0;
    }
    let elapsed = now.saturating_duration_since(item.received_at()).as_nanos();
    let shift = usize::try_from(elapsed / deadline_ns).unwrap_or(usize::MAX);
    item.priority().index().saturating_sub(shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item {
        name: &'static str,
        priority: Priority,
        group: GroupKey,
        in_flight: bool,
        received_at: Instant,
    }

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            self.priority
        }
        fn group(&self) -> &GroupKey {
            &self.group
        }
        fn in_flight(&self) -> bool {
            self.in_flight
        }
        fn received_at(&self) -> Instant {
            self.received_at
        }
    }

    fn item(name: &'static str, priority: Priority, received_at: Instant) -> Item {
        Item {
            name,
            priority,
            group: GroupKey::default(),
            in_flight: false,
            received_at,
        }
    }

    fn queue(deadline_seconds: u64, interval_ms: u64) -> TieredQueue<Item> {
        TieredQueue::new(&DispatcherConfig {
            deadline_seconds,
            reprioritize_interval_ms: interval_ms,
            seed: Some(11),
            ..DispatcherConfig::default()
        })
    }

    fn drain(queue: &mut TieredQueue<Item>, now: Instant) -> Vec<&'static str> {
        let usage = HashMap::new();
        std::iter::from_fn(|| queue.poll_at(now, &usage))
            .map(|item| item.name)
            .collect()
    }

    #[test]
    fn drains_tiers_in_priority_order() {
        let base = Instant::now();
        let mut queue = queue(10, 1_000);
        queue.offer_at(item("low", Priority::Low, base), base);
        queue.offer_at(item("very-low", Priority::VeryLow, base), base);
        queue.offer_at(item("very-high", Priority::VeryHigh, base), base);
        queue.offer_at(item("normal", Priority::Normal, base), base);
        queue.offer_at(item("high", Priority::High, base), base);

        assert_eq!(
            drain(&mut queue, base),
            vec!["very-high", "high", "normal", "low", "very-low"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn in_flight_items_go_to_tier_zero() {
        let base = Instant::now();
        let mut queue = queue(10, 1_000);
        queue.offer_at(item("urgent", Priority::VeryHigh, base), base);
        let mut continuation = item("continuation", Priority::VeryLow, base);
        continuation.in_flight = true;
        assert_eq!(queue.tier_index_at(&continuation, base), 0);
        queue.offer_at(continuation, base);
        assert_eq!(queue.tier_len(0), 2);
    }

    #[test]
    fn offer_places_aged_items_higher() {
        let base = Instant::now();
        let queue = queue(1, 1_000);
        let aged = item("aged", Priority::Low, base);
        assert_eq!(queue.tier_index_at(&aged, base), 3);
        assert_eq!(queue.tier_index_at(&aged, base + Duration::from_millis(1_500)), 2);
        assert_eq!(queue.tier_index_at(&aged, base + Duration::from_secs(30)), 0);
    }

    #[test]
    fn aging_is_measured_from_receipt_forward() {
        // A timestamp in the future (clock skew between producer and queue) must
        // not push an item toward lower urgency.
        let base = Instant::now();
        let queue = queue(1, 1_000);
        let early = item("early", Priority::Normal, base + Duration::from_secs(5));
        assert_eq!(queue.tier_index_at(&early, base), 2);

        let waited = item("waited", Priority::Normal, base);
        assert!(
            queue.tier_index_at(&waited, base + Duration::from_secs(2))
                < queue.tier_index_at(&waited, base)
        );
    }

    #[test]
    fn reprioritization_promotes_waiting_items() {
        let base = Instant::now();
        let mut queue = queue(1, 1);
        queue.offer_at(item("old-low", Priority::Low, base), base);
        assert_eq!(queue.tier_len(3), 1);

        let later = base + Duration::from_millis(3_500);
        assert_eq!(queue.reprioritize_at(later), 1);
        assert_eq!(queue.tier_len(0), 1);
        assert_eq!(queue.tier_len(3), 0);
    }

    #[test]
    fn reprioritization_is_rate_limited() {
        let base = Instant::now();
        let mut queue = queue(1, 1_000);
        queue.offer_at(item("a", Priority::VeryLow, base), base);

        // first pass arms the interval
        assert_eq!(queue.reprioritize_at(base), 0);
        // within the interval nothing moves even though the item has aged
        assert_eq!(queue.reprioritize_at(base + Duration::from_millis(999)), 0);
        assert_eq!(queue.tier_len(4), 1);
        // after the interval it moves
        assert_eq!(queue.reprioritize_at(base + Duration::from_secs(2)), 1);
        assert_eq!(queue.tier_len(2), 1);
    }

    #[test]
    fn aged_item_overtakes_fresh_higher_priority() {
        let base = Instant::now();
        let mut queue = queue(1, 1);
        queue.offer_at(item("stale", Priority::VeryLow, base), base);
        let later = base + Duration::from_secs(4);
        queue.offer_at(item("fresh", Priority::High, later), later);

        assert_eq!(drain(&mut queue, later), vec!["stale", "fresh"]);
    }

    #[test]
    fn tier_zero_is_not_rescanned() {
        let base = Instant::now();
        let mut queue = queue(1, 1);
        let mut continuation = item("cont", Priority::VeryLow, base);
        continuation.in_flight = true;
        queue.offer_at(continuation, base);
        assert_eq!(queue.reprioritize_at(base + Duration::from_secs(60)), 0);
        assert_eq!(queue.tier_len(0), 1);
    }

    #[test]
    fn deadline_change_applies_to_next_pass() {
        let base = Instant::now();
        let mut queue = queue(100, 1);
        queue.offer_at(item("a", Priority::VeryLow, base), base);
        let later = base + Duration::from_secs(5);
        assert_eq!(queue.reprioritize_at(later), 0);

        queue.apply(&DispatcherConfig {
            deadline_seconds: 1,
            reprioritize_interval_ms: 1,
            ..DispatcherConfig::default()
        });
        assert_eq!(queue.deadline(), Duration::from_secs(1));
        assert_eq!(queue.reprioritize_at(later + Duration::from_millis(1)), 1);
        assert_eq!(queue.tier_len(0), 1);
    }

    #[test]
    fn pending_lists_tier_and_group() {
        let base = Instant::now();
        let mut queue = queue(10, 1_000);
        let mut a = item("a", Priority::High, base);
        a.group = GroupKey::from("tenant-a");
        queue.offer_at(a, base);
        queue.offer_at(item("b", Priority::VeryLow, base), base);

        let rows: Vec<(&str, String, &str)> = queue
            .pending()
            .map(|(tier, group, item)| (tier, group.to_string(), item.name))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("high", "tenant-a".to_string(), "a"),
                ("very low", "_default_".to_string(), "b"),
            ]
        );
    }
}
