use std::collections::HashMap;

use rand::Rng;

use crate::api::{GroupKey, Priority};
use crate::config::TieBreak;
use crate::queue::Prioritized;
use crate::state::GroupQueue;

/// One priority level: waiting items partitioned into per-group FIFOs.
///
/// Polling serves the group with the fewest items currently running, so a group
/// with a deep backlog cannot starve a light one sharing the tier.
#[derive(Debug)]
pub(crate) struct Tier<T> {
    index: usize,
    groups: Vec<GroupQueue<T>>,
    cursor: usize,
}

impl<T: Prioritized> Tier<T> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            groups: Vec::new(),
            cursor: 0,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        Priority::from_index(self.index)
            .map(Priority::label)
            .unwrap_or("unknown")
    }

    pub(crate) fn offer(&mut self, item: T) {
        let position = self
            .groups
            .iter()
            .position(|group| &group.name == item.group());
        match position {
            Some(idx) => self.groups[idx].offer(item),
            None => {
                let mut group = GroupQueue::new(item.group().clone());
                group.offer(item);
                self.groups.push(group);
            }
        }
    }

    /// `usage` is the number of running items per group.
    pub(crate) fn poll<R: Rng>(
        &mut self,
        usage: &HashMap<GroupKey, usize>,
        tie_break: TieBreak,
        rng: &mut R,
    ) -> Option<T> {
        self.prune();
        match self.groups.len() {
            0 => return None,
            1 => return self.groups[0].poll(),
            _ => {}
        }

        let usage_of = |group: &GroupQueue<T>| usage.get(&group.name).copied().unwrap_or(0);
        let min_usage = self.groups.iter().map(usage_of).min()?;
        let tied: Vec<usize> = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, group)| usage_of(*group) == min_usage)
            .map(|(idx, _)| idx)
            .collect();

        let chosen = match tie_break {
            TieBreak::Random => tied[rng.random_range(0..tied.len())],
            TieBreak::RoundRobin => {
                let pick = tied
                    .iter()
                    .copied()
                    .find(|idx| *idx >= self.cursor)
                    .unwrap_or(tied[0]);
                self.cursor = pick + 1;
                pick
            }
        };
        self.groups[chosen].poll()
    }

    /// Groups left empty are dropped, since aging passes reach tiers that
    /// `poll` may not visit for a long time.
    pub(crate) fn extract_where<F>(&mut self, mut predicate: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let extracted = self
            .groups
            .iter_mut()
            .flat_map(|group| group.extract_where(&mut predicate))
            .collect();
        self.prune();
        extracted
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.iter().map(GroupQueue::len).sum()
    }

    pub(crate) fn groups(&self) -> impl Iterator<Item = &GroupQueue<T>> {
        self.groups.iter().filter(|group| !group.is_empty())
    }

    fn prune(&mut self) {
        let cursor = self.cursor;
        let mut index = 0;
        let mut removed_before_cursor = 0;
        self.groups.retain(|group| {
            let keep = !group.is_empty();
            if !keep && index < cursor {
                removed_before_cursor += 1;
            }
            index += 1;
            keep
        });
        self.cursor = cursor - removed_before_cursor;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[derive(Debug)]
    struct Item {
        group: GroupKey,
        seq: u32,
    }

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            Priority::Normal
        }
        fn group(&self) -> &GroupKey {
            &self.group
        }
        fn in_flight(&self) -> bool {
            false
        }
        fn received_at(&self) -> Instant {
            Instant::now()
        }
    }

    fn item(group: &str, seq: u32) -> Item {
        Item {
            group: GroupKey::from(group),
            seq,
        }
    }

    fn poll_group(
        tier: &mut Tier<Item>,
        usage: &HashMap<GroupKey, usize>,
        rng: &mut StdRng,
    ) -> Option<(String, u32)> {
        tier.poll(usage, TieBreak::Random, rng)
            .map(|item| (item.group.to_string(), item.seq))
    }

    #[test]
    fn empty_tier_polls_nothing() {
        let mut tier: Tier<Item> = Tier::new(2);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(poll_group(&mut tier, &HashMap::new(), &mut rng).is_none());
        assert_eq!(tier.name(), "normal");
    }

    #[test]
    fn single_group_is_fifo() {
        let mut tier = Tier::new(0);
        let mut rng = StdRng::seed_from_u64(1);
        for seq in 0..3 {
            tier.offer(item("a", seq));
        }
        let usage = HashMap::from([(GroupKey::from("a"), 5)]);
        let order: Vec<u32> = std::iter::from_fn(|| poll_group(&mut tier, &usage, &mut rng))
            .map(|(_, seq)| seq)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn least_busy_group_is_served_first() {
        let mut tier = Tier::new(1);
        let mut rng = StdRng::seed_from_u64(7);
        for seq in 0..10 {
            tier.offer(item("heavy", seq));
        }
        tier.offer(item("light", 0));

        let usage = HashMap::from([(GroupKey::from("heavy"), 3)]);
        assert_eq!(
            poll_group(&mut tier, &usage, &mut rng),
            Some(("light".to_string(), 0))
        );
        // light is drained and pruned; heavy continues in order
        assert_eq!(
            poll_group(&mut tier, &usage, &mut rng),
            Some(("heavy".to_string(), 0))
        );
        assert_eq!(tier.groups().count(), 1);
    }

    #[test]
    fn ties_split_roughly_evenly() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut light_first = 0;
        let rounds = 2_000;
        for _ in 0..rounds {
            let mut tier = Tier::new(3);
            for seq in 0..10 {
                tier.offer(item("a", seq));
            }
            tier.offer(item("b", 0));
            if let Some((group, _)) = poll_group(&mut tier, &HashMap::new(), &mut rng) {
                if group == "b" {
                    light_first += 1;
                }
            }
        }
        let ratio = light_first as f64 / rounds as f64;
        assert!((0.4..0.6).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn round_robin_rotates_through_tied_groups() {
        let mut tier = Tier::new(2);
        let mut rng = StdRng::seed_from_u64(0);
        for group in ["a", "b", "c"] {
            for seq in 0..2 {
                tier.offer(item(group, seq));
            }
        }
        let usage = HashMap::new();
        let order: Vec<String> =
            std::iter::from_fn(|| tier.poll(&usage, TieBreak::RoundRobin, &mut rng))
                .map(|item| item.group.to_string())
                .collect();
        assert_eq!(order, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn extract_where_spans_groups() {
        let mut tier = Tier::new(4);
        tier.offer(item("a", 1));
        tier.offer(item("b", 2));
        tier.offer(item("a", 3));
        let extracted = tier.extract_where(|item| item.seq >= 2);
        assert_eq!(extracted.len(), 2);
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn extract_where_drops_emptied_groups() {
        let mut tier = Tier::new(3);
        for seq in 0..5_000 {
            tier.offer(item(&format!("g{seq}"), seq));
        }
        tier.offer(item("g0", 9_999));

        let moved = tier.extract_where(|item| item.seq != 9_999);
        assert_eq!(moved.len(), 5_000);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.groups.len(), 1);
        assert_eq!(tier.groups[0].name, GroupKey::from("g0"));
    }

    #[test]
    fn round_robin_cursor_survives_extraction() {
        let mut tier = Tier::new(2);
        let mut rng = StdRng::seed_from_u64(0);
        for group in ["a", "b", "c"] {
            tier.offer(item(group, 0));
            tier.offer(item(group, 1));
        }
        let usage = HashMap::new();
        let first = tier.poll(&usage, TieBreak::RoundRobin, &mut rng).map(|i| i.group);
        assert_eq!(first, Some(GroupKey::from("a")));

        // empties group "a", which sits before the cursor
        tier.extract_where(|item| item.group.as_str() == "a");
        let order: Vec<String> =
            std::iter::from_fn(|| tier.poll(&usage, TieBreak::RoundRobin, &mut rng))
                .map(|item| item.group.to_string())
                .collect();
        assert_eq!(order, vec!["b", "c", "b", "c"]);
    }
}
