//! Per-group admission control.
//!
//! A group's count covers every item admitted and not yet released, pending or
//! running. Once a group holds `max_group_size` items, further admissions for it
//! are rejected until something completes.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::api::GroupKey;
use crate::config::ThrottleSettings;
use crate::error::ScheduleError;

/// Proof that an admission was counted. Hand it back to [`GroupThrottler::release`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleTicket {
    group: GroupKey,
    epoch: u64,
}

#[derive(Debug)]
struct ThrottleState {
    settings: ThrottleSettings,
    counts: HashMap<GroupKey, usize>,
    /// Bumped whenever counting restarts; tickets from older epochs are ignored.
    epoch: u64,
}

#[derive(Debug)]
pub struct GroupThrottler {
    state: Mutex<ThrottleState>,
}

impl GroupThrottler {
    pub fn new(settings: ThrottleSettings) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                settings,
                counts: HashMap::new(),
                epoch: 0,
            }),
        }
    }

    /// Counts one more outstanding item for `group`.
    ///
    /// Returns `Ok(None)` when the item is not counted (throttling disabled or an
    /// exempt in-flight continuation).
    pub fn admit(
        &self,
        group: &GroupKey,
        in_flight: bool,
    ) -> Result<Option<ThrottleTicket>, ScheduleError> {
        let mut state = self.state.lock();
        if !state.settings.enabled || (in_flight && state.settings.exempt_in_flight) {
            return Ok(None);
        }

        let limit = state.settings.max_group_size;
        let count = state.counts.entry(group.clone()).or_insert(0);
        let previous = *count;
        *count += 1;
        if previous >= limit {
            *count -= 1;
            if *count == 0 {
                state.counts.remove(group);
            }
            return Err(ScheduleError::AdmissionRejected {
                group: group.clone(),
                limit,
            });
        }

        Ok(Some(ThrottleTicket {
            group: group.clone(),
            epoch: state.epoch,
        }))
    }

    pub fn release(&self, ticket: ThrottleTicket) {
        let mut state = self.state.lock();
        if !state.settings.enabled || ticket.epoch != state.epoch {
            return;
        }
        let Some(count) = state.counts.get_mut(&ticket.group) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            state.counts.remove(&ticket.group);
        }
    }

    /// Applies new settings. Toggling `enabled` either way forgets all counts.
    pub fn apply(&self, settings: &ThrottleSettings) {
        let mut state = self.state.lock();
        if state.settings.enabled != settings.enabled {
            state.counts.clear();
            state.epoch += 1;
        }
        state.settings = settings.clone();
    }

    pub fn settings(&self) -> ThrottleSettings {
        self.state.lock().settings.clone()
    }

    pub fn outstanding(&self, group: &GroupKey) -> usize {
        self.state.lock().counts.get(group).copied().unwrap_or(0)
    }

    pub fn tracked_groups(&self) -> usize {
        self.state.lock().counts.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn throttler(max_group_size: usize) -> GroupThrottler {
        GroupThrottler::new(ThrottleSettings {
            enabled: true,
            max_group_size,
            exempt_in_flight: false,
        })
    }

    #[test]
    fn rejects_once_group_is_full() {
        let throttler = throttler(2);
        let g = GroupKey::from("g");
        let first = throttler.admit(&g, false).unwrap().unwrap();
        let _second = throttler.admit(&g, false).unwrap().unwrap();

        let err = throttler.admit(&g, false).unwrap_err();
        assert_eq!(
            err,
            ScheduleError::AdmissionRejected {
                group: g.clone(),
                limit: 2
            }
        );
        // the rejected item is not counted
        assert_eq!(throttler.outstanding(&g), 2);

        throttler.release(first);
        assert!(throttler.admit(&g, false).is_ok());
    }

    #[test]
    fn groups_are_independent() {
        let throttler = throttler(1);
        assert!(throttler.admit(&GroupKey::from("a"), false).is_ok());
        assert!(throttler.admit(&GroupKey::from("A"), false).is_ok());
        assert!(throttler.admit(&GroupKey::from("a"), false).is_err());
    }

    #[test]
    fn released_groups_are_forgotten() {
        let throttler = throttler(5);
        let g = GroupKey::from("g");
        let ticket = throttler.admit(&g, false).unwrap().unwrap();
        assert_eq!(throttler.tracked_groups(), 1);
        throttler.release(ticket.clone());
        assert_eq!(throttler.tracked_groups(), 0);
        // a second release of the same ticket does nothing
        throttler.release(ticket);
        assert_eq!(throttler.outstanding(&g), 0);
    }

    #[test]
    fn disabled_admits_everything() {
        let throttler = GroupThrottler::new(ThrottleSettings {
            enabled: false,
            max_group_size: 1,
            exempt_in_flight: false,
        });
        let g = GroupKey::from("g");
        for _ in 0..10 {
            assert_eq!(throttler.admit(&g, false), Ok(None));
        }
        assert_eq!(throttler.tracked_groups(), 0);
    }

    #[test]
    fn toggling_forgives_history() {
        let throttler = throttler(1);
        let g = GroupKey::from("g");
        let stale = throttler.admit(&g, false).unwrap().unwrap();

        let mut settings = throttler.settings();
        settings.enabled = false;
        throttler.apply(&settings);
        settings.enabled = true;
        throttler.apply(&settings);

        let fresh = throttler.admit(&g, false).unwrap().unwrap();
        // the pre-toggle ticket must not free the fresh slot
        throttler.release(stale);
        assert_eq!(throttler.outstanding(&g), 1);
        assert!(throttler.admit(&g, false).is_err());

        throttler.release(fresh);
        assert_eq!(throttler.outstanding(&g), 0);
    }

    #[test]
    fn limit_changes_apply_to_next_admission() {
        let throttler = throttler(1);
        let g = GroupKey::from("g");
        let _held = throttler.admit(&g, false).unwrap();
        assert!(throttler.admit(&g, false).is_err());

        let mut settings = throttler.settings();
        settings.max_group_size = 3;
        throttler.apply(&settings);
        assert!(throttler.admit(&g, false).is_ok());
        // counts survive a limit change
        assert_eq!(throttler.outstanding(&g), 2);
    }

    #[test]
    fn in_flight_is_counted_unless_exempt() {
        let throttler = throttler(1);
        let g = GroupKey::from("g");
        let _held = throttler.admit(&g, false).unwrap();
        assert!(throttler.admit(&g, true).is_err());

        let mut settings = throttler.settings();
        settings.exempt_in_flight = true;
        throttler.apply(&settings);
        assert_eq!(throttler.admit(&g, true), Ok(None));
        assert_eq!(throttler.outstanding(&g), 1);
    }

    proptest! {
        #[test]
        fn counts_track_admitted_minus_released(
            ops in proptest::collection::vec((0u8..3, any::<bool>()), 1..200),
            limit in 1usize..6,
        ) {
            let throttler = throttler(limit);
            let groups = [GroupKey::from("a"), GroupKey::from("b"), GroupKey::from("c")];
            let mut held: Vec<Vec<ThrottleTicket>> = vec![Vec::new(), Vec::new(), Vec::new()];

            for (group_idx, admit) in ops {
                let idx = group_idx as usize;
                if admit {
                    match throttler.admit(&groups[idx], false) {
                        Ok(Some(ticket)) => held[idx].push(ticket),
                        Ok(None) => prop_assert!(false, "enabled throttler must count"),
                        Err(_) => prop_assert_eq!(held[idx].len(), limit),
                    }
                } else if let Some(ticket) = held[idx].pop() {
                    throttler.release(ticket);
                }

                for (idx, group) in groups.iter().enumerate() {
                    prop_assert_eq!(throttler.outstanding(group), held[idx].len());
                    prop_assert!(held[idx].len() <= limit);
                }
                let non_zero = held.iter().filter(|tickets| !tickets.is_empty()).count();
                prop_assert_eq!(throttler.tracked_groups(), non_zero);
            }
        }
    }
}
