use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use crate::dispatcher::Completion;
use crate::error::ScheduleError;

/// Number of priority tiers.
pub const TIER_COUNT: usize = 5;

/// Group used when a caller does not name one.
pub const DEFAULT_GROUP: &str = "_default_";

/// Requested priority of a work item. Lower index is more urgent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    VeryHigh,
    High,
    #[default]
    Normal,
    Low,
    VeryLow,
}

impl Priority {
    pub fn index(self) -> usize {
        match self {
            Priority::VeryHigh => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
            Priority::VeryLow => 4,
        }
    }

    pub fn ordered() -> [Priority; TIER_COUNT] {
        [
            Priority::VeryHigh,
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::VeryLow,
        ]
    }

    pub fn from_index(index: usize) -> Option<Priority> {
        Self::ordered().get(index).copied()
    }

    /// Label used on the wire and as the tier name in snapshots.
    pub fn label(self) -> &'static str {
        match self {
            Priority::VeryHigh => "very high",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::VeryLow => "very low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Accepts the five labels (case-insensitive) or a tier index `0..=4`.
impl FromStr for Priority {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim();
        if let Ok(index) = value.parse::<usize>() {
            return Priority::from_index(index)
                .ok_or_else(|| ScheduleError::MalformedPriority(raw.to_string()));
        }
        Priority::ordered()
            .into_iter()
            .find(|priority| priority.label().eq_ignore_ascii_case(value))
            .ok_or_else(|| ScheduleError::MalformedPriority(raw.to_string()))
    }
}

impl TryFrom<u8> for Priority {
    type Error = ScheduleError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::from_index(usize::from(value))
            .ok_or_else(|| ScheduleError::MalformedPriority(value.to_string()))
    }
}

/// Fairness and throttling partition. Case-sensitive, never canonicalized.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        if name.is_empty() {
            Self::default()
        } else {
            Self(name)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GroupKey {
    fn default() -> Self {
        Self(DEFAULT_GROUP.to_string())
    }
}

impl From<&str> for GroupKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for GroupKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Option<&str>> for GroupKey {
    fn from(value: Option<&str>) -> Self {
        value.map(GroupKey::new).unwrap_or_default()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier handed out by [`crate::Dispatcher::schedule`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u64);

impl ItemId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unit of schedulable work.
///
/// `run` receives the item's [`Completion`]. The item is considered finished when
/// the completion is consumed with [`Completion::complete`] or dropped, whichever
/// happens first; work that fans out asynchronously should move the completion
/// into whatever finishes last.
pub trait WorkItem: Send + 'static {
    fn action_name(&self) -> &str;
    fn priority(&self) -> Priority;
    fn group(&self) -> &GroupKey;
    fn executor_name(&self) -> &str;
    /// Continuation of already-admitted work; skips the pending queue.
    fn in_flight(&self) -> bool;
    fn received_at(&self) -> Instant;
    fn run(self: Box<Self>, completion: Completion);
}

/// Point-in-time copy of an item's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkSummary {
    pub action_name: String,
    pub executor_name: String,
    pub priority: Priority,
    pub group: GroupKey,
    pub in_flight: bool,
    pub received_at: Instant,
}

impl WorkSummary {
    pub fn of(item: &dyn WorkItem) -> Self {
        Self {
            action_name: item.action_name().to_string(),
            executor_name: item.executor_name().to_string(),
            priority: item.priority(),
            group: item.group().clone(),
            in_flight: item.in_flight(),
            received_at: item.received_at(),
        }
    }
}

type RunFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Closure-backed [`WorkItem`].
pub struct FnWork {
    summary: WorkSummary,
    run: RunFn,
}

impl FnWork {
    pub fn builder(action_name: impl Into<String>, priority: Priority) -> FnWorkBuilder {
        FnWorkBuilder {
            summary: WorkSummary {
                action_name: action_name.into(),
                executor_name: crate::executor::DEFAULT_EXECUTOR.to_string(),
                priority,
                group: GroupKey::default(),
                in_flight: false,
                received_at: Instant::now(),
            },
        }
    }

    pub fn summary(&self) -> &WorkSummary {
        &self.summary
    }
}

impl fmt::Debug for FnWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWork")
            .field("summary", &self.summary)
            .field("run", &"<fn>")
            .finish()
    }
}

impl WorkItem for FnWork {
    fn action_name(&self) -> &str {
        &self.summary.action_name
    }

    fn priority(&self) -> Priority {
        self.summary.priority
    }

    fn group(&self) -> &GroupKey {
        &self.summary.group
    }

    fn executor_name(&self) -> &str {
        &self.summary.executor_name
    }

    fn in_flight(&self) -> bool {
        self.summary.in_flight
    }

    fn received_at(&self) -> Instant {
        self.summary.received_at
    }

    fn run(self: Box<Self>, completion: Completion) {
        (self.run)(completion)
    }
}

/// Builder for [`FnWork`].
#[derive(Clone, Debug)]
pub struct FnWorkBuilder {
    summary: WorkSummary,
}

impl FnWorkBuilder {
    pub fn group(mut self, group: impl Into<GroupKey>) -> Self {
        self.summary.group = group.into();
        self
    }

    pub fn executor(mut self, executor_name: impl Into<String>) -> Self {
        self.summary.executor_name = executor_name.into();
        self
    }

    pub fn in_flight(mut self, in_flight: bool) -> Self {
        self.summary.in_flight = in_flight;
        self
    }

    /// Overrides the admission timestamp (defaults to builder creation time).
    pub fn received_at(mut self, received_at: Instant) -> Self {
        self.summary.received_at = received_at;
        self
    }

    pub fn run<F>(self, run: F) -> FnWork
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        FnWork {
            summary: self.summary,
            run: Box::new(run),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryState {
    Running,
    Pending,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Running => "RUNNING",
            EntryState::Pending => "PENDING",
        }
    }
}

/// One row of [`Snapshot`]. `tier` is only set for pending items.
#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    pub state: EntryState,
    pub id: ItemId,
    pub tier: Option<&'static str>,
    pub work: WorkSummary,
}

/// Occupancy at one instant: running items first, then pending items in
/// tier order (most urgent first), group by group.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub fn running(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Running)
    }

    pub fn pending(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Pending)
    }
}

#[derive(Clone, Debug, Default)]
pub struct DispatcherStats {
    /// Items admitted by `schedule`.
    pub scheduled: u64,
    /// Items refused by the group throttler.
    pub rejected: u64,
    /// Items whose completion fired.
    pub completed: u64,
    /// Items whose `run` panicked.
    pub faults: u64,
    /// Items moved between tiers by aging passes.
    pub reprioritized: u64,
    pub active: u64,
    pub pending: u64,
    pub target_active_slots: u64,
    /// Sum of time spent pending (ns) for items that left the queue.
    pub queue_time_sum_ns: u64,
    pub queue_time_samples: u64,
    pub queue_time_p95_ns: u64,
    pub queue_time_p99_ns: u64,
    pub queue_time_histogram: Vec<QueueTimeBucket>,
    /// Groups with the most running items, largest first.
    pub top_groups: Vec<GroupCount>,
}

#[derive(Clone, Debug, Default)]
pub struct QueueTimeBucket {
    pub le_ns: u64,
    pub count: u64,
}

#[derive(Clone, Debug)]
pub struct GroupCount {
    pub group: GroupKey,
    pub count: u64,
}
