//! Admission and dispatch.
//!
//! `schedule` admits an item through the group throttler, then either launches it
//! right away (in-flight continuations) or queues it and fills free slots from the
//! tiered queue. Every slot is released by the item's [`Completion`], which fires
//! exactly once: explicitly, or when the handle is dropped.
//!
//! All bookkeeping happens under one lock. Items are handed to executors only
//! after the lock is released, so an executor that runs work inline and completes
//! it synchronously never re-enters the lock.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::api::{
    DispatcherStats, EntryState, GroupCount, GroupKey, ItemId, Priority, QueueTimeBucket,
    Snapshot, SnapshotEntry, WorkItem, WorkSummary,
};
use crate::config::{DispatcherConfig, SettingsUpdate, VersionedConfig};
use crate::error::{ConfigResult, ScheduleError};
use crate::executor::{Executor, ExecutorRegistry};
use crate::queue::{Prioritized, TieredQueue};
use crate::state::{QUEUE_TIME_BUCKETS_NS, StatsCounters};
use crate::throttle::{GroupThrottler, ThrottleTicket};

const TOP_GROUPS: usize = 10;

/// Releases an item's slot (and throttle count) when fired or dropped.
#[must_use = "dropping a Completion releases the item's slot immediately"]
pub struct Completion {
    target: Option<(Weak<Shared>, ItemId)>,
}

impl Completion {
    fn new(shared: &Arc<Shared>, id: ItemId) -> Self {
        Self {
            target: Some((Arc::downgrade(shared), id)),
        }
    }

    /// A completion bound to no dispatcher. Useful for running work directly.
    pub fn detached() -> Self {
        Self { target: None }
    }

    pub fn item_id(&self) -> Option<ItemId> {
        self.target.as_ref().map(|(_, id)| *id)
    }

    pub fn complete(mut self) {
        self.fire();
    }

    fn fire(&mut self) {
        if let Some((shared, id)) = self.target.take() {
            if let Some(shared) = shared.upgrade() {
                shared.complete(id);
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("item", &self.item_id())
            .finish()
    }
}

struct Queued {
    id: ItemId,
    item: Box<dyn WorkItem>,
    summary: WorkSummary,
    ticket: Option<ThrottleTicket>,
    enqueued_at: Instant,
}

impl Prioritized for Queued {
    fn priority(&self) -> Priority {
        self.summary.priority
    }

    fn group(&self) -> &GroupKey {
        &self.summary.group
    }

    fn in_flight(&self) -> bool {
        self.summary.in_flight
    }

    fn received_at(&self) -> Instant {
        self.summary.received_at
    }
}

struct ActiveEntry {
    summary: WorkSummary,
    ticket: Option<ThrottleTicket>,
}

struct Launch {
    shared: Arc<Shared>,
    item: Box<dyn WorkItem>,
    completion: Completion,
}

struct DispatchState {
    queue: TieredQueue<Queued>,
    active: BTreeMap<ItemId, ActiveEntry>,
    active_by_group: HashMap<GroupKey, usize>,
    config: VersionedConfig,
}

impl DispatchState {
    fn activate(&mut self, id: ItemId, summary: WorkSummary, ticket: Option<ThrottleTicket>) {
        *self
            .active_by_group
            .entry(summary.group.clone())
            .or_insert(0) += 1;
        self.active.insert(id, ActiveEntry { summary, ticket });
    }

    fn deactivate(&mut self, id: ItemId) -> Option<ActiveEntry> {
        let entry = self.active.remove(&id)?;
        if let Some(count) = self.active_by_group.get_mut(&entry.summary.group) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active_by_group.remove(&entry.summary.group);
            }
        }
        Some(entry)
    }
}

struct Shared {
    state: Mutex<DispatchState>,
    throttler: GroupThrottler,
    executors: ExecutorRegistry,
    stats: StatsCounters,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    /// Moves queued items into free slots. Caller holds the state lock and must
    /// pass the returned launches to [`launch_all`] after releasing it.
    fn fill_slots(self: &Arc<Self>, state: &mut DispatchState) -> Vec<Launch> {
        let now = Instant::now();
        let moved = state.queue.reprioritize_at(now);
        StatsCounters::bump(&self.stats.reprioritized, moved as u64);

        let mut launches = Vec::new();
        while state.active.len() < state.config.config.target_active_slots {
            let Some((tier, queued)) = state
                .queue
                .poll_with_tier_at(now, &state.active_by_group)
            else {
                break;
            };
            let Queued {
                id,
                item,
                summary,
                ticket,
                enqueued_at,
            } = queued;

            let waited = now.saturating_duration_since(enqueued_at);
            self.stats
                .record_queue_time(u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX));
            trace!(
                item = %id,
                action = %summary.action_name,
                group = %summary.group,
                tier,
                waited_us = waited.as_micros() as u64,
                "dequeued"
            );

            state.activate(id, summary, ticket);
            launches.push(Launch {
                shared: Arc::clone(self),
                item,
                completion: Completion::new(self, id),
            });
        }
        launches
    }

    fn complete(self: &Arc<Self>, id: ItemId) {
        let launches = {
            let mut state = self.state.lock();
            let Some(entry) = state.deactivate(id) else {
                debug!(item = %id, "completion for unknown item ignored");
                return;
            };
            if let Some(ticket) = entry.ticket {
                self.throttler.release(ticket);
            }
            StatsCounters::bump(&self.stats.completed, 1);
            trace!(item = %id, action = %entry.summary.action_name, "completed");
            self.fill_slots(&mut state)
        };
        launch_all(launches);
    }

    fn launch(&self, launch: Launch) {
        let Launch {
            item, completion, ..
        } = launch;
        let Some(executor) = self.executors.get(item.executor_name()) else {
            error!(
                action = item.action_name(),
                executor = item.executor_name(),
                "executor was deregistered, dropping work"
            );
            return;
        };
        debug!(
            item = ?completion.item_id(),
            action = item.action_name(),
            executor = item.executor_name(),
            "launching"
        );
        let faults = completion
            .target
            .as_ref()
            .map(|(shared, _)| Weak::clone(shared))
            .unwrap_or_default();
        executor.execute(Box::new(move || run_item(item, completion, faults)));
    }
}

thread_local! {
    static DRAINING: Cell<bool> = const { Cell::new(false) };
    static DEFERRED: RefCell<VecDeque<Launch>> = const { RefCell::new(VecDeque::new()) };
}

/// Marks the current thread as draining deferred launches. Only the outermost
/// guard on a thread drains; launches requested while it is handing work to an
/// executor (an inline executor running the item on this thread) are queued
/// behind it. Work running on any other thread launches straight away.
struct DrainGuard {
    owner: bool,
}

impl DrainGuard {
    fn enter() -> Self {
        Self {
            owner: !DRAINING.with(|draining| draining.replace(true)),
        }
    }

    fn drain(&self) {
        if !self.owner {
            return;
        }
        while let Some(launch) = DEFERRED.with(|deferred| deferred.borrow_mut().pop_front()) {
            let shared = Arc::clone(&launch.shared);
            shared.launch(launch);
        }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        DRAINING.with(|draining| draining.set(false));
        // Only non-empty if an executor panicked mid-drain. Dropping the
        // launches releases their slots.
        let stranded = DEFERRED.with(|deferred| std::mem::take(&mut *deferred.borrow_mut()));
        drop(stranded);
    }
}

fn launch_all(launches: Vec<Launch>) {
    if launches.is_empty() {
        return;
    }
    let guard = DrainGuard::enter();
    DEFERRED.with(|deferred| deferred.borrow_mut().extend(launches));
    guard.drain();
}

fn run_item(item: Box<dyn WorkItem>, completion: Completion, faults: Weak<Shared>) {
    let action = item.action_name().to_string();
    let id = completion.item_id();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || item.run(completion))) {
        if let Some(shared) = faults.upgrade() {
            StatsCounters::bump(&shared.stats.faults, 1);
        }
        error!(
            item = ?id,
            action = %action,
            panic = panic_message(payload.as_ref()),
            "work item panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic>"
    }
}

/// Tiered, group-fair dispatcher with a bounded number of active slots.
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> ConfigResult<Self> {
        config.validate()?;
        info!(
            target_active_slots = config.target_active_slots,
            deadline_seconds = config.deadline_seconds,
            reprioritize_interval_ms = config.reprioritize_interval_ms,
            tie_break = ?config.tie_break,
            throttling_enabled = config.throttling.enabled,
            max_group_size = config.throttling.max_group_size,
            "dispatcher created"
        );
        let shared = Shared {
            state: Mutex::new(DispatchState {
                queue: TieredQueue::new(&config),
                active: BTreeMap::new(),
                active_by_group: HashMap::new(),
                config: VersionedConfig {
                    version: 1,
                    config: config.clone(),
                },
            }),
            throttler: GroupThrottler::new(config.throttling.clone()),
            executors: ExecutorRegistry::new(),
            stats: StatsCounters::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.shared.executors
    }

    pub fn register_executor(&self, name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.shared.executors.register(name, executor);
    }

    pub fn throttler(&self) -> &GroupThrottler {
        &self.shared.throttler
    }

    pub fn schedule<W: WorkItem>(&self, item: W) -> Result<ItemId, ScheduleError> {
        self.schedule_boxed(Box::new(item))
    }

    /// Admits `item`. On success the item is either running or pending; on error
    /// it was never admitted and has been dropped without running.
    pub fn schedule_boxed(&self, item: Box<dyn WorkItem>) -> Result<ItemId, ScheduleError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(ScheduleError::Closed);
        }
        if !shared.executors.contains(item.executor_name()) {
            warn!(
                action = item.action_name(),
                executor = item.executor_name(),
                "no such executor"
            );
            return Err(ScheduleError::UnknownExecutor(
                item.executor_name().to_string(),
            ));
        }

        let summary = WorkSummary::of(item.as_ref());
        let (id, launches) = {
            let mut state = shared.state.lock();
            let ticket = match shared.throttler.admit(&summary.group, summary.in_flight) {
                Ok(ticket) => ticket,
                Err(err) => {
                    StatsCounters::bump(&shared.stats.rejected, 1);
                    warn!(
                        action = %summary.action_name,
                        group = %summary.group,
                        error = %err,
                        "rejecting work"
                    );
                    return Err(err);
                }
            };
            let id = ItemId::new(shared.next_id.fetch_add(1, Ordering::Relaxed));
            StatsCounters::bump(&shared.stats.scheduled, 1);
            trace!(
                item = %id,
                action = %summary.action_name,
                group = %summary.group,
                priority = %summary.priority,
                in_flight = summary.in_flight,
                "scheduled"
            );

            if summary.in_flight {
                state.activate(id, summary, ticket);
                let launch = Launch {
                    shared: Arc::clone(shared),
                    item,
                    completion: Completion::new(shared, id),
                };
                (id, vec![launch])
            } else {
                state.queue.offer(Queued {
                    id,
                    item,
                    summary,
                    ticket,
                    enqueued_at: Instant::now(),
                });
                (id, shared.fill_slots(&mut state))
            }
        };
        launch_all(launches);
        Ok(id)
    }

    /// Releases `id`'s slot as if its [`Completion`] fired. Unknown or
    /// already-completed ids are ignored.
    pub fn complete(&self, id: ItemId) {
        self.shared.complete(id);
    }

    /// Merges `update` into the live config, validates it, and applies it as a
    /// whole. A larger slot target takes effect immediately.
    pub fn apply_settings(&self, update: &SettingsUpdate) -> ConfigResult<VersionedConfig> {
        let shared = &self.shared;
        let (applied, launches) = {
            let mut state = shared.state.lock();
            let next = state.config.config.merged(update)?;
            shared.throttler.apply(&next.throttling);
            state.queue.apply(&next);
            state.config = VersionedConfig {
                version: state.config.version + 1,
                config: next,
            };
            let applied = state.config.clone();
            info!(
                version = applied.version,
                target_active_slots = applied.config.target_active_slots,
                deadline_seconds = applied.config.deadline_seconds,
                reprioritize_interval_ms = applied.config.reprioritize_interval_ms,
                throttling_enabled = applied.config.throttling.enabled,
                max_group_size = applied.config.throttling.max_group_size,
                "settings applied"
            );
            (applied, shared.fill_slots(&mut state))
        };
        launch_all(launches);
        Ok(applied)
    }

    pub fn config(&self) -> VersionedConfig {
        self.shared.state.lock().config.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.shared.state.lock();
        let running = state.active.iter().map(|(id, entry)| SnapshotEntry {
            state: EntryState::Running,
            id: *id,
            tier: None,
            work: entry.summary.clone(),
        });
        let pending = state
            .queue
            .pending()
            .map(|(tier, _, queued)| SnapshotEntry {
                state: EntryState::Pending,
                id: queued.id,
                tier: Some(tier),
                work: queued.summary.clone(),
            });
        Snapshot {
            entries: running.chain(pending).collect(),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.shared.stats;
        let queue_time_histogram = QUEUE_TIME_BUCKETS_NS
            .iter()
            .enumerate()
            .map(|(idx, bound)| QueueTimeBucket {
                le_ns: *bound,
                count: StatsCounters::load(&counters.queue_time_buckets[idx]),
            })
            .collect::<Vec<_>>();

        let total_samples: u64 = queue_time_histogram.iter().map(|b| b.count).sum();
        let percentile = |pct: f64| -> u64 {
            if total_samples == 0 {
                return 0;
            }
            let target = (total_samples as f64 * pct).ceil() as u64;
            let mut cumulative = 0u64;
            for bucket in &queue_time_histogram {
                cumulative = cumulative.saturating_add(bucket.count);
                if cumulative >= target {
                    return bucket.le_ns;
                }
            }
            queue_time_histogram
                .last()
                .map(|bucket| bucket.le_ns)
                .unwrap_or(0)
        };

        let (active, pending, target_active_slots, mut top_groups) = {
            let state = self.shared.state.lock();
            let top_groups = state
                .active_by_group
                .iter()
                .map(|(group, count)| GroupCount {
                    group: group.clone(),
                    count: *count as u64,
                })
                .collect::<Vec<_>>();
            (
                state.active.len() as u64,
                state.queue.len() as u64,
                state.config.config.target_active_slots as u64,
                top_groups,
            )
        };
        top_groups.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.group.as_str().cmp(b.group.as_str()))
        });
        top_groups.truncate(TOP_GROUPS);

        DispatcherStats {
            scheduled: StatsCounters::load(&counters.scheduled),
            rejected: StatsCounters::load(&counters.rejected),
            completed: StatsCounters::load(&counters.completed),
            faults: StatsCounters::load(&counters.faults),
            reprioritized: StatsCounters::load(&counters.reprioritized),
            active,
            pending,
            target_active_slots,
            queue_time_sum_ns: StatsCounters::load(&counters.queue_time_sum_ns),
            queue_time_samples: StatsCounters::load(&counters.queue_time_samples),
            queue_time_p95_ns: percentile(0.95),
            queue_time_p99_ns: percentile(0.99),
            queue_time_histogram,
            top_groups,
        }
    }

    pub fn active_len(&self) -> usize {
        self.shared.state.lock().active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops admitting new work. Running and pending items still drain.
    pub fn shutdown(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            info!("dispatcher shut down");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Dispatcher")
            .field("version", &state.config.version)
            .field("active", &state.active.len())
            .field("pending", &state.queue.len())
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}
