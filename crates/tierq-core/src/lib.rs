//! tierq core: tiered priority dispatch with group fairness.
//!
//! Work items are admitted through a per-group throttler, wait in one of five
//! priority tiers, and are handed to named executors while fewer than
//! `target_active_slots` items run. Within a tier the group with the fewest
//! running items goes first. Waiting items climb one tier per deadline, so
//! low-priority work cannot starve.
//!
//! The core is runtime-agnostic: executors are plain `Fn(Job)` pools. A tokio
//! adapter lives in `tierq-async` and a tower layer in `tierq-tower`.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod prometheus;
pub mod queue;
pub mod throttle;

mod state;
mod tier;

pub use api::{
    DEFAULT_GROUP, DispatcherStats, EntryState, FnWork, FnWorkBuilder, GroupCount, GroupKey,
    ItemId, Priority, QueueTimeBucket, Snapshot, SnapshotEntry, TIER_COUNT, WorkItem, WorkSummary,
};
pub use config::{DispatcherConfig, SettingsUpdate, ThrottleSettings, TieBreak, VersionedConfig};
pub use dispatcher::{Completion, Dispatcher};
pub use error::{ConfigError, ConfigResult, ScheduleError};
pub use executor::{
    DEFAULT_EXECUTOR, Executor, ExecutorRegistry, InlineExecutor, Job, ThreadExecutor,
};
pub use queue::{Prioritized, TieredQueue};
pub use throttle::{GroupThrottler, ThrottleTicket};
