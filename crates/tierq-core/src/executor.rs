//! Named execution pools.
//!
//! The dispatcher never runs work itself; it hands each admitted item to the
//! pool named by the item's `executor_name`. A pool that drops a job instead of
//! running it releases the item's slot (the job owns the item's completion).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Pool name used by [`crate::FnWork`] when none is given.
pub const DEFAULT_EXECUTOR: &str = "generic";

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        (self)(job)
    }
}

/// Runs jobs on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Spawns a detached OS thread per job.
#[derive(Clone, Debug, Default)]
pub struct ThreadExecutor {
    name: Option<String>,
}

impl ThreadExecutor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        // On spawn failure the job is dropped, which releases its slot.
        if let Err(err) = builder.spawn(job) {
            tracing::error!(error = %err, "failed to spawn executor thread");
        }
    }
}

#[cfg(feature = "rayon")]
impl Executor for rayon::ThreadPool {
    fn execute(&self, job: Job) {
        self.spawn(job)
    }
}

#[derive(Default)]
pub struct ExecutorRegistry {
    pools: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the pool under `name`.
    pub fn register(&self, name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.pools.write().insert(name.into(), executor);
    }

    pub fn deregister(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.pools.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Executor>> {
        self.pools.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pools.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("pools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn closures_are_executors() {
        let seen = Arc::new(AtomicUsize::new(0));
        let registry = ExecutorRegistry::new();
        registry.register("inline", Arc::new(InlineExecutor));
        registry.register("dropping", Arc::new(|_job: Job| {}));

        let counter = Arc::clone(&seen);
        registry
            .get("inline")
            .unwrap()
            .execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        let counter = Arc::clone(&seen);
        registry
            .get("dropping")
            .unwrap()
            .execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(registry.names(), vec!["dropping", "inline"]);
        assert!(registry.deregister("dropping").is_some());
        assert!(!registry.contains("dropping"));
    }
}
