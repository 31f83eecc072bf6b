//! Tokio adapter for `tierq-core`.
//!
//! This crate provides:
//! - `TokioExecutor` and `BlockingExecutor`, named pools backed by a runtime handle
//! - `AsyncWork`, a work item wrapping a future
//! - `AsyncDispatcher`, which submits futures or blocking closures and hands back
//!   an awaitable `WorkHandle`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

pub use tierq_core::{
    Completion, ConfigResult, DEFAULT_EXECUTOR, Dispatcher, DispatcherConfig, DispatcherStats,
    Executor, FnWork, GroupKey, ItemId, Job, Priority, ScheduleError, SettingsUpdate, Snapshot,
    ThrottleSettings, VersionedConfig, WorkItem, WorkSummary,
};

/// Pool that runs jobs as tokio tasks.
pub const TOKIO_EXECUTOR: &str = "tokio";
/// Pool that runs jobs on tokio's blocking thread pool.
pub const BLOCKING_EXECUTOR: &str = "blocking";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    /// The work panicked, was cancelled, or was discarded before producing output.
    #[error("work ended without producing a result")]
    Dropped,
}

#[derive(Clone, Debug)]
pub struct TokioExecutor {
    runtime: Handle,
}

impl TokioExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.runtime.spawn(async move { job() });
    }
}

#[derive(Clone, Debug)]
pub struct BlockingExecutor {
    runtime: Handle,
}

impl BlockingExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Executor for BlockingExecutor {
    fn execute(&self, job: Job) {
        self.runtime.spawn_blocking(job);
    }
}

/// Metadata for a submission. The executor defaults to [`TOKIO_EXECUTOR`] for
/// futures and [`BLOCKING_EXECUTOR`] for blocking closures.
#[derive(Clone, Debug)]
pub struct WorkSpec {
    action_name: String,
    priority: Priority,
    group: GroupKey,
    executor_name: Option<String>,
    in_flight: bool,
    received_at: Instant,
}

impl WorkSpec {
    pub fn new(action_name: impl Into<String>, priority: Priority) -> Self {
        Self {
            action_name: action_name.into(),
            priority,
            group: GroupKey::default(),
            executor_name: None,
            in_flight: false,
            received_at: Instant::now(),
        }
    }

    pub fn group(mut self, group: impl Into<GroupKey>) -> Self {
        self.group = group.into();
        self
    }

    pub fn executor(mut self, executor_name: impl Into<String>) -> Self {
        self.executor_name = Some(executor_name.into());
        self
    }

    pub fn in_flight(mut self, in_flight: bool) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn received_at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }

    fn into_summary(self, default_executor: &str) -> WorkSummary {
        WorkSummary {
            action_name: self.action_name,
            executor_name: self
                .executor_name
                .unwrap_or_else(|| default_executor.to_string()),
            priority: self.priority,
            group: self.group,
            in_flight: self.in_flight,
            received_at: self.received_at,
        }
    }
}

type Outcome<T> = Result<T, WorkError>;

/// A future admitted as a work item.
///
/// When launched, the future is spawned on the runtime. The item completes once
/// the future finishes (or panics), before its output reaches the caller.
pub struct AsyncWork<F: Future> {
    summary: WorkSummary,
    runtime: Handle,
    future: F,
    tx: oneshot::Sender<Outcome<F::Output>>,
}

impl<F> AsyncWork<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn new(
        summary: WorkSummary,
        runtime: Handle,
        future: F,
    ) -> (Self, oneshot::Receiver<Outcome<F::Output>>) {
        let (tx, rx) = oneshot::channel();
        let work = Self {
            summary,
            runtime,
            future,
            tx,
        };
        (work, rx)
    }
}

impl<F> WorkItem for AsyncWork<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
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
        let AsyncWork {
            summary,
            runtime,
            future,
            tx,
        } = *self;
        if tx.is_closed() {
            debug!(action = %summary.action_name, "work handle dropped before launch, skipping");
            return;
        }

        let task = runtime.spawn(future);
        runtime.spawn(async move {
            let outcome = match task.await {
                Ok(output) => Ok(output),
                Err(err) if err.is_panic() => {
                    error!(
                        action = %summary.action_name,
                        group = %summary.group,
                        "async work panicked"
                    );
                    Err(WorkError::Dropped)
                }
                Err(_) => {
                    warn!(action = %summary.action_name, "async work was cancelled");
                    Err(WorkError::Dropped)
                }
            };
            completion.complete();
            if tx.send(outcome).is_err() {
                debug!(action = %summary.action_name, "work handle dropped before completion");
            }
        });
    }
}

/// Resolves to the work's output once it has run and released its slot.
#[derive(Debug)]
pub struct WorkHandle<T> {
    id: ItemId,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> WorkHandle<T> {
    pub fn id(&self) -> ItemId {
        self.id
    }
}

impl<T> Future for WorkHandle<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WorkError::Dropped)),
        }
    }
}

/// Async facade over a shared [`Dispatcher`].
#[derive(Clone)]
pub struct AsyncDispatcher {
    inner: Arc<Dispatcher>,
    runtime: Handle,
}

impl AsyncDispatcher {
    pub fn new(config: DispatcherConfig, runtime: Handle) -> ConfigResult<Self> {
        let dispatcher = Dispatcher::new(config)?;
        Ok(Self::from_dispatcher(Arc::new(dispatcher), runtime))
    }

    /// Wraps an existing dispatcher, registering the tokio pools under
    /// [`TOKIO_EXECUTOR`], [`BLOCKING_EXECUTOR`] and [`DEFAULT_EXECUTOR`] unless
    /// those names are already taken.
    pub fn from_dispatcher(inner: Arc<Dispatcher>, runtime: Handle) -> Self {
        let registry = inner.executors();
        if !registry.contains(TOKIO_EXECUTOR) {
            registry.register(TOKIO_EXECUTOR, Arc::new(TokioExecutor::new(runtime.clone())));
        }
        for name in [BLOCKING_EXECUTOR, DEFAULT_EXECUTOR] {
            if !registry.contains(name) {
                registry.register(name, Arc::new(BlockingExecutor::new(runtime.clone())));
            }
        }
        Self { inner, runtime }
    }

    pub fn inner(&self) -> &Arc<Dispatcher> {
        &self.inner
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Admits `future`. It starts once the dispatcher grants it a slot.
    pub fn submit<F>(
        &self,
        spec: WorkSpec,
        future: F,
    ) -> Result<WorkHandle<F::Output>, ScheduleError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let summary = spec.into_summary(TOKIO_EXECUTOR);
        let (work, rx) = AsyncWork::new(summary, self.runtime.clone(), future);
        let id = self.inner.schedule(work)?;
        Ok(WorkHandle { id, rx })
    }

    /// Submits and waits for the output.
    pub async fn run<F>(&self, spec: WorkSpec, future: F) -> Result<F::Output, WorkError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.submit(spec, future)?.await
    }

    /// Admits a synchronous closure, run on the blocking pool by default.
    pub fn submit_blocking<F, T>(
        &self,
        spec: WorkSpec,
        f: F,
    ) -> Result<WorkHandle<T>, ScheduleError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let summary = spec.into_summary(BLOCKING_EXECUTOR);
        let action = summary.action_name.clone();
        let (tx, rx) = oneshot::channel::<Outcome<T>>();
        let work = FnWork::builder(summary.action_name, summary.priority)
            .group(summary.group)
            .executor(summary.executor_name)
            .in_flight(summary.in_flight)
            .received_at(summary.received_at)
            .run(move |completion| {
                if tx.is_closed() {
                    debug!(action = %action, "work handle dropped before launch, skipping");
                    return;
                }
                let output = f();
                completion.complete();
                if tx.send(Ok(output)).is_err() {
                    debug!(action = %action, "work handle dropped before completion");
                }
            });
        let id = self.inner.schedule(work)?;
        Ok(WorkHandle { id, rx })
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.stats()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    pub fn apply_settings(&self, update: &SettingsUpdate) -> ConfigResult<VersionedConfig> {
        self.inner.apply_settings(update)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::future::join_all;
    use tokio::sync::mpsc;

    use super::*;

    fn dispatcher(slots: usize) -> AsyncDispatcher {
        let config = DispatcherConfig {
            target_active_slots: slots,
            seed: Some(5),
            ..DispatcherConfig::default()
        };
        AsyncDispatcher::new(config, Handle::current()).unwrap()
    }

    async fn wait_for_completed(dispatcher: &AsyncDispatcher, expected: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while dispatcher.stats().completed < expected {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("work did not complete in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn submit_resolves_to_output() {
        let dispatcher = dispatcher(2);
        let output = dispatcher
            .run(WorkSpec::new("add", Priority::Normal), async { 2 + 3 })
            .await
            .unwrap();
        assert_eq!(output, 5);

        // the slot is released before the output is delivered
        let stats = dispatcher.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrency_stays_within_slot_target() {
        let dispatcher = dispatcher(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6u32 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let spec =
                WorkSpec::new(format!("job-{i}"), Priority::Normal).group(format!("g{}", i % 2));
            let handle = dispatcher
                .submit(spec, async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                })
                .unwrap();
            handles.push(handle);
        }

        let outputs = tokio::time::timeout(Duration::from_secs(2), join_all(handles))
            .await
            .expect("submissions timed out");
        let outputs: Vec<u32> = outputs.into_iter().map(Result::unwrap).collect();
        assert_eq!(outputs, vec![0, 1, 2, 3, 4, 5]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pending_work_runs_in_priority_order() {
        let dispatcher = dispatcher(1);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let (order_tx, mut order_rx) = mpsc::unbounded_channel();

        let blocker = dispatcher
            .submit(WorkSpec::new("blocker", Priority::VeryHigh), async move {
                let _ = gate_rx.await;
            })
            .unwrap();

        let mut handles = Vec::new();
        for (name, priority) in [("low", Priority::Low), ("high", Priority::High)] {
            let order_tx = order_tx.clone();
            let handle = dispatcher
                .submit(WorkSpec::new(name, priority), async move {
                    let _ = order_tx.send(name);
                })
                .unwrap();
            handles.push(handle);
        }
        assert_eq!(dispatcher.snapshot().pending().count(), 2);

        gate_tx.send(()).unwrap();
        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(order_rx.recv().await, Some("high"));
        assert_eq!(order_rx.recv().await, Some("low"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_group_is_rejected_until_work_finishes() {
        let config = DispatcherConfig {
            target_active_slots: 4,
            throttling: ThrottleSettings {
                max_group_size: 1,
                ..ThrottleSettings::default()
            },
            ..DispatcherConfig::default()
        };
        let dispatcher = AsyncDispatcher::new(config, Handle::current()).unwrap();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let first = dispatcher
            .submit(WorkSpec::new("first", Priority::Normal).group("tenant"), async move {
                let _ = gate_rx.await;
            })
            .unwrap();
        let err = dispatcher
            .submit(WorkSpec::new("second", Priority::Normal).group("tenant"), async {})
            .unwrap_err();
        assert!(matches!(err, ScheduleError::AdmissionRejected { limit: 1, .. }));

        let err = dispatcher
            .run(WorkSpec::new("second", Priority::Normal).group("tenant"), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, WorkError::Schedule(ScheduleError::AdmissionRejected { .. })));

        gate_tx.send(()).unwrap();
        first.await.unwrap();
        assert!(
            dispatcher
                .run(WorkSpec::new("third", Priority::Normal).group("tenant"), async {})
                .await
                .is_ok()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_future_releases_slot() {
        let dispatcher = dispatcher(1);
        let handle = dispatcher
            .submit(WorkSpec::new("boom", Priority::Normal), async {
                if true {
                    panic!("boom");
                }
                7u32
            })
            .unwrap();
        assert_eq!(handle.await, Err(WorkError::Dropped));
        assert_eq!(dispatcher.stats().active, 0);

        let output = dispatcher
            .run(WorkSpec::new("after", Priority::Normal), async { "ok" })
            .await
            .unwrap();
        assert_eq!(output, "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_work_runs_on_blocking_pool() {
        let dispatcher = dispatcher(2);
        let handle = dispatcher
            .submit_blocking(WorkSpec::new("sum", Priority::High), || {
                std::thread::sleep(Duration::from_millis(5));
                (1..=10).sum::<u32>()
            })
            .unwrap();
        assert!(handle.id().as_u64() > 0);
        assert_eq!(handle.await, Ok(55));
        assert_eq!(dispatcher.stats().active, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_handle_skips_work() {
        let dispatcher = dispatcher(1);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = dispatcher
            .submit(WorkSpec::new("blocker", Priority::Normal), async move {
                let _ = gate_rx.await;
            })
            .unwrap();
        let counter = Arc::clone(&ran);
        let abandoned = dispatcher
            .submit(WorkSpec::new("abandoned", Priority::Normal), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(abandoned);

        gate_tx.send(()).unwrap();
        blocker.await.unwrap();
        wait_for_completed(&dispatcher, 2).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_executor_is_reported() {
        let dispatcher = dispatcher(1);
        let err = dispatcher
            .submit(WorkSpec::new("lost", Priority::Normal).executor("gpu"), async {})
            .unwrap_err();
        assert_eq!(err, ScheduleError::UnknownExecutor("gpu".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_rejects_new_submissions() {
        let dispatcher = dispatcher(1);
        dispatcher.shutdown();
        let err = dispatcher
            .run(WorkSpec::new("late", Priority::Normal), async {})
            .await
            .unwrap_err();
        assert_eq!(err, WorkError::Schedule(ScheduleError::Closed));
    }
}
