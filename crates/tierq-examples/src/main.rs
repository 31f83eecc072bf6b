use std::error::Error;
use std::path::PathBuf;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tierq_core::{
    DEFAULT_EXECUTOR, Dispatcher, DispatcherConfig, FnWork, GroupKey, Priority, ScheduleError,
    SettingsUpdate, prometheus,
};
use tracing::{info, warn};

// Thread-pool example: 24 groups in three classes sharing a rayon pool.

#[derive(Parser, Debug)]
#[command(name = "tierq-examples", about = "tierq dispatcher on a rayon pool")]
struct Cli {
    /// Dispatcher config (TOML). Built-in defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Settings update (TOML) applied halfway through the run.
    #[arg(long)]
    update: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 10)]
    run_seconds: u64,

    #[arg(long, default_value_t = 1)]
    log_every_s: u64,

    /// Print the final stats in Prometheus text format.
    #[arg(long)]
    metrics: bool,
}

#[derive(Clone, Copy, Debug)]
enum GroupClass {
    Interactive,
    Reports,
    Batch,
}

#[derive(Clone, Debug)]
struct GroupProfile {
    group: GroupKey,
    class: GroupClass,
    priority: Priority,
    work_ms: u64,
    submit_every_ms: u64,
}

struct ExampleState {
    dispatcher: Arc<Dispatcher>,
    running: AtomicBool,
    produced_total: AtomicU64,
    rejected_total: AtomicU64,
    profiles: Vec<GroupProfile>,
    served: Vec<AtomicU64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let update = match &cli.update {
        Some(path) => SettingsUpdate::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => SettingsUpdate {
            target_active_slots: Some(cli.workers * 2),
            ..SettingsUpdate::default()
        },
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.workers)
        .thread_name(|i| format!("tierq-worker-{i}"))
        .build()?;
    let dispatcher = Arc::new(Dispatcher::new(config)?);
    dispatcher.register_executor(DEFAULT_EXECUTOR, Arc::new(pool));

    let state = Arc::new(ExampleState::new(dispatcher, group_profiles()));
    print_header(&cli, &state);

    let producers = spawn_producers(&state);
    let logger = spawn_logger(Arc::clone(&state), cli.log_every_s);

    let half = Duration::from_secs(cli.run_seconds) / 2;
    thread::sleep(half);
    match state.dispatcher.apply_settings(&update) {
        Ok(applied) => info!(
            version = applied.version,
            target_active_slots = applied.config.target_active_slots,
            max_group_size = applied.config.throttling.max_group_size,
            "live settings update applied"
        ),
        Err(err) => warn!(error = %err, "live settings update refused"),
    }
    print_snapshot(&state.dispatcher, 8);
    thread::sleep(half);

    state.stop();
    for handle in producers {
        let _ = handle.join();
    }
    let _ = logger.join();

    // let whatever is still running finish
    let drain_deadline = Instant::now() + Duration::from_secs(5);
    while state.dispatcher.active_len() > 0 && Instant::now() < drain_deadline {
        thread::sleep(Duration::from_millis(10));
    }

    print_summary(&state);
    if cli.metrics {
        let stats = state.dispatcher.stats();
        print!("{}", prometheus::render_stats(&stats, prometheus::DEFAULT_NAMESPACE));
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<DispatcherConfig, Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => {
            let config = DispatcherConfig::from_file(path)?;
            info!(path = %path.display(), "loaded dispatcher config");
            config
        }
        None => DispatcherConfig {
            target_active_slots: cli.workers,
            deadline_seconds: 2,
            ..DispatcherConfig::default()
        },
    };
    Ok(config)
}

fn group_profiles() -> Vec<GroupProfile> {
    let mut profiles = Vec::with_capacity(24);
    for i in 0..8u64 {
        profiles.push(GroupProfile {
            group: GroupKey::new(format!("ui-{:02}", i + 1)),
            class: GroupClass::Interactive,
            priority: Priority::High,
            work_ms: 2,
            submit_every_ms: 40 + i * 5,
        });
    }
    for i in 0..8u64 {
        profiles.push(GroupProfile {
            group: GroupKey::new(format!("report-{:02}", i + 1)),
            class: GroupClass::Reports,
            priority: Priority::Normal,
            work_ms: 15,
            submit_every_ms: 20 + i * 2,
        });
    }
    for i in 0..8u64 {
        profiles.push(GroupProfile {
            group: GroupKey::new(format!("batch-{:02}", i + 1)),
            class: GroupClass::Batch,
            priority: Priority::VeryLow,
            work_ms: 40,
            submit_every_ms: 5,
        });
    }
    profiles
}

impl ExampleState {
    fn new(dispatcher: Arc<Dispatcher>, profiles: Vec<GroupProfile>) -> Self {
        let served = profiles.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            dispatcher,
            running: AtomicBool::new(true),
            produced_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            profiles,
            served,
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.dispatcher.shutdown();
    }

    fn served_by_class(&self) -> (u64, u64, u64) {
        let mut interactive = 0u64;
        let mut reports = 0u64;
        let mut batch = 0u64;
        for (profile, served) in self.profiles.iter().zip(&self.served) {
            let value = served.load(Ordering::Relaxed);
            match profile.class {
                GroupClass::Interactive => interactive += value,
                GroupClass::Reports => reports += value,
                GroupClass::Batch => batch += value,
            }
        }
        (interactive, reports, batch)
    }
}

fn spawn_producers(state: &Arc<ExampleState>) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(state.profiles.len());
    for index in 0..state.profiles.len() {
        let state = Arc::clone(state);
        handles.push(thread::spawn(move || {
            let profile = state.profiles[index].clone();
            while state.running.load(Ordering::Relaxed) {
                let served_state = Arc::clone(&state);
                let work = FnWork::builder("process", profile.priority)
                    .group(profile.group.clone())
                    .run(move |completion| {
                        thread::sleep(Duration::from_millis(profile.work_ms));
                        served_state.served[index].fetch_add(1, Ordering::Relaxed);
                        completion.complete();
                    });
                state.produced_total.fetch_add(1, Ordering::Relaxed);
                match state.dispatcher.schedule(work) {
                    Ok(_) => {}
                    Err(ScheduleError::AdmissionRejected { .. }) => {
                        state.rejected_total.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(ScheduleError::Closed) => break,
                    Err(err) => {
                        warn!(error = %err, "producer stopped");
                        break;
                    }
                }
                thread::sleep(Duration::from_millis(profile.submit_every_ms));
            }
        }));
    }
    handles
}

fn spawn_logger(state: Arc<ExampleState>, interval_s: u64) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut tick = 0u64;
        while state.running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(interval_s.max(1)));
            tick += interval_s.max(1);
            let stats = state.dispatcher.stats();
            let (interactive, reports, batch) = state.served_by_class();
            println!(
                "[t+{}s] active={}/{} pending={} completed={} rejected={} reprioritized={}",
                tick,
                stats.active,
                stats.target_active_slots,
                stats.pending,
                stats.completed,
                stats.rejected,
                stats.reprioritized
            );
            println!(
                "         served_interactive={} served_reports={} served_batch={}",
                interactive, reports, batch
            );
        }
    })
}

fn print_header(cli: &Cli, state: &ExampleState) {
    let config = state.dispatcher.config();
    println!(
        "rayon pool example ({} groups, {} workers, {}s)",
        state.profiles.len(),
        cli.workers,
        cli.run_seconds
    );
    println!(
        "dispatcher: slots={} deadline={}s tie_break={:?} max_group_size={} version={}",
        config.config.target_active_slots,
        config.config.deadline_seconds,
        config.config.tie_break,
        config.config.throttling.max_group_size,
        config.version
    );
    println!("groups:");
    for profile in &state.profiles {
        println!(
            "  group={} class={:?} priority={} work={}ms every={}ms",
            profile.group,
            profile.class,
            profile.priority,
            profile.work_ms,
            profile.submit_every_ms
        );
    }
}

fn print_snapshot(dispatcher: &Dispatcher, limit: usize) {
    let snapshot = dispatcher.snapshot();
    println!(
        "snapshot: running={} pending={}",
        snapshot.running().count(),
        snapshot.pending().count()
    );
    for entry in snapshot.entries.iter().take(limit) {
        println!(
            "  {} id={} tier={} group={} action={}",
            entry.state.as_str(),
            entry.id,
            entry.tier.unwrap_or("-"),
            entry.work.group,
            entry.work.action_name
        );
    }
}

fn print_summary(state: &ExampleState) {
    let stats = state.dispatcher.stats();
    let avg_queue_time_ms = if stats.queue_time_samples > 0 {
        stats.queue_time_sum_ns as f64 / stats.queue_time_samples as f64 / 1_000_000.0
    } else {
        0.0
    };

    println!("final stats:");
    println!(
        "scheduled={} completed={} rejected={} faults={} pending={}",
        stats.scheduled, stats.completed, stats.rejected, stats.faults, stats.pending
    );
    println!(
        "produced={} rejected_by_producers={}",
        state.produced_total.load(Ordering::Relaxed),
        state.rejected_total.load(Ordering::Relaxed)
    );
    println!(
        "queue time: avg={:.3}ms p95={:.3}ms p99={:.3}ms",
        avg_queue_time_ms,
        stats.queue_time_p95_ns as f64 / 1_000_000.0,
        stats.queue_time_p99_ns as f64 / 1_000_000.0
    );

    let (interactive, reports, batch) = state.served_by_class();
    println!(
        "served totals: interactive={} reports={} batch={}",
        interactive, reports, batch
    );

    let mut served = state
        .profiles
        .iter()
        .zip(&state.served)
        .map(|(profile, count)| (profile, count.load(Ordering::Relaxed)))
        .collect::<Vec<_>>();
    served.sort_by(|a, b| b.1.cmp(&a.1));

    println!("top groups by served:");
    for (profile, count) in served.iter().take(8) {
        println!("  group={} class={:?} served={}", profile.group, profile.class, count);
    }
}
