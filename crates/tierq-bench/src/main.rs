use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tierq_core::{
    DEFAULT_EXECUTOR, Dispatcher, DispatcherConfig, FnWork, GroupKey, Priority, ScheduleError,
    ThrottleSettings, TieBreak,
};

/// Hot group against many cold groups sharing the same slots.
#[derive(Parser, Debug)]
#[command(name = "tierq-bench", about)]
struct Cli {
    #[arg(long, default_value_t = 5)]
    run_seconds: u64,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 40)]
    cold_groups: u64,

    /// Microseconds of simulated work per item.
    #[arg(long, default_value_t = 200)]
    work_us: u64,

    #[arg(long, default_value_t = 10_000)]
    max_group_size: usize,

    #[arg(long)]
    round_robin: bool,
}

#[derive(Default)]
struct Counters {
    produced: AtomicU64,
    rejected: AtomicU64,
    served_hot: AtomicU64,
    served_cold: AtomicU64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = DispatcherConfig {
        target_active_slots: cli.workers,
        tie_break: if cli.round_robin {
            TieBreak::RoundRobin
        } else {
            TieBreak::Random
        },
        throttling: ThrottleSettings {
            max_group_size: cli.max_group_size,
            ..ThrottleSettings::default()
        },
        ..DispatcherConfig::default()
    };

    let dispatcher = match Dispatcher::new(config) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(err) => {
            eprintln!("invalid config: {err}");
            return;
        }
    };
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(cli.workers)
        .build()
    {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("failed to build worker pool: {err}");
            return;
        }
    };
    dispatcher.register_executor(DEFAULT_EXECUTOR, Arc::new(pool));

    let running = Arc::new(AtomicBool::new(true));
    let counters = Arc::new(Counters::default());
    let mut handles = Vec::new();

    handles.push(spawn_producer(
        Arc::clone(&dispatcher),
        Arc::clone(&running),
        Arc::clone(&counters),
        GroupKey::new("hot"),
        true,
        Duration::ZERO,
        cli.work_us,
    ));
    for group_id in 0..cli.cold_groups {
        handles.push(spawn_producer(
            Arc::clone(&dispatcher),
            Arc::clone(&running),
            Arc::clone(&counters),
            GroupKey::new(format!("cold-{group_id:02}")),
            false,
            Duration::from_millis(25),
            cli.work_us,
        ));
    }

    println!(
        "bench: hot group vs {} groups ({} workers, {}s)",
        cli.cold_groups, cli.workers, cli.run_seconds
    );
    let start = Instant::now();
    thread::sleep(Duration::from_secs(cli.run_seconds));
    let elapsed = start.elapsed().as_secs_f64();

    running.store(false, Ordering::Relaxed);
    dispatcher.shutdown();
    for handle in handles {
        let _ = handle.join();
    }

    let stats = dispatcher.stats();
    let avg_queue_time_ms = if stats.queue_time_samples > 0 {
        let avg_ns = stats.queue_time_sum_ns as f64 / stats.queue_time_samples as f64;
        avg_ns / 1_000_000.0
    } else {
        0.0
    };
    let throughput = if elapsed > 0.0 {
        stats.completed as f64 / elapsed
    } else {
        0.0
    };

    println!(
        "stats: scheduled={} completed={} rejected={} reprioritized={} pending={}",
        stats.scheduled, stats.completed, stats.rejected, stats.reprioritized, stats.pending
    );
    println!(
        "derived: throughput={:.1} ops/s avg_queue_time_ms={:.3} p99_ms={:.3}",
        throughput,
        avg_queue_time_ms,
        stats.queue_time_p99_ns as f64 / 1_000_000.0
    );
    println!(
        "produced_total={} rejected_total={} served_hot={} served_cold={}",
        counters.produced.load(Ordering::Relaxed),
        counters.rejected.load(Ordering::Relaxed),
        counters.served_hot.load(Ordering::Relaxed),
        counters.served_cold.load(Ordering::Relaxed)
    );
}

fn spawn_producer(
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    group: GroupKey,
    hot: bool,
    interval: Duration,
    work_us: u64,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::Relaxed) {
            // keep the hot group's backlog bounded so the producer does not spin
            if hot && dispatcher.pending_len() > 5_000 {
                thread::yield_now();
                continue;
            }
            let served = Arc::clone(&counters);
            let work = FnWork::builder("bench", Priority::Normal)
                .group(group.clone())
                .run(move |completion| {
                    spin_for(Duration::from_micros(work_us));
                    let counter = if hot {
                        &served.served_hot
                    } else {
                        &served.served_cold
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    completion.complete();
                });
            counters.produced.fetch_add(1, Ordering::Relaxed);
            match dispatcher.schedule(work) {
                Ok(_) => {}
                Err(ScheduleError::AdmissionRejected { .. }) => {
                    counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            }
            if !interval.is_zero() {
                thread::sleep(interval);
            }
        }
    })
}

fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}
