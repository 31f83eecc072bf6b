use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use rand::Rng;
use tierq_async::{
    AsyncDispatcher, DispatcherConfig, Priority, ScheduleError, ThrottleSettings, WorkError,
    WorkSpec,
};

#[derive(Clone, Debug)]
struct GroupConfig {
    name: &'static str,
    priority: Priority,
    interval_ms: u64,
}

fn counter_vec(size: usize) -> Vec<AtomicU64> {
    (0..size).map(|_| AtomicU64::new(0)).collect()
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = DispatcherConfig {
        target_active_slots: 2,
        deadline_seconds: 1,
        throttling: ThrottleSettings {
            max_group_size: 50,
            ..ThrottleSettings::default()
        },
        ..DispatcherConfig::default()
    };
    let dispatcher = match AsyncDispatcher::new(config, tokio::runtime::Handle::current()) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            eprintln!("invalid dispatcher config: {err}");
            return;
        }
    };

    let groups = [
        GroupConfig {
            name: "hot",
            priority: Priority::Low,
            interval_ms: 2,
        },
        GroupConfig {
            name: "cold",
            priority: Priority::Low,
            interval_ms: 80,
        },
        GroupConfig {
            name: "urgent",
            priority: Priority::VeryHigh,
            interval_ms: 200,
        },
    ];

    let produced = Arc::new(counter_vec(groups.len()));
    let served = Arc::new(counter_vec(groups.len()));
    let rejected = Arc::new(AtomicU64::new(0));
    let running = Arc::new(AtomicBool::new(true));

    let mut handles = Vec::new();
    for (idx, group) in groups.iter().enumerate() {
        let group = group.clone();
        let dispatcher = dispatcher.clone();
        let produced = Arc::clone(&produced);
        let served = Arc::clone(&served);
        let rejected = Arc::clone(&rejected);
        let running = Arc::clone(&running);
        handles.push(tokio::spawn(async move {
            let mut waiting = Vec::new();
            while running.load(Ordering::Relaxed) {
                let work_ms = rand::rng().random_range(5..20u64);
                let served = Arc::clone(&served);
                let spec = WorkSpec::new("render", group.priority).group(group.name);
                produced[idx].fetch_add(1, Ordering::Relaxed);
                let submitted = dispatcher.submit(spec, async move {
                    tokio::time::sleep(Duration::from_millis(work_ms)).await;
                    served[idx].fetch_add(1, Ordering::Relaxed);
                });
                match submitted {
                    Ok(handle) => waiting.push(handle),
                    Err(ScheduleError::AdmissionRejected { .. }) => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => break,
                }
                tokio::time::sleep(Duration::from_millis(group.interval_ms)).await;
            }
            for handle in waiting {
                if let Err(WorkError::Dropped) = handle.await {
                    eprintln!("group={} lost a work item", group.name);
                }
            }
        }));
    }

    let run_seconds = 6u64;
    println!("running async example for {}s...", run_seconds);
    tokio::time::sleep(Duration::from_secs(run_seconds)).await;

    let snapshot = dispatcher.snapshot();
    println!(
        "snapshot at stop: running={} pending={}",
        snapshot.running().count(),
        snapshot.pending().count()
    );

    running.store(false, Ordering::Relaxed);
    dispatcher.shutdown();

    for handle in handles {
        let _ = handle.await;
    }

    let stats = dispatcher.stats();
    println!(
        "final stats: scheduled={} completed={} rejected={} reprioritized={} pending={}",
        stats.scheduled, stats.completed, stats.rejected, stats.reprioritized, stats.pending
    );

    for (idx, group) in groups.iter().enumerate() {
        let p = produced[idx].load(Ordering::Relaxed);
        let s = served[idx].load(Ordering::Relaxed);
        println!("group={} produced={} served={}", group.name, p, s);
    }
    println!("rejected_total={}", rejected.load(Ordering::Relaxed));
}
