//! Prometheus text exposition for [`DispatcherStats`].

use std::fmt::Write;

use crate::api::DispatcherStats;

pub const DEFAULT_NAMESPACE: &str = "tierq";

pub fn render_stats(stats: &DispatcherStats, namespace: &str) -> String {
    let ns = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };

    let mut out = String::new();
    let counters = [
        ("scheduled_total", "Work items admitted", stats.scheduled),
        ("rejected_total", "Work items rejected by the group throttler", stats.rejected),
        ("completed_total", "Work items completed", stats.completed),
        ("faults_total", "Work items whose run panicked", stats.faults),
        ("reprioritized_total", "Pending items moved to a more urgent tier", stats.reprioritized),
        ("queue_time_sum_ns", "Sum of queue time in ns", stats.queue_time_sum_ns),
        ("queue_time_samples", "Total queue time samples", stats.queue_time_samples),
    ];
    for (name, help, value) in counters {
        metric(&mut out, ns, name, "counter", help, value);
    }

    let gauges = [
        ("active", "Work items currently running", stats.active),
        ("pending", "Work items waiting for a slot", stats.pending),
        ("target_active_slots", "Configured number of active slots", stats.target_active_slots),
        ("queue_time_p95_ns", "Approx p95 queue time in ns", stats.queue_time_p95_ns),
        ("queue_time_p99_ns", "Approx p99 queue time in ns", stats.queue_time_p99_ns),
    ];
    for (name, help, value) in gauges {
        metric(&mut out, ns, name, "gauge", help, value);
    }

    if !stats.queue_time_histogram.is_empty() {
        let _ = writeln!(out, "# HELP {ns}_queue_time_ns Queue time histogram");
        let _ = writeln!(out, "# TYPE {ns}_queue_time_ns histogram");
        let mut cumulative = 0u64;
        for bucket in &stats.queue_time_histogram {
            cumulative = cumulative.saturating_add(bucket.count);
            let le = if bucket.le_ns == u64::MAX {
                "+Inf".to_string()
            } else {
                bucket.le_ns.to_string()
            };
            let _ = writeln!(out, "{ns}_queue_time_ns_bucket{{le=\"{le}\"}} {cumulative}");
        }
        let _ = writeln!(out, "{ns}_queue_time_ns_count {}", stats.queue_time_samples);
        let _ = writeln!(out, "{ns}_queue_time_ns_sum {}", stats.queue_time_sum_ns);
    }

    if !stats.top_groups.is_empty() {
        let _ = writeln!(out, "# HELP {ns}_group_active Running items per group (busiest groups)");
        let _ = writeln!(out, "# TYPE {ns}_group_active gauge");
        for entry in &stats.top_groups {
            let _ = writeln!(
                out,
                "{ns}_group_active{{group=\"{}\"}} {}",
                escape_label(entry.group.as_str()),
                entry.count
            );
        }
    }

    out
}

fn metric(out: &mut String, ns: &str, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {ns}_{name} {help}");
    let _ = writeln!(out, "# TYPE {ns}_{name} {kind}");
    let _ = writeln!(out, "{ns}_{name} {value}");
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}
