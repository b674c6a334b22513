//! Resource usage sampling for heartbeats.
//!
//! `{cpu_percent, memory_bytes, active_task_count}` per the host agent's
//! resource usage snapshot. CPU percent is derived from two
//! `/proc/self/stat` samples a fixed interval apart; memory from
//! `/proc/self/statm`. Plain `std::fs` parsing — no external crate,
//! since nothing in the corpus pulls one in just for this.

use std::time::{Duration, Instant};

use phoenix_core::model::ResourceUsage;

const CLK_TCK: u64 = 100;

struct CpuSample {
    total_jiffies: u64,
    at: Instant,
}

fn read_total_jiffies() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields after the (possibly space-containing) comm field in
    // parens; utime is field 14, stime field 15 (1-indexed).
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| s.split_whitespace().next().map(str::to_string))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

/// Samples cpu/memory over `interval`, falling back to zeroed values on
/// platforms without `/proc` (non-Linux dev machines, tests).
pub async fn sample(interval: Duration, active_task_count: u32) -> ResourceUsage {
    let Some(first) = read_total_jiffies() else {
        return ResourceUsage { cpu_percent: 0.0, memory_bytes: read_memory_bytes(), active_task_count };
    };
    let start = CpuSample { total_jiffies: first, at: Instant::now() };
    tokio::time::sleep(interval).await;
    let Some(second) = read_total_jiffies() else {
        return ResourceUsage { cpu_percent: 0.0, memory_bytes: read_memory_bytes(), active_task_count };
    };

    let elapsed_secs = start.at.elapsed().as_secs_f64().max(0.001);
    let delta_jiffies = second.saturating_sub(start.total_jiffies);
    let cpu_seconds = delta_jiffies as f64 / CLK_TCK as f64;
    let cpu_percent = ((cpu_seconds / elapsed_secs) * 100.0) as f32;

    ResourceUsage {
        cpu_percent,
        memory_bytes: read_memory_bytes(),
        active_task_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sample_never_panics_regardless_of_platform() {
        let usage = sample(Duration::from_millis(10), 2).await;
        assert_eq!(usage.active_task_count, 2);
        assert!(usage.cpu_percent >= 0.0);
    }
}
