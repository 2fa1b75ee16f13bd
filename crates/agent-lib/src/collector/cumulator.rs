//! Derives percentage and rate metrics from a raw stats sample

use crate::models::{CumulativeStats, RawStatsSample};

/// The only network interface whose counters are reported
pub const NETWORK_INTERFACE: &str = "eth0";

const BYTES_PER_MB: f64 = 1_000_000.0;

/// Compute cumulated stats from one raw sample.
///
/// The sample carries both the current and the previous CPU counters, so a
/// single sample is enough to compute a rate. Zero or inconsistent inputs
/// degrade to zero-valued outputs.
pub fn cumulate(sample: &RawStatsSample) -> CumulativeStats {
    let memory = &sample.memory_stats;
    let (rx_bytes, tx_bytes) = sample
        .networks
        .get(NETWORK_INTERFACE)
        .map(|n| (n.rx_bytes, n.tx_bytes))
        .unwrap_or_default();

    CumulativeStats {
        cpu_usage_percent: cpu_percent(sample),
        ram_usage_percent: ratio_percent(memory.usage, memory.limit),
        ram_usage_mb: memory.usage as f64 / BYTES_PER_MB,
        ram_limit_mb: memory.limit as f64 / BYTES_PER_MB,
        net_io_receive_mb: rx_bytes as f64 / BYTES_PER_MB,
        net_io_transmit_mb: tx_bytes as f64 / BYTES_PER_MB,
    }
}

/// CPU utilisation across all online cores, in percent
fn cpu_percent(sample: &RawStatsSample) -> f64 {
    let current = &sample.cpu_stats;
    let previous = &sample.precpu_stats;

    // Counters are unsigned; a reset shows up as current < previous.
    let cpu_delta = current.cpu_usage.total_usage as f64 - previous.cpu_usage.total_usage as f64;
    let system_delta = current.system_cpu_usage as f64 - previous.system_cpu_usage as f64;

    if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * online_cores(sample) as f64 * 100.0
    } else {
        0.0
    }
}

fn online_cores(sample: &RawStatsSample) -> u64 {
    let cpu = &sample.cpu_stats;
    if cpu.online_cpus > 0 {
        cpu.online_cpus
    } else {
        cpu.cpu_usage.percpu_usage.len() as u64
    }
}

fn ratio_percent(value: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    value as f64 / total as f64 * 100.0
}
