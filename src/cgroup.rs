//! Container-aware CPU detection for sizing the insert worker pool.
//!
//! Inside a container the logical CPU count overstates what the scheduler
//! will actually grant, so the cgroup CPU quota (v2, then v1) is consulted
//! before falling back to `num_cpus`.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// Default cap on concurrent insert workers.
pub fn default_workers_limit() -> usize {
    available_cpus()
}

/// Number of CPU cores usable by this process, honoring cgroup quotas.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(detect_available_cpus)
}

fn detect_available_cpus() -> usize {
    if let Some(n) = env_override("TIDEMARK_MAX_CPUS") {
        return n;
    }

    let logical = num_cpus::get();
    if let Some(quota) = cpu_quota_v2().or_else(cpu_quota_v1) {
        // A fractional quota below one CPU still deserves one worker.
        let granted = quota.ceil() as usize;
        if granted > 0 && granted < logical {
            return granted;
        }
    }

    logical
}

fn env_override(name: &str) -> Option<usize> {
    let parsed = std::env::var(name).ok()?.parse::<usize>().ok()?;
    (parsed > 0).then_some(parsed)
}

fn cpu_quota_v2() -> Option<f64> {
    // Format: "<quota|max> <period>".
    let content = fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?.parse::<f64>().ok()?;
    if quota == "max" || period <= 0.0 {
        return None;
    }
    Some(quota.parse::<f64>().ok()? / period)
}

fn cpu_quota_v1() -> Option<f64> {
    let quota = read_i64("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    let period = read_i64("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(quota as f64 / period as f64)
}

fn read_i64(path: impl AsRef<Path>) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_cpus_is_sane() {
        let cpus = available_cpus();
        assert!(cpus >= 1);
        assert!(cpus <= 4096);
    }

    #[test]
    fn workers_limit_matches_cpu_detection() {
        assert_eq!(default_workers_limit(), available_cpus());
    }
}
