//! CPU accounting.
//!
//! Cumulative CPU time is read from `cpu.stat` (unified, microseconds) or
//! `cpuacct.stat` (legacy, `USER_HZ` ticks) and turned into percentages by
//! a [`CpuTracker`] that divides the consumed time by elapsed wall time.

use std::time::Instant;

use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::types::CpuUsage;

use super::{CgroupGeneration, flat_keyed};

/// Length of one `USER_HZ` tick in nanoseconds.
const NANOS_PER_TICK: u64 = 10_000_000;

/// Cumulative CPU time consumed by a cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    /// Time spent in user mode.
    pub user_ns: u64,
    /// Time spent in kernel mode.
    pub system_ns: u64,
    /// Total time.
    pub total_ns: u64,
}

/// Parses the CPU statistics file of `generation`.
///
/// # Errors
///
/// Returns a runtime error if no user or system time is present.
pub fn parse_cpu_time(generation: CgroupGeneration, lines: &[String]) -> Result<CpuTime> {
    let mut user = None;
    let mut system = None;
    let mut total = None;
    for (key, value) in flat_keyed(lines) {
        match (generation, key) {
            (CgroupGeneration::Unified, "usage_usec") => total = Some(value * 1_000),
            (CgroupGeneration::Unified, "user_usec") => user = Some(value * 1_000),
            (CgroupGeneration::Unified, "system_usec") => system = Some(value * 1_000),
            (CgroupGeneration::Legacy, "user") => user = Some(value * NANOS_PER_TICK),
            (CgroupGeneration::Legacy, "system") => system = Some(value * NANOS_PER_TICK),
            _ => {}
        }
    }

    match (user, system) {
        (Some(user_ns), Some(system_ns)) => Ok(CpuTime {
            user_ns,
            system_ns,
            total_ns: total.unwrap_or(user_ns + system_ns),
        }),
        _ => Err(LxtaskError::Runtime {
            operation: "read cpu stats",
            message: format!("missing user/system time in {}", generation.cpu_stat_key()),
        }),
    }
}

/// Turns successive cumulative readings into utilisation percentages.
#[derive(Debug, Default)]
pub struct CpuTracker {
    previous: Option<(Instant, CpuTime)>,
}

impl CpuTracker {
    /// Creates a tracker without history.
    #[must_use]
    pub const fn new() -> Self {
        Self { previous: None }
    }

    /// Records `reading` taken at `now` and returns usage since the last one.
    ///
    /// The first reading has no window and reports zero percent.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, now: Instant, reading: CpuTime) -> CpuUsage {
        let usage = match self.previous {
            Some((then, prev)) => {
                let elapsed = now.saturating_duration_since(then).as_nanos() as f64;
                let percent = |cur: u64, old: u64| {
                    if elapsed <= 0.0 {
                        0.0
                    } else {
                        cur.saturating_sub(old) as f64 / elapsed * 100.0
                    }
                };
                CpuUsage {
                    user_percent: percent(reading.user_ns, prev.user_ns),
                    system_percent: percent(reading.system_ns, prev.system_ns),
                    total_percent: percent(reading.total_ns, prev.total_ns),
                    total_nanos: reading.total_ns,
                }
            }
            None => CpuUsage {
                total_nanos: reading.total_ns,
                ..CpuUsage::default()
            },
        };
        self.previous = Some((now, reading));
        usage
    }
}
