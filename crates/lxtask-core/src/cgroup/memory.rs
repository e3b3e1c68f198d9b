//! Memory accounting.

use lxtask_common::constants::MIB;
use lxtask_common::error::{LxtaskError, Result};

use super::{CgroupGeneration, flat_keyed};

/// Converts a megabyte request into the byte count written to the cgroup.
///
/// ```
/// assert_eq!(lxtask_core::cgroup::memory::megabytes_to_bytes(256), 268_435_456);
/// ```
#[must_use]
pub const fn megabytes_to_bytes(megabytes: u64) -> u64 {
    megabytes.saturating_mul(MIB)
}

/// Parses the single-value memory usage file of either generation.
///
/// # Errors
///
/// Returns a runtime error if the value is missing or not a number.
pub fn parse_usage(lines: &[String]) -> Result<u64> {
    let raw = lines.first().map(|l| l.trim()).unwrap_or_default();
    raw.parse().map_err(|_| LxtaskError::Runtime {
        operation: "read memory usage",
        message: format!("unexpected value {raw:?}"),
    })
}

/// Returns the number of OOM kills recorded in the container's cgroup.
///
/// Both `memory.events` and recent `memory.oom_control` files carry an
/// `oom_kill` line; older legacy kernels only report `under_oom`, which is
/// taken as one kill when set.
#[must_use]
pub fn parse_oom_kills(generation: CgroupGeneration, lines: &[String]) -> u64 {
    let mut under_oom = 0;
    for (key, value) in flat_keyed(lines) {
        match key {
            "oom_kill" => return value,
            "under_oom" if generation == CgroupGeneration::Legacy => under_oom = value.min(1),
            _ => {}
        }
    }
    under_oom
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &str) -> Vec<String> {
        raw.lines().map(str::to_owned).collect()
    }

    #[test]
    fn megabytes_convert_to_bytes() {
        assert_eq!(megabytes_to_bytes(256), 268_435_456);
        assert_eq!(megabytes_to_bytes(0), 0);
        assert_eq!(megabytes_to_bytes(u64::MAX), u64::MAX);
    }

    #[test]
    fn usage_is_parsed_from_first_line() {
        assert_eq!(parse_usage(&lines("4096\n")).unwrap(), 4096);
        assert!(parse_usage(&[]).is_err());
        assert!(parse_usage(&lines("max")).is_err());
    }

    #[test]
    fn unified_oom_kill_counter() {
        let events = lines("low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n");
        assert_eq!(parse_oom_kills(CgroupGeneration::Unified, &events), 1);
    }

    #[test]
    fn legacy_under_oom_counts_as_kill() {
        let control = lines("oom_kill_disable 0\nunder_oom 1\n");
        assert_eq!(parse_oom_kills(CgroupGeneration::Legacy, &control), 1);
        let quiet = lines("oom_kill_disable 0\nunder_oom 0\n");
        assert_eq!(parse_oom_kills(CgroupGeneration::Legacy, &quiet), 0);
    }
}
