//! Cgroup key generations and accounting parsers.
//!
//! The host may run the unified (v2) hierarchy or the legacy (v1) one, and
//! that is not known before the first container is configured. Callers try
//! the preferred generation first, fall back to the other one, and record
//! whichever succeeded in a [`GenerationCache`] so later containers start
//! with the right keys.

pub mod cpu;
pub mod device;
pub mod memory;

use std::sync::atomic::{AtomicU8, Ordering};

/// Cgroup hierarchy generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupGeneration {
    /// cgroup v2 unified hierarchy.
    Unified,
    /// cgroup v1 per-controller hierarchies.
    Legacy,
}

impl CgroupGeneration {
    /// Key holding the hard memory limit.
    ///
    /// The legacy generation is written through the runtime's dedicated
    /// memory limit call, which targets this key.
    #[must_use]
    pub const fn memory_limit_key(self) -> &'static str {
        match self {
            Self::Unified => "memory.max",
            Self::Legacy => "memory.limit_in_bytes",
        }
    }

    /// Key holding the relative CPU weight.
    #[must_use]
    pub const fn cpu_weight_key(self) -> &'static str {
        match self {
            Self::Unified => "cpu.weight",
            Self::Legacy => "cpu.shares",
        }
    }

    /// Key exposing cumulative CPU time.
    #[must_use]
    pub const fn cpu_stat_key(self) -> &'static str {
        match self {
            Self::Unified => "cpu.stat",
            Self::Legacy => "cpuacct.stat",
        }
    }

    /// Key exposing current memory usage.
    #[must_use]
    pub const fn memory_usage_key(self) -> &'static str {
        match self {
            Self::Unified => "memory.current",
            Self::Legacy => "memory.usage_in_bytes",
        }
    }

    /// Key exposing the OOM kill counter.
    #[must_use]
    pub const fn oom_events_key(self) -> &'static str {
        match self {
            Self::Unified => "memory.events",
            Self::Legacy => "memory.oom_control",
        }
    }

    /// Returns the other generation.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Unified => Self::Legacy,
            Self::Legacy => Self::Unified,
        }
    }

    const fn encode(self) -> u8 {
        match self {
            Self::Unified => 1,
            Self::Legacy => 2,
        }
    }

    const fn decode(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Unified),
            2 => Some(Self::Legacy),
            _ => None,
        }
    }
}

/// Remembers which cgroup generation the host accepted.
#[derive(Debug, Default)]
pub struct GenerationCache(AtomicU8);

impl GenerationCache {
    /// Creates an empty cache; the unified generation is tried first.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Returns the generation recorded so far, if any.
    #[must_use]
    pub fn detected(&self) -> Option<CgroupGeneration> {
        CgroupGeneration::decode(self.0.load(Ordering::Acquire))
    }

    /// Records the generation that accepted a directive.
    pub fn record(&self, generation: CgroupGeneration) {
        let previous = self.0.swap(generation.encode(), Ordering::AcqRel);
        if CgroupGeneration::decode(previous) != Some(generation) {
            tracing::info!(?generation, "cgroup generation detected");
        }
    }

    /// Returns the generations to try, preferred first.
    #[must_use]
    pub fn preference(&self) -> [CgroupGeneration; 2] {
        let first = self.detected().unwrap_or(CgroupGeneration::Unified);
        [first, first.other()]
    }
}

/// Parses `key value` lines, as found in `cpu.stat` or `memory.events`.
pub(crate) fn flat_keyed<'a>(lines: &'a [String]) -> impl Iterator<Item = (&'a str, u64)> + 'a {
    lines.iter().filter_map(|line| {
        let mut fields = line.split_whitespace();
        let key = fields.next()?;
        let value = fields.next()?.parse().ok()?;
        Some((key, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_prefers_unified() {
        let cache = GenerationCache::new();
        assert_eq!(cache.detected(), None);
        assert_eq!(
            cache.preference(),
            [CgroupGeneration::Unified, CgroupGeneration::Legacy]
        );
    }

    #[test]
    fn recorded_generation_is_tried_first() {
        let cache = GenerationCache::new();
        cache.record(CgroupGeneration::Legacy);
        assert_eq!(cache.detected(), Some(CgroupGeneration::Legacy));
        assert_eq!(
            cache.preference(),
            [CgroupGeneration::Legacy, CgroupGeneration::Unified]
        );
    }

    #[test]
    fn keys_differ_per_generation() {
        assert_eq!(CgroupGeneration::Unified.cpu_weight_key(), "cpu.weight");
        assert_eq!(CgroupGeneration::Legacy.cpu_weight_key(), "cpu.shares");
        assert_eq!(CgroupGeneration::Unified.memory_limit_key(), "memory.max");
    }

    #[test]
    fn flat_keyed_skips_malformed_lines() {
        let lines = vec!["usage_usec 10".to_string(), "bogus".into(), "x y".into()];
        let parsed: Vec<_> = flat_keyed(&lines).collect();
        assert_eq!(parsed, vec![("usage_usec", 10)]);
    }
}
