//! Resource usage sampling.
//!
//! Reads the container's CPU and memory accounting through the runtime and
//! turns cumulative counters into per-window usage.

use std::time::Instant;

use chrono::Utc;
use lxtask_common::error::Result;
use lxtask_common::types::{MemoryUsage, TaskId, TaskResourceUsage};
use lxtask_core::cgroup::cpu::{CpuTime, CpuTracker, parse_cpu_time};
use lxtask_core::cgroup::memory::{parse_oom_kills, parse_usage};
use lxtask_core::cgroup::{CgroupGeneration, GenerationCache};

use crate::backend::NativeContainer;

/// Takes one usage sample of `container`.
///
/// # Errors
///
/// Returns an error if neither generation's accounting can be read.
pub async fn collect_usage(
    task_id: &TaskId,
    container: &dyn NativeContainer,
    cache: &GenerationCache,
    tracker: &mut CpuTracker,
) -> Result<TaskResourceUsage> {
    let cpu_time = read_cpu_time(container, cache).await?;
    let memory = read_memory_usage(container, cache).await?;
    Ok(TaskResourceUsage {
        task_id: task_id.clone(),
        cpu: tracker.sample(Instant::now(), cpu_time),
        memory: MemoryUsage {
            usage_bytes: memory,
        },
        timestamp: Utc::now(),
    })
}

async fn read_cpu_time(container: &dyn NativeContainer, cache: &GenerationCache) -> Result<CpuTime> {
    read_first(cache, |generation| async move {
        let lines = container.cgroup_item(generation.cpu_stat_key()).await?;
        parse_cpu_time(generation, &lines)
    })
    .await
}

async fn read_memory_usage(container: &dyn NativeContainer, cache: &GenerationCache) -> Result<u64> {
    read_first(cache, |generation| async move {
        let lines = container.cgroup_item(generation.memory_usage_key()).await?;
        parse_usage(&lines)
    })
    .await
}

/// Returns the number of OOM kills of `container`, or `None` if unreadable.
pub async fn oom_kills(container: &dyn NativeContainer, cache: &GenerationCache) -> Option<u64> {
    read_first(cache, |generation| async move {
        let lines = container.cgroup_item(generation.oom_events_key()).await?;
        Ok(parse_oom_kills(generation, &lines))
    })
    .await
    .ok()
}

/// Runs `read` for each generation in preference order, returning the first success.
async fn read_first<T, F, Fut>(cache: &GenerationCache, read: F) -> Result<T>
where
    F: Fn(CgroupGeneration) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let [first, second] = cache.preference();
    match read(first).await {
        Ok(value) => Ok(value),
        Err(e) => {
            tracing::trace!(generation = ?first, error = %e, "cgroup read failed, trying other generation");
            read(second).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::backend::ContainerRuntime;
    use crate::backend::recording::RecordingRuntime;

    #[tokio::test]
    async fn samples_unified_accounting() {
        let runtime = RecordingRuntime::new("4.0.12");
        runtime.set_cgroup_value(
            "cpu.stat",
            &["usage_usec 3000", "user_usec 2000", "system_usec 1000"],
        );
        runtime.set_cgroup_value("memory.current", &["4096"]);
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();

        let mut tracker = CpuTracker::new();
        let usage = collect_usage(&TaskId::new("t1"), c.as_ref(), &GenerationCache::new(), &mut tracker)
            .await
            .unwrap();
        assert_eq!(usage.memory.usage_bytes, 4096);
        assert_eq!(usage.cpu.total_nanos, 3_000_000);
    }

    #[tokio::test]
    async fn falls_back_to_legacy_accounting() {
        let runtime = RecordingRuntime::new("4.0.12");
        runtime.set_cgroup_value("cpuacct.stat", &["user 10", "system 5"]);
        runtime.set_cgroup_value("memory.usage_in_bytes", &["8192"]);
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();

        let mut tracker = CpuTracker::new();
        let usage = collect_usage(&TaskId::new("t1"), c.as_ref(), &GenerationCache::new(), &mut tracker)
            .await
            .unwrap();
        assert_eq!(usage.memory.usage_bytes, 8192);
        assert_eq!(usage.cpu.total_nanos, 150_000_000);
    }

    #[tokio::test]
    async fn unreadable_accounting_is_an_error() {
        let runtime = RecordingRuntime::new("4.0.12");
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();
        let mut tracker = CpuTracker::new();
        assert!(
            collect_usage(&TaskId::new("t1"), c.as_ref(), &GenerationCache::new(), &mut tracker)
                .await
                .is_err()
        );
        assert_eq!(oom_kills(c.as_ref(), &GenerationCache::new()).await, None);
    }

    #[tokio::test]
    async fn oom_kills_are_read_from_events() {
        let runtime = RecordingRuntime::new("4.0.12");
        runtime.set_cgroup_value("memory.events", &["low 0", "oom 1", "oom_kill 1"]);
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();
        assert_eq!(oom_kills(c.as_ref(), &GenerationCache::new()).await, Some(1));
    }
}
