//! Memory and CPU limits of a started container.
//!
//! Each limit is written with the keys of the preferred cgroup generation
//! and retried with the other generation's keys on rejection. Whichever
//! generation accepts is recorded so later containers try it first.

use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::spec::Resources;
use lxtask_core::cgroup::memory::megabytes_to_bytes;
use lxtask_core::cgroup::{CgroupGeneration, GenerationCache};

use crate::backend::NativeContainer;

/// Applies the memory and CPU requests of a task.
///
/// A zero request leaves the corresponding limit unset.
///
/// # Errors
///
/// Returns a runtime error if both generations reject a limit.
pub async fn apply_limits(
    container: &dyn NativeContainer,
    resources: &Resources,
    cache: &GenerationCache,
) -> Result<()> {
    if resources.memory_mb == 0 {
        tracing::debug!(container = %container.name(), "no memory request, leaving limit unset");
    } else {
        let bytes = megabytes_to_bytes(resources.memory_mb);
        set_memory_limit(container, bytes, cache).await?;
    }

    if resources.cpu_shares == 0 {
        tracing::debug!(container = %container.name(), "no cpu request, leaving weight unset");
    } else {
        set_cpu_weight(container, resources.cpu_shares, cache).await?;
    }
    Ok(())
}

async fn set_memory_limit(
    container: &dyn NativeContainer,
    bytes: u64,
    cache: &GenerationCache,
) -> Result<()> {
    let mut failures = Vec::new();
    for generation in cache.preference() {
        let attempt = match generation {
            CgroupGeneration::Unified => {
                container
                    .set_cgroup_item(generation.memory_limit_key(), &bytes.to_string())
                    .await
            }
            CgroupGeneration::Legacy => container.set_memory_limit(bytes).await,
        };
        match attempt {
            Ok(()) => {
                cache.record(generation);
                tracing::debug!(container = %container.name(), bytes, ?generation, "memory limit set");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(?generation, error = %e, "memory limit rejected");
                failures.push(format!("{}: {e}", generation.memory_limit_key()));
            }
        }
    }
    Err(LxtaskError::Runtime {
        operation: "set memory limit",
        message: failures.join("; "),
    })
}

async fn set_cpu_weight(
    container: &dyn NativeContainer,
    shares: u64,
    cache: &GenerationCache,
) -> Result<()> {
    let value = shares.to_string();
    let mut failures = Vec::new();
    for generation in cache.preference() {
        let key = generation.cpu_weight_key();
        match container.set_cgroup_item(key, &value).await {
            Ok(()) => {
                cache.record(generation);
                tracing::debug!(container = %container.name(), shares, key, "cpu weight set");
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "cpu weight rejected");
                failures.push(format!("{key}: {e}"));
            }
        }
    }
    Err(LxtaskError::Runtime {
        operation: "set cpu weight",
        message: failures.join("; "),
    })
}
