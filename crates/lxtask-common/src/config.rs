//! Driver configuration model.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::spec::NetworkMode;

/// Root configuration of the LXC task driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Whether the driver accepts tasks.
    pub enabled: bool,
    /// Whether absolute or escaping volume sources are permitted.
    pub volumes_enabled: bool,
    /// Base LXC configuration loaded into every container.
    pub default_config: PathBuf,
    /// Container storage path; the runtime default applies when unset.
    pub lxc_path: Option<PathBuf>,
    /// Network mode used when a task does not specify one.
    pub network_mode: NetworkMode,
    /// Garbage collection policy.
    pub gc: GcConfig,
    /// Directory receiving persisted task state, one file per task.
    pub state_dir: Option<PathBuf>,
    /// Interval between liveness probes, in milliseconds.
    pub monitor_interval_ms: u64,
    /// Interval between fingerprints, in milliseconds.
    pub fingerprint_period_ms: u64,
}

impl DriverConfig {
    /// Returns the liveness probe interval, at least one millisecond.
    #[must_use]
    pub const fn monitor_interval(&self) -> Duration {
        Duration::from_millis(at_least_one(self.monitor_interval_ms))
    }

    /// Returns the fingerprint period, at least one millisecond.
    #[must_use]
    pub const fn fingerprint_period(&self) -> Duration {
        Duration::from_millis(at_least_one(self.fingerprint_period_ms))
    }
}

const fn at_least_one(ms: u64) -> u64 {
    if ms == 0 { 1 } else { ms }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volumes_enabled: true,
            default_config: PathBuf::from(constants::DEFAULT_LXC_CONFIG),
            lxc_path: None,
            network_mode: NetworkMode::Bridge,
            gc: GcConfig::default(),
            state_dir: None,
            monitor_interval_ms: constants::CONTAINER_MONITOR_INTERVAL_MS,
            fingerprint_period_ms: constants::FINGERPRINT_PERIOD_MS,
        }
    }
}

/// Garbage collection policy for containers of destroyed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Destroy the container object when its task is destroyed.
    pub container: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { container: true }
    }
}
