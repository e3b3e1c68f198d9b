//! Domain primitive types used across the lxtask workspace.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a supervised task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new task ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lifecycle state of a supervised task.
///
/// `Unknown` is only observed while a recovered handle waits for its first
/// liveness check. `Exited` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// State not yet established.
    Unknown,
    /// The container's init process is alive.
    Running,
    /// The init process terminated normally.
    Exited,
    /// The init process terminated abnormally, e.g. killed by the OOM killer.
    Failed,
}

impl TaskState {
    /// Returns whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a terminated task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Exit code of the init process, when known.
    pub exit_code: i32,
    /// Whether the kernel OOM killer terminated the container.
    pub oom_killed: bool,
    /// Error description for abnormal termination.
    pub err: Option<String>,
}

impl ExitResult {
    /// Returns whether the task terminated without error.
    #[must_use]
    pub const fn successful(&self) -> bool {
        self.exit_code == 0 && !self.oom_killed && self.err.is_none()
    }
}

/// Point-in-time view of a task handle, as returned by inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task identifier.
    pub id: TaskId,
    /// Task name from the specification.
    pub name: String,
    /// Name of the backing container.
    pub container_name: String,
    /// PID of the container's init process in the host namespace.
    pub pid: i32,
    /// Current lifecycle state.
    pub state: TaskState,
    /// When the task was started.
    pub started_at: DateTime<Utc>,
    /// When termination was detected.
    pub completed_at: Option<DateTime<Utc>>,
    /// Exit result, populated once the task is terminal.
    pub exit_result: Option<ExitResult>,
}

/// CPU usage sample of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    /// User-mode CPU percentage over the sampling window.
    pub user_percent: f64,
    /// Kernel-mode CPU percentage over the sampling window.
    pub system_percent: f64,
    /// Total CPU percentage over the sampling window.
    pub total_percent: f64,
    /// Cumulative CPU time consumed, in nanoseconds.
    pub total_nanos: u64,
}

/// Memory usage sample of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Current memory usage in bytes, as accounted by the cgroup.
    pub usage_bytes: u64,
}

/// One resource-usage sample emitted by a stats stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    /// Task the sample belongs to.
    pub task_id: TaskId,
    /// CPU usage.
    pub cpu: CpuUsage,
    /// Memory usage.
    pub memory: MemoryUsage,
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
}

/// Health of the driver as reported by fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// The native runtime is installed and the driver is enabled.
    Healthy,
    /// The driver is disabled or the runtime could not be found.
    Undetected,
}

/// Periodic health and capability summary of the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Whether tasks can be started.
    pub available: bool,
    /// Version string of the native runtime, empty when absent.
    pub version: String,
    /// Whether host volumes may be mounted.
    pub volumes_enabled: bool,
    /// Health classification.
    pub health: HealthState,
    /// Short human readable description.
    pub description: String,
}

/// Filesystem isolation offered to tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsIsolation {
    /// No isolation.
    None,
    /// Chroot-based isolation.
    Chroot,
    /// Full image-based root filesystem.
    Image,
}

/// Optional features supported by the driver.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether arbitrary signals can be delivered to tasks.
    pub send_signals: bool,
    /// Whether commands can be executed inside running tasks.
    pub exec: bool,
    /// Filesystem isolation mode.
    pub fs_isolation: FsIsolation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Exited.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Unknown.is_terminal());
    }

    #[test]
    fn task_state_serializes_lowercase() {
        let json = serde_json::to_string(&TaskState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn oom_killed_exit_is_not_successful() {
        let result = ExitResult {
            exit_code: 0,
            oom_killed: true,
            err: None,
        };
        assert!(!result.successful());
        assert!(ExitResult::default().successful());
    }

    #[test]
    fn task_id_is_transparent_in_json() {
        let id = TaskId::new("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
