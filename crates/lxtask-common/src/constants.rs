//! System-wide constants and default paths.

/// Plugin name reported to callers and used as the log target prefix.
pub const PLUGIN_NAME: &str = "lxc";

/// Version of the persisted task state written by this driver.
pub const TASK_HANDLE_VERSION: u32 = 1;

/// Default interval between liveness probes of a container's init process.
pub const CONTAINER_MONITOR_INTERVAL_MS: u64 = 2_000;

/// Default interval between fingerprint reports.
pub const FINGERPRINT_PERIOD_MS: u64 = 30_000;

/// Grace period used when a running task is force-destroyed.
pub const DESTROY_GRACE_SECS: u64 = 60;

/// Default LXC container storage path.
pub const DEFAULT_LXC_PATH: &str = "/var/lib/lxc";

/// Default base LXC configuration file.
pub const DEFAULT_LXC_CONFIG: &str = "/etc/lxc/default.conf";

/// Bridge device veth pairs are attached to in bridge mode.
pub const LXC_BRIDGE: &str = "lxcbr0";

/// Megabyte multiplier used for memory limits.
pub const MIB: u64 = 1024 * 1024;
