//! Abstract task specification consumed by the driver.
//!
//! A [`TaskSpec`] is produced by the scheduler-facing layer and is
//! read-only to the supervision engine. The LXC-specific block
//! ([`LxcTaskConfig`]) carries closed enumerations, so invalid verbosity,
//! log level, or network mode values are rejected while decoding, before
//! any container exists.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LxtaskError, Result};
use crate::types::TaskId;

/// Full description of a task to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Identifier, unique among concurrently running tasks.
    pub id: TaskId,
    /// Task name within its allocation.
    pub name: String,
    /// Allocation the task belongs to.
    pub alloc_id: String,
    /// Command vector executed as the container's init process.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables exported into the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Requested resources.
    #[serde(default)]
    pub resources: Resources,
    /// Host paths to expose inside the container.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    /// Host devices to expose inside the container.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Directories prepared for the task on the host.
    pub task_dir: TaskDir,
    /// Driver-specific configuration block.
    #[serde(default)]
    pub driver: LxcTaskConfig,
}

impl TaskSpec {
    /// Checks the identity fields every task must carry.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the id, name, or allocation id is empty.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(LxtaskError::validation("task id must not be empty"));
        }
        if self.name.is_empty() {
            return Err(LxtaskError::validation("task name must not be empty"));
        }
        if self.alloc_id.is_empty() {
            return Err(LxtaskError::validation("allocation id must not be empty"));
        }
        Ok(())
    }
}

/// Requested resources of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Memory limit in megabytes.
    #[serde(default)]
    pub memory_mb: u64,
    /// Relative CPU weight.
    #[serde(default)]
    pub cpu_shares: u64,
}

/// A host path bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Path on the host.
    pub host_path: PathBuf,
    /// Path inside the container.
    pub task_path: PathBuf,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub readonly: bool,
}

/// A host device exposed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device node on the host.
    pub host_path: PathBuf,
    /// Path inside the container.
    pub task_path: PathBuf,
    /// Cgroup permission characters (`r`, `w`, `m`).
    #[serde(default)]
    pub permissions: String,
}

/// Host directories prepared for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDir {
    /// The task's private directory.
    pub dir: PathBuf,
    /// Task-local scratch directory.
    pub local_dir: PathBuf,
    /// Directory shared by all tasks of the allocation.
    pub shared_alloc_dir: PathBuf,
    /// Task secrets directory.
    pub secrets_dir: PathBuf,
}

impl TaskDir {
    /// Builds the conventional layout for `task` under `alloc_dir`.
    ///
    /// ```
    /// use lxtask_common::spec::TaskDir;
    ///
    /// let dir = TaskDir::for_task("/var/alloc/1234", "web");
    /// assert_eq!(dir.local_dir, std::path::Path::new("/var/alloc/1234/web/local"));
    /// assert_eq!(dir.shared_alloc_dir, std::path::Path::new("/var/alloc/1234/alloc"));
    /// ```
    #[must_use]
    pub fn for_task(alloc_dir: impl AsRef<Path>, task: &str) -> Self {
        let alloc_dir = alloc_dir.as_ref();
        let dir = alloc_dir.join(task);
        Self {
            local_dir: dir.join("local"),
            secrets_dir: dir.join("secrets"),
            shared_alloc_dir: alloc_dir.join("alloc"),
            dir,
        }
    }
}

/// LXC-specific task configuration.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LxcTaskConfig {
    /// LXC template used to build the root filesystem.
    pub template: String,
    /// Distribution for the `download` template.
    pub distro: String,
    /// Distribution release.
    pub release: String,
    /// Architecture.
    pub arch: String,
    /// Image variant for the `download` template.
    pub image_variant: String,
    /// Image server for the `download` template.
    pub image_server: String,
    /// GPG key id used to validate downloaded images.
    pub gpg_key_id: String,
    /// GPG key server.
    pub gpg_key_server: String,
    /// Skip GPG validation of downloaded images.
    pub disable_gpg: bool,
    /// Flush the local template cache before creation.
    pub flush_cache: bool,
    /// Only use the local template cache.
    pub force_cache: bool,
    /// Extra arguments passed verbatim to the template.
    pub template_args: Vec<String>,
    /// LXC log level.
    pub log_level: LogLevel,
    /// LXC verbosity.
    pub verbosity: Verbosity,
    /// Volumes in `source:target:mode:type` form.
    pub volumes: Vec<String>,
    /// Network mode override; the driver default applies when unset.
    pub network_mode: Option<NetworkMode>,
    /// Base configuration file override.
    pub default_config: Option<PathBuf>,
    /// Extra `KEY=value` environment entries.
    pub environment: Vec<String>,
    /// Cgroup directory override.
    pub cgroup: Option<String>,
}

impl LxcTaskConfig {
    /// Derives root filesystem materialization options.
    #[must_use]
    pub fn template_options(&self) -> TemplateOptions {
        TemplateOptions {
            template: self.template.clone(),
            distro: self.distro.clone(),
            release: self.release.clone(),
            arch: self.arch.clone(),
            variant: self.image_variant.clone(),
            server: self.image_server.clone(),
            key_id: self.gpg_key_id.clone(),
            key_server: self.gpg_key_server.clone(),
            flush_cache: self.flush_cache,
            force_cache: self.force_cache,
            disable_gpg_validation: self.disable_gpg,
            extra_args: self.template_args.clone(),
        }
    }
}

/// Options handed to the native runtime when materializing a root filesystem.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOptions {
    /// Template name.
    pub template: String,
    /// Distribution.
    pub distro: String,
    /// Release.
    pub release: String,
    /// Architecture.
    pub arch: String,
    /// Image variant.
    pub variant: String,
    /// Image server.
    pub server: String,
    /// GPG key id.
    pub key_id: String,
    /// GPG key server.
    pub key_server: String,
    /// Flush the template cache.
    pub flush_cache: bool,
    /// Only use the template cache.
    pub force_cache: bool,
    /// Skip GPG validation.
    pub disable_gpg_validation: bool,
    /// Extra template arguments.
    pub extra_args: Vec<String>,
}

/// LXC verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Verbosity {
    /// Suppress runtime output.
    #[default]
    Quiet,
    /// Let the runtime print to its standard streams.
    Verbose,
}

impl FromStr for Verbosity {
    type Err = LxtaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "quiet" => Ok(Self::Quiet),
            "verbose" => Ok(Self::Verbose),
            other => Err(LxtaskError::validation(format!(
                "verbosity '{other}' must be either quiet or verbose"
            ))),
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quiet => write!(f, "quiet"),
            Self::Verbose => write!(f, "verbose"),
        }
    }
}

/// LXC log level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    #[default]
    Error,
}

impl LogLevel {
    /// Returns the priority name understood by the LXC tools.
    #[must_use]
    pub const fn as_lxc_priority(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LxtaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "" | "error" => Ok(Self::Error),
            other => Err(LxtaskError::validation(format!(
                "log level '{other}' must be one of trace, debug, info, warn or error"
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_lxc_priority().to_ascii_lowercase())
    }
}

/// Network attachment mode of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkMode {
    /// Share the host network namespace.
    Host,
    /// Attach a veth pair to the LXC bridge.
    #[default]
    Bridge,
}

impl FromStr for NetworkMode {
    type Err = LxtaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "bridge" => Ok(Self::Bridge),
            other => Err(LxtaskError::validation(format!(
                "network mode '{other}' is undefined, expected host or bridge"
            ))),
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Bridge => write!(f, "bridge"),
        }
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = LxtaskError;

            fn try_from(value: String) -> Result<Self> {
                value.parse()
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.to_string()
            }
        }
    )*};
}

string_conversions!(Verbosity, LogLevel, NetworkMode);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_strings_map_to_defaults() {
        assert_eq!("".parse::<Verbosity>().unwrap(), Verbosity::Quiet);
        assert_eq!("".parse::<LogLevel>().unwrap(), LogLevel::Error);
    }

    #[test]
    fn unknown_verbosity_is_a_validation_error() {
        let err = "loud".parse::<Verbosity>().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn unknown_log_level_is_rejected_while_decoding() {
        let yaml = "log_level: chatty\n";
        let result: std::result::Result<LxcTaskConfig, _> = serde_yaml::from_str(yaml);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("log level 'chatty'"), "{err}");
    }

    #[test]
    fn undefined_network_mode_is_rejected() {
        assert!("overlay".parse::<NetworkMode>().is_err());
        assert_eq!("host".parse::<NetworkMode>().unwrap(), NetworkMode::Host);
    }

    #[test]
    fn driver_block_decodes_with_defaults() {
        let yaml = r"
template: download
distro: alpine
release: '3.19'
volumes:
  - 'data:app/data:rw:dir'
network_mode: host
";
        let cfg: LxcTaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.verbosity, Verbosity::Quiet);
        assert_eq!(cfg.log_level, LogLevel::Error);
        assert_eq!(cfg.network_mode, Some(NetworkMode::Host));
        assert_eq!(cfg.volumes.len(), 1);

        let opts = cfg.template_options();
        assert_eq!(opts.template, "download");
        assert_eq!(opts.release, "3.19");
    }

    #[test]
    fn spec_with_empty_alloc_id_fails_validation() {
        let spec = TaskSpec {
            id: TaskId::new("t1"),
            name: "web".into(),
            alloc_id: String::new(),
            command: vec![],
            env: BTreeMap::new(),
            resources: Resources::default(),
            mounts: vec![],
            devices: vec![],
            task_dir: TaskDir::for_task("/alloc/1", "web"),
            driver: LxcTaskConfig::default(),
        };
        assert!(spec.validate().unwrap_err().is_validation());
    }
}
