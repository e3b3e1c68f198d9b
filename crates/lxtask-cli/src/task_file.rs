//! YAML task files accepted by `lxtask run` and `lxtask plan`.
//!
//! A task file stands in for the scheduler: it names the task, points at
//! the allocation directory, and carries the LXC block under `config`.
//!
//! ```yaml
//! name: web
//! alloc_dir: /var/lib/lxtask/alloc/web
//! command: ["/bin/sleep", "600"]
//! resources:
//!   memory_mb: 256
//! config:
//!   template: download
//!   distro: alpine
//!   release: "3.20"
//!   arch: amd64
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use lxtask_common::spec::{DeviceConfig, LxcTaskConfig, MountConfig, Resources, TaskDir, TaskSpec};
use lxtask_common::types::TaskId;
use serde::Deserialize;

/// A task as written by the user.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    /// Task identifier; derived from the allocation and name when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Task name.
    pub name: String,
    /// Allocation identifier; a random one is generated when absent.
    #[serde(default)]
    pub alloc_id: Option<String>,
    /// Allocation directory holding the task directories.
    pub alloc_dir: PathBuf,
    /// Init command.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Resource requests.
    #[serde(default)]
    pub resources: Resources,
    /// Host mounts.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    /// Host devices.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// LXC block.
    #[serde(default)]
    pub config: LxcTaskConfig,
}

impl TaskFile {
    /// Reads and decodes a task file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid task.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read task file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid task file {}", path.display()))
    }

    /// Decodes a task file from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed YAML, unknown fields, or invalid
    /// enumeration values.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Converts the file into a task specification.
    #[must_use]
    pub fn into_spec(self) -> TaskSpec {
        let alloc_id = self
            .alloc_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let id = self
            .id
            .unwrap_or_else(|| format!("{alloc_id}-{}", self.name));
        TaskSpec {
            id: TaskId::new(id),
            task_dir: TaskDir::for_task(&self.alloc_dir, &self.name),
            name: self.name,
            alloc_id,
            command: self.command,
            env: self.env,
            resources: self.resources,
            mounts: self.mounts,
            devices: self.devices,
            driver: self.config,
        }
    }
}

/// Creates the task directories the container bind-mounts.
///
/// # Errors
///
/// Returns an error if a directory cannot be created.
pub fn prepare_task_dir(dir: &TaskDir) -> anyhow::Result<()> {
    for path in [&dir.dir, &dir.local_dir, &dir.shared_alloc_dir, &dir.secrets_dir] {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use lxtask_common::spec::{LogLevel, NetworkMode};

    use super::*;

    #[test]
    fn minimal_file_gets_generated_identity() {
        let spec = TaskFile::parse("name: web\nalloc_dir: /alloc/x\n")
            .unwrap()
            .into_spec();
        assert_eq!(spec.alloc_id.len(), 32);
        assert_eq!(spec.id.as_str(), format!("{}-web", spec.alloc_id));
        assert_eq!(spec.task_dir.local_dir, Path::new("/alloc/x/web/local"));
        spec.validate().unwrap();
    }

    #[test]
    fn full_file_is_carried_into_the_spec() {
        let text = r#"
id: t1
name: web
alloc_id: a1
alloc_dir: /alloc/a1
command: ["/bin/sh", "-c", "echo hi"]
env:
  PORT: "8080"
resources:
  memory_mb: 256
  cpu_shares: 512
mounts:
  - host_path: /srv/data
    task_path: /data
    readonly: true
config:
  template: download
  distro: alpine
  log_level: debug
  network_mode: host
  volumes: ["cache:/cache"]
"#;
        let spec = TaskFile::parse(text).unwrap().into_spec();
        assert_eq!(spec.id.as_str(), "t1");
        assert_eq!(spec.alloc_id, "a1");
        assert_eq!(spec.command.len(), 3);
        assert_eq!(spec.env["PORT"], "8080");
        assert_eq!(spec.resources.memory_mb, 256);
        assert!(spec.mounts[0].readonly);
        assert_eq!(spec.driver.log_level, LogLevel::Debug);
        assert_eq!(spec.driver.network_mode, Some(NetworkMode::Host));
        assert_eq!(spec.driver.volumes, vec!["cache:/cache"]);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let err = TaskFile::parse("name: web\nalloc_dir: /a\nconfig:\n  log_level: loud\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("log level"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(TaskFile::parse("name: web\nalloc_dir: /a\nimage: alpine\n").is_err());
    }

    #[test]
    fn task_dir_is_prepared() {
        let root = tempfile::tempdir().unwrap();
        let dir = TaskDir::for_task(root.path(), "web");
        prepare_task_dir(&dir).unwrap();
        assert!(dir.local_dir.is_dir());
        assert!(dir.secrets_dir.is_dir());
        assert!(dir.shared_alloc_dir.is_dir());
    }
}
