//! Native container runtime abstraction.
//!
//! [`ContainerRuntime`] hands out [`NativeContainer`] references by name.
//! A reference may point at a container that does not exist yet, in which
//! case configuration directives are buffered until [`NativeContainer::create`]
//! materializes it, or at an existing container being re-attached after a
//! supervisor restart.

pub mod lxc;
pub mod recording;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::spec::{LogLevel, TemplateOptions, Verbosity};

/// A container runtime installed on the host.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime version, or `None` when it is not installed.
    async fn version(&self) -> Option<String>;

    /// Returns the runtime's default container storage path.
    async fn default_lxc_path(&self) -> PathBuf;

    /// Returns a reference to the container `name` stored under `lxc_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference cannot be constructed.
    fn container(&self, name: &str, lxc_path: &Path) -> Result<Arc<dyn NativeContainer>>;
}

/// One container as seen by the native runtime.
///
/// Methods take `&self`; implementations synchronize internally so a
/// reference can be shared between the task handle, its poller, and stats
/// subscribers.
#[async_trait]
pub trait NativeContainer: Send + Sync + fmt::Debug {
    /// Container name.
    fn name(&self) -> &str;

    /// Sets how chatty the runtime is on its standard streams.
    fn set_verbosity(&self, verbosity: Verbosity);

    /// Sets the runtime log level.
    ///
    /// # Errors
    ///
    /// Returns an error if the level cannot be applied.
    fn set_log_level(&self, level: LogLevel) -> Result<()>;

    /// Sets the file receiving the runtime's log.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be used.
    fn set_log_file(&self, path: &Path) -> Result<()>;

    /// Sets one configuration directive.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime rejects the directive.
    async fn set_config_item(&self, key: &str, value: &str) -> Result<()>;

    /// Loads a base configuration file underneath the programmatic directives.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    async fn load_config_file(&self, path: &Path) -> Result<()>;

    /// Materializes the container and its root filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    async fn create(&self, options: &TemplateOptions) -> Result<()>;

    /// Starts the container with `command` as its init process.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start_execute(&self, command: &[String]) -> Result<()>;

    /// Writes a cgroup item of the running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is rejected.
    async fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()>;

    /// Reads a cgroup item of the running container, one entry per line.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be read.
    async fn cgroup_item(&self, key: &str) -> Result<Vec<String>>;

    /// Sets the hard memory limit through the legacy memory controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the limit is rejected.
    async fn set_memory_limit(&self, bytes: u64) -> Result<()>;

    /// Returns the host PID of the container's init process.
    ///
    /// # Errors
    ///
    /// Returns an observation error if the container has no init process.
    async fn init_pid(&self) -> Result<i32>;

    /// Returns whether the container is running.
    async fn running(&self) -> bool;

    /// Forcefully stops the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    async fn stop(&self) -> Result<()>;

    /// Returns whether the container exists on disk.
    async fn defined(&self) -> bool;

    /// Removes the container definition and its root filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be destroyed.
    async fn destroy(&self) -> Result<()>;
}

/// Parses an LXC configuration file into ordered `key = value` items.
///
/// Blank lines and `#` comments are skipped.
///
/// # Errors
///
/// Returns a validation error for a line without `=`.
pub fn parse_config(text: &str) -> Result<Vec<(String, String)>> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
                .ok_or_else(|| {
                    LxtaskError::validation(format!("config line {n} is not `key = value`"))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_keeps_order_and_skips_comments() {
        let text = "# base\nlxc.net.0.type = veth\n\n  lxc.apparmor.profile=generated \n";
        let items = parse_config(text).unwrap();
        assert_eq!(
            items,
            vec![
                ("lxc.net.0.type".into(), "veth".into()),
                ("lxc.apparmor.profile".into(), "generated".into()),
            ]
        );
    }

    #[test]
    fn parse_config_rejects_bare_words() {
        let err = parse_config("lxc.include\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }
}
