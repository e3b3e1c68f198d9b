//! In-memory runtime that records every directive it receives.
//!
//! Used by `lxtask plan` to render a task's configuration without touching
//! the host, and by the test suites as a stand-in for LXC. Behaviour can be
//! scripted: cgroup keys can be rejected, creation and start can fail, and
//! the reported init PID can point at a real process so liveness probing
//! works end to end.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lxtask_common::constants::DEFAULT_LXC_PATH;
use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::spec::{LogLevel, TemplateOptions, Verbosity};

use super::{ContainerRuntime, NativeContainer, parse_config};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted failures and observations shared by all recorded containers.
#[derive(Debug, Default)]
struct Script {
    rejected_cgroup_keys: HashSet<String>,
    reject_memory_limit: bool,
    fail_create: bool,
    fail_create_after_materializing: bool,
    fail_start: bool,
    init_pid: i32,
    cgroup_values: HashMap<String, Vec<String>>,
}

/// Runtime whose containers only record what they are told.
#[derive(Debug)]
pub struct RecordingRuntime {
    version: Option<String>,
    script: Arc<Mutex<Script>>,
    containers: Mutex<HashMap<String, Arc<RecordingContainer>>>,
}

impl RecordingRuntime {
    /// Creates a runtime reporting `version`.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            script: Arc::default(),
            containers: Mutex::default(),
        }
    }

    /// Creates a runtime that reports no installed LXC.
    #[must_use]
    pub fn not_installed() -> Self {
        Self {
            version: None,
            ..Self::new("")
        }
    }

    /// Makes `set_cgroup_item` reject `key`.
    pub fn reject_cgroup_key(&self, key: &str) {
        let _ = lock(&self.script).rejected_cgroup_keys.insert(key.to_owned());
    }

    /// Makes `set_memory_limit` fail.
    pub fn reject_memory_limit(&self) {
        lock(&self.script).reject_memory_limit = true;
    }

    /// Makes `create` fail.
    pub fn fail_create(&self) {
        lock(&self.script).fail_create = true;
    }

    /// Makes `create` fail after the container exists on disk, as when
    /// writing its configuration fails.
    pub fn fail_create_after_materializing(&self) {
        lock(&self.script).fail_create_after_materializing = true;
    }

    /// Makes `start_execute` fail.
    pub fn fail_start(&self) {
        lock(&self.script).fail_start = true;
    }

    /// Sets the PID reported for the next started containers.
    pub fn set_init_pid(&self, pid: i32) {
        lock(&self.script).init_pid = pid;
    }

    /// Sets the lines returned when reading cgroup item `key`.
    pub fn set_cgroup_value(&self, key: &str, lines: &[&str]) {
        let _ = lock(&self.script).cgroup_values.insert(
            key.to_owned(),
            lines.iter().map(|l| (*l).to_owned()).collect(),
        );
    }

    /// Returns the recorded container `name`, if a reference was ever handed out.
    #[must_use]
    pub fn recorded(&self, name: &str) -> Option<Arc<RecordingContainer>> {
        lock(&self.containers).get(name).cloned()
    }

    /// Returns whether container `name` is created and not destroyed.
    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.recorded(name).is_some_and(|c| {
            let state = c.state();
            state.created && !state.destroyed
        })
    }

    /// Registers an already running container, as left by a previous supervisor.
    pub fn adopt(&self, name: &str, lxc_path: &Path, pid: i32) -> Arc<RecordingContainer> {
        let container = self.entry(name, lxc_path);
        {
            let mut state = container.state();
            state.created = true;
            state.running = true;
            state.pid = pid;
        }
        container
    }

    fn entry(&self, name: &str, lxc_path: &Path) -> Arc<RecordingContainer> {
        Arc::clone(
            lock(&self.containers)
                .entry(name.to_owned())
                .or_insert_with(|| {
                    Arc::new(RecordingContainer {
                        name: name.to_owned(),
                        lxc_path: lxc_path.to_path_buf(),
                        script: Arc::clone(&self.script),
                        state: Mutex::default(),
                    })
                }),
        )
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn version(&self) -> Option<String> {
        self.version.clone()
    }

    async fn default_lxc_path(&self) -> PathBuf {
        PathBuf::from(DEFAULT_LXC_PATH)
    }

    fn container(&self, name: &str, lxc_path: &Path) -> Result<Arc<dyn NativeContainer>> {
        Ok(self.entry(name, lxc_path))
    }
}

/// Everything a [`RecordingContainer`] was told, in order.
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    /// Base configuration items, loaded from a file.
    pub base: Vec<(String, String)>,
    /// Configuration items set programmatically.
    pub items: Vec<(String, String)>,
    /// Cgroup items written after start.
    pub cgroup: Vec<(String, String)>,
    /// Memory limit set through the legacy call.
    pub memory_limit: Option<u64>,
    /// Verbosity.
    pub verbosity: Verbosity,
    /// Log level.
    pub log_level: LogLevel,
    /// Log file.
    pub log_file: Option<PathBuf>,
    /// Options the root filesystem was created with.
    pub template: Option<TemplateOptions>,
    /// Command the container was started with.
    pub command: Option<Vec<String>>,
    /// Whether the container was created.
    pub created: bool,
    /// Whether the container is running.
    pub running: bool,
    /// Whether the container was destroyed.
    pub destroyed: bool,
    /// Number of forced stops.
    pub stops: u32,
    /// Reported init PID.
    pub pid: i32,
}

impl Recorded {
    /// Returns every configuration item, base items first.
    #[must_use]
    pub fn config(&self) -> Vec<(String, String)> {
        self.base.iter().chain(&self.items).cloned().collect()
    }

    /// Returns the values set for `key`, in order.
    #[must_use]
    pub fn values(&self, key: &str) -> Vec<&str> {
        self.items
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// A container of the [`RecordingRuntime`].
#[derive(Debug)]
pub struct RecordingContainer {
    name: String,
    lxc_path: PathBuf,
    script: Arc<Mutex<Script>>,
    state: Mutex<Recorded>,
}

impl RecordingContainer {
    /// Returns a copy of everything recorded so far.
    #[must_use]
    pub fn snapshot(&self) -> Recorded {
        self.state().clone()
    }

    /// Returns the storage path the container was referenced under.
    #[must_use]
    pub fn lxc_path(&self) -> &Path {
        &self.lxc_path
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        lock(&self.state)
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }

    fn process_alive(pid: i32) -> bool {
        pid <= 0
            || matches!(
                lxtask_core::namespace::pid::probe(pid),
                Ok(lxtask_core::namespace::pid::Liveness::Alive)
            )
    }
}

#[async_trait]
impl NativeContainer for RecordingContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_verbosity(&self, verbosity: Verbosity) {
        self.state().verbosity = verbosity;
    }

    fn set_log_level(&self, level: LogLevel) -> Result<()> {
        self.state().log_level = level;
        Ok(())
    }

    fn set_log_file(&self, path: &Path) -> Result<()> {
        self.state().log_file = Some(path.to_path_buf());
        Ok(())
    }

    async fn set_config_item(&self, key: &str, value: &str) -> Result<()> {
        self.state().items.push((key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn load_config_file(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|source| LxtaskError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let items = parse_config(&text)?;
        self.state().base.extend(items);
        Ok(())
    }

    async fn create(&self, options: &TemplateOptions) -> Result<()> {
        if self.script().fail_create {
            return Err(LxtaskError::Runtime {
                operation: "lxc-create",
                message: "template download failed".into(),
            });
        }
        let fail_late = self.script().fail_create_after_materializing;
        let mut state = self.state();
        state.created = true;
        state.destroyed = false;
        state.template = Some(options.clone());
        if fail_late {
            return Err(LxtaskError::Io {
                path: self.lxc_path.join(&self.name).join("config"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        Ok(())
    }

    async fn start_execute(&self, command: &[String]) -> Result<()> {
        let (fail, pid) = {
            let script = self.script();
            (script.fail_start, script.init_pid)
        };
        let mut state = self.state();
        if !state.created {
            return Err(LxtaskError::Runtime {
                operation: "lxc-start",
                message: format!("container {} is not defined", self.name),
            });
        }
        state.command = Some(command.to_vec());
        if fail {
            return Err(LxtaskError::Runtime {
                operation: "lxc-start",
                message: "init failed to start".into(),
            });
        }
        state.running = true;
        state.pid = pid;
        Ok(())
    }

    async fn set_cgroup_item(&self, key: &str, value: &str) -> Result<()> {
        if self.script().rejected_cgroup_keys.contains(key) {
            return Err(LxtaskError::Runtime {
                operation: "lxc-cgroup",
                message: format!("unknown cgroup key {key}"),
            });
        }
        self.state().cgroup.push((key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn cgroup_item(&self, key: &str) -> Result<Vec<String>> {
        self.script()
            .cgroup_values
            .get(key)
            .cloned()
            .ok_or_else(|| LxtaskError::Runtime {
                operation: "lxc-cgroup",
                message: format!("unknown cgroup key {key}"),
            })
    }

    async fn set_memory_limit(&self, bytes: u64) -> Result<()> {
        if self.script().reject_memory_limit {
            return Err(LxtaskError::Runtime {
                operation: "lxc-cgroup",
                message: "memory.limit_in_bytes is not available".into(),
            });
        }
        self.state().memory_limit = Some(bytes);
        Ok(())
    }

    async fn init_pid(&self) -> Result<i32> {
        let state = self.state();
        if state.running && state.pid > 0 {
            Ok(state.pid)
        } else {
            Err(LxtaskError::Observation {
                pid: -1,
                message: format!("container {} has no init process", self.name),
            })
        }
    }

    async fn running(&self) -> bool {
        let state = self.state();
        state.running && Self::process_alive(state.pid)
    }

    async fn stop(&self) -> Result<()> {
        let pid = {
            let mut state = self.state();
            state.running = false;
            state.stops += 1;
            state.pid
        };
        kill_init(pid);
        Ok(())
    }

    async fn defined(&self) -> bool {
        let state = self.state();
        state.created && !state.destroyed
    }

    async fn destroy(&self) -> Result<()> {
        let running = self.state().running;
        if running && Self::process_alive(self.state().pid) {
            return Err(LxtaskError::Runtime {
                operation: "lxc-destroy",
                message: format!("container {} is running", self.name),
            });
        }
        let mut state = self.state();
        state.running = false;
        state.destroyed = true;
        Ok(())
    }
}

/// Emulates `lxc-stop -k` by killing the recorded init process.
#[cfg(target_os = "linux")]
fn kill_init(pid: i32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if pid > 0 {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(target_os = "linux"))]
const fn kill_init(_pid: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_items_in_order() {
        let runtime = RecordingRuntime::new("4.0.12");
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();
        c.set_config_item("lxc.environment", "A=1").await.unwrap();
        c.set_config_item("lxc.environment", "B=2").await.unwrap();

        let rec = runtime.recorded("web-1").unwrap().snapshot();
        assert_eq!(rec.values("lxc.environment"), vec!["A=1", "B=2"]);
        assert!(!runtime.is_defined("web-1"));
    }

    #[tokio::test]
    async fn scripted_rejections_fail_the_call() {
        let runtime = RecordingRuntime::new("4.0.12");
        runtime.reject_cgroup_key("memory.max");
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();
        assert!(c.set_cgroup_item("memory.max", "1").await.is_err());
        assert!(c.set_cgroup_item("cpu.weight", "1").await.is_ok());
    }

    #[tokio::test]
    async fn destroy_refuses_running_container() {
        let runtime = RecordingRuntime::new("4.0.12");
        let c = runtime.container("web-1", Path::new("/var/lib/lxc")).unwrap();
        assert!(!c.defined().await);
        c.create(&TemplateOptions::default()).await.unwrap();
        c.start_execute(&[]).await.unwrap();
        assert!(c.destroy().await.is_err());
        c.stop().await.unwrap();
        assert!(c.defined().await);
        c.destroy().await.unwrap();
        assert!(!c.defined().await);
        assert!(!runtime.is_defined("web-1"));
    }
}
