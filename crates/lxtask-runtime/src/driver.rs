//! Driver that orchestrates task lifecycles on top of a container runtime.
//!
//! Starting a task runs the container pipeline (initialize, create,
//! network, mounts, start, limits), persists the handle, registers it and
//! spawns its monitor. Any failure after the container exists rolls the
//! container back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lxtask_common::config::DriverConfig;
use lxtask_common::constants::{DESTROY_GRACE_SECS, TASK_HANDLE_VERSION};
use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::spec::{NetworkMode, TaskSpec};
use lxtask_common::types::{
    Capabilities, ExitResult, Fingerprint, FsIsolation, HealthState, TaskId, TaskResourceUsage,
    TaskState, TaskStatus,
};
use lxtask_core::cgroup::GenerationCache;
use lxtask_core::filesystem::mount;
use lxtask_core::namespace::network::NetworkSchema;
use tokio::sync::{OnceCell, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backend::{ContainerRuntime, NativeContainer};
use crate::container;
use crate::event::{Eventer, TaskEvent, TaskEventKind};
use crate::handle::TaskHandle;
use crate::limits;
use crate::state::{self, PersistedTaskState};
use crate::store::TaskStore;

/// The LXC task driver.
pub struct Driver {
    config: DriverConfig,
    runtime: Arc<dyn ContainerRuntime>,
    tasks: TaskStore,
    events: Eventer,
    cgroups: Arc<GenerationCache>,
    network_schema: OnceCell<NetworkSchema>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("config", &self.config)
            .field("tasks", &self.tasks.ids())
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Creates a driver using `runtime`.
    #[must_use]
    pub fn new(config: DriverConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            tasks: TaskStore::new(),
            events: Eventer::new(),
            cgroups: Arc::new(GenerationCache::new()),
            network_schema: OnceCell::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Driver configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Registered task IDs.
    #[must_use]
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.ids()
    }

    /// Returns the container storage path.
    pub async fn lxc_path(&self) -> PathBuf {
        match &self.config.lxc_path {
            Some(path) => path.clone(),
            None => self.runtime.default_lxc_path().await,
        }
    }

    /// Returns the network key schema, resolved once from the runtime version.
    pub async fn network_schema(&self) -> NetworkSchema {
        *self
            .network_schema
            .get_or_init(|| async {
                let version = self.runtime.version().await.unwrap_or_default();
                let schema = NetworkSchema::for_version(&version);
                tracing::debug!(%version, ?schema, "network schema selected");
                schema
            })
            .await
    }

    /// Starts a task and returns the record that allows recovering it.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad spec or mount plan (nothing is
    /// created), [`LxtaskError::AlreadyExists`] for a duplicate ID, a
    /// recoverable error if the root filesystem cannot be materialized, and
    /// the failing step's error otherwise, after rolling the container back.
    pub async fn start_task(&self, spec: TaskSpec) -> Result<PersistedTaskState> {
        if !self.config.enabled {
            return Err(LxtaskError::validation("lxc driver is disabled"));
        }
        spec.validate()?;
        if self.tasks.contains(&spec.id) {
            return Err(LxtaskError::AlreadyExists {
                kind: "task",
                id: spec.id.to_string(),
            });
        }

        let plan = mount::plan(&spec, self.config.volumes_enabled)?;
        let network_mode = spec.driver.network_mode.unwrap_or(self.config.network_mode);
        let schema = self.network_schema().await;
        let lxc_path = self.lxc_path().await;

        let c = container::initialize(
            self.runtime.as_ref(),
            &lxc_path,
            &self.config.default_config,
            &spec,
        )
        .await?;

        if let Err(e) = c.create(&spec.driver.template_options()).await {
            if c.defined().await {
                tracing::error!(task_id = %spec.id, container = %c.name(), error = %e, "container creation failed after materializing, rolling back");
                rollback(c.as_ref()).await;
            }
            return Err(LxtaskError::Recoverable {
                message: format!("failed to create container {}: {e}", c.name()),
            });
        }
        tracing::info!(task_id = %spec.id, container = %c.name(), "container created");

        match self.launch(&spec, c.as_ref(), network_mode, schema, &plan).await {
            Ok(pid) => self.register(spec, c, pid).await,
            Err(e) => {
                tracing::error!(task_id = %spec.id, container = %c.name(), error = %e, "task start failed, rolling back");
                rollback(c.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Configures and starts a created container, returning its init PID.
    async fn launch(
        &self,
        spec: &TaskSpec,
        c: &dyn NativeContainer,
        network_mode: NetworkMode,
        schema: NetworkSchema,
        plan: &mount::MountPlan,
    ) -> Result<i32> {
        container::configure_network(c, network_mode, schema).await?;
        container::apply_mount_plan(c, plan).await?;
        c.start_execute(&spec.command).await?;
        limits::apply_limits(c, &spec.resources, &self.cgroups).await?;
        let pid = c.init_pid().await?;
        tracing::info!(task_id = %spec.id, container = %c.name(), pid, "task started");
        Ok(pid)
    }

    /// Persists, registers and monitors a started task.
    async fn register(
        &self,
        spec: TaskSpec,
        c: Arc<dyn NativeContainer>,
        pid: i32,
    ) -> Result<PersistedTaskState> {
        let started_at = Utc::now();
        let record = PersistedTaskState::new(c.name().to_owned(), spec.clone(), started_at);
        let id = spec.id.clone();
        let handle = Arc::new(TaskHandle::new(
            spec,
            Arc::clone(&c),
            pid,
            started_at,
            TaskState::Running,
            Arc::clone(&self.cgroups),
        ));

        if let Err(e) = self.tasks.insert_new(id.clone(), Arc::clone(&handle)) {
            tracing::error!(task_id = %id, error = %e, "failed to register task, rolling back");
            rollback(c.as_ref()).await;
            return Err(e);
        }
        if let Err(e) = self.persist(&record) {
            tracing::error!(task_id = %id, error = %e, "failed to persist task state, rolling back");
            let _ = self.tasks.delete(&id);
            rollback(c.as_ref()).await;
            return Err(e);
        }

        self.spawn_monitor(handle);
        self.events.emit(TaskEvent::new(
            id,
            TaskEventKind::Started,
            format!("started container {}", c.name()),
        ));
        Ok(record)
    }

    fn persist(&self, record: &PersistedTaskState) -> Result<()> {
        match &self.config.state_dir {
            Some(dir) => state::save_state(dir, record),
            None => Ok(()),
        }
    }

    fn spawn_monitor(&self, handle: Arc<TaskHandle>) {
        let _ = tokio::spawn(handle.monitor(
            self.config.monitor_interval(),
            self.shutdown.child_token(),
            self.events.clone(),
        ));
    }

    /// Re-attaches to the container of a persisted task.
    ///
    /// Recovering a task that is already registered is a no-op. Records
    /// written before versioning derive the container name from the spec.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown record version or an
    /// error if the container reference cannot be obtained.
    pub async fn recover_task(&self, record: &PersistedTaskState) -> Result<()> {
        let id = record.task_id();
        if self.tasks.contains(id) {
            tracing::debug!(task_id = %id, "task already registered, nothing to recover");
            return Ok(());
        }
        if record.schema_version > TASK_HANDLE_VERSION {
            return Err(LxtaskError::validation(format!(
                "task state version {} is newer than supported version {TASK_HANDLE_VERSION}",
                record.schema_version
            )));
        }

        let name = if record.schema_version == 0 || record.container_name.is_empty() {
            tracing::info!(task_id = %id, "recovering task from unversioned state");
            container::container_name(&record.task_spec)
        } else {
            record.container_name.clone()
        };

        let lxc_path = self.lxc_path().await;
        let c = self.runtime.container(&name, &lxc_path)?;
        let pid = match c.init_pid().await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(task_id = %id, container = %name, error = %e, "no init process found");
                -1
            }
        };

        let handle = Arc::new(TaskHandle::new(
            record.task_spec.clone(),
            c,
            pid,
            record.started_at,
            TaskState::Unknown,
            Arc::clone(&self.cgroups),
        ));
        if pid > 0 {
            if let Err(e) = handle.poll_once().await {
                tracing::warn!(task_id = %id, error = %e, "initial liveness probe failed");
            }
        } else {
            let _ = handle.mark_exited().await;
        }

        self.tasks.insert_new(id.clone(), Arc::clone(&handle))?;
        let task_state = handle.state();
        self.spawn_monitor(handle);
        tracing::info!(task_id = %id, container = %name, pid, state = %task_state, "task recovered");
        self.events.emit(TaskEvent::new(
            id.clone(),
            TaskEventKind::Recovered,
            format!("recovered container {name} in state {task_state}"),
        ));
        Ok(())
    }

    /// Recovers every task persisted in the state directory.
    ///
    /// Failures are logged per task and do not stop the others.
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory cannot be listed.
    pub async fn recover_all(&self) -> Result<Vec<TaskId>> {
        let Some(dir) = &self.config.state_dir else {
            return Ok(Vec::new());
        };
        let mut recovered = Vec::new();
        for record in state::load_all(dir)? {
            match self.recover_task(&record).await {
                Ok(()) => recovered.push(record.task_id().clone()),
                Err(e) => {
                    tracing::warn!(task_id = %record.task_id(), error = %e, "failed to recover task");
                }
            }
        }
        Ok(recovered)
    }

    /// Returns a channel receiving the task's exit result once it terminates.
    ///
    /// The channel closes without a value if `cancel` fires first or the
    /// driver shuts down.
    ///
    /// # Errors
    ///
    /// Returns [`LxtaskError::NotFound`] for an unknown task.
    pub fn wait_task(&self, id: &TaskId, cancel: CancellationToken) -> Result<mpsc::Receiver<ExitResult>> {
        let handle = self.tasks.lookup(id)?;
        let interval = self.config.monitor_interval();
        let shutdown = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel(1);
        let _ = tokio::spawn(async move {
            loop {
                if let Some(result) = handle.exit_result() {
                    let _ = tx.send(result).await;
                    return;
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = shutdown.cancelled() => return,
                    () = tx.closed() => return,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        });
        Ok(rx)
    }

    /// Stops a task, forcing the container down after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LxtaskError::NotFound`] for an unknown task or the forced
    /// stop's error.
    pub async fn stop_task(&self, id: &TaskId, timeout: Duration) -> Result<()> {
        let handle = self.tasks.lookup(id)?;
        handle
            .shutdown(timeout, self.config.monitor_interval())
            .await?;
        self.events.emit(TaskEvent::new(id.clone(), TaskEventKind::Stopped, "task stopped"));
        Ok(())
    }

    /// Removes a task from the driver.
    ///
    /// A running task is refused unless `force` is set, in which case it is
    /// stopped with a one minute grace period. With container collection
    /// enabled the container itself is destroyed. Stop and destroy failures
    /// are logged; the task is unregistered regardless.
    ///
    /// # Errors
    ///
    /// Returns [`LxtaskError::NotFound`] for an unknown task or
    /// [`LxtaskError::InvalidState`] for a running task without `force`.
    pub async fn destroy_task(&self, id: &TaskId, force: bool) -> Result<()> {
        let handle = self.tasks.lookup(id)?;
        let running = !handle.state().is_terminal();
        if running && !force {
            return Err(LxtaskError::InvalidState {
                id: id.to_string(),
                message: "cannot destroy running task".into(),
            });
        }

        if running {
            let grace = Duration::from_secs(DESTROY_GRACE_SECS);
            if let Err(e) = handle.shutdown(grace, self.config.monitor_interval()).await {
                tracing::error!(task_id = %id, error = %e, "failed to stop task during destroy");
            }
        }

        if self.config.gc.container {
            let c = handle.container();
            if c.running().await {
                if let Err(e) = c.stop().await {
                    tracing::warn!(task_id = %id, error = %e, "failed to stop container before destroy");
                }
            }
            if !c.defined().await {
                tracing::debug!(task_id = %id, container = %c.name(), "container already gone");
            } else if let Err(e) = c.destroy().await {
                tracing::error!(task_id = %id, container = %c.name(), error = %e, "failed to destroy container");
            }
        }

        if let Some(dir) = &self.config.state_dir {
            if let Err(e) = state::remove_state(dir, id) {
                tracing::warn!(task_id = %id, error = %e, "failed to remove task state");
            }
        }
        let _ = self.tasks.delete(id);
        self.events.emit(TaskEvent::new(id.clone(), TaskEventKind::Destroyed, "task destroyed"));
        Ok(())
    }

    /// Returns a point-in-time view of a task.
    ///
    /// # Errors
    ///
    /// Returns [`LxtaskError::NotFound`] for an unknown task.
    pub fn inspect_task(&self, id: &TaskId) -> Result<TaskStatus> {
        Ok(self.tasks.lookup(id)?.status())
    }

    /// Streams a task's resource usage every `interval`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a zero interval and
    /// [`LxtaskError::NotFound`] for an unknown task.
    pub fn task_stats(
        &self,
        id: &TaskId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TaskResourceUsage>> {
        if interval.is_zero() {
            return Err(LxtaskError::validation("stats interval must be positive"));
        }
        let handle = self.tasks.lookup(id)?;
        Ok(handle.stats(interval, cancel, self.shutdown.child_token()))
    }

    /// Subscribes to task lifecycle events.
    #[must_use]
    pub fn task_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Builds one fingerprint from the driver config and the runtime.
    pub async fn build_fingerprint(&self) -> Fingerprint {
        let version = self.runtime.version().await.unwrap_or_default();
        let (health, description) = if !self.config.enabled {
            (HealthState::Undetected, "disabled".to_owned())
        } else if version.is_empty() {
            (HealthState::Undetected, "lxc not found".to_owned())
        } else {
            (HealthState::Healthy, "healthy".to_owned())
        };
        Fingerprint {
            available: health == HealthState::Healthy,
            version,
            volumes_enabled: self.config.volumes_enabled,
            health,
            description,
        }
    }

    /// Streams fingerprints: one immediately, then every fingerprint period.
    pub fn fingerprint(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<Fingerprint> {
        let (tx, rx) = mpsc::channel(1);
        let driver = Arc::clone(self);
        let shutdown = self.shutdown.child_token();
        let _ = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(driver.config.fingerprint_period());
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let fp = driver.build_fingerprint().await;
                tracing::debug!(health = ?fp.health, version = %fp.version, "fingerprint");
                if tx.send(fp).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    /// Optional features supported by the driver.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        Capabilities {
            send_signals: false,
            exec: false,
            fs_isolation: FsIsolation::Image,
        }
    }

    /// Signal delivery is not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`LxtaskError::Unsupported`].
    pub fn signal_task(&self, _id: &TaskId, _signal: &str) -> Result<()> {
        Err(LxtaskError::Unsupported {
            operation: "signal delivery",
        })
    }

    /// Command execution inside a task is not supported.
    ///
    /// # Errors
    ///
    /// Always returns [`LxtaskError::Unsupported`].
    pub fn exec_task(&self, _id: &TaskId, _cmd: &[String], _timeout: Duration) -> Result<()> {
        Err(LxtaskError::Unsupported {
            operation: "exec",
        })
    }

    /// Cancels every monitor and stream spawned by the driver.
    ///
    /// Containers keep running and can be recovered by a new driver.
    pub fn shutdown(&self) {
        tracing::info!(tasks = self.tasks.ids().len(), "driver shutting down");
        self.shutdown.cancel();
    }
}

/// Stops a partially started container if needed and destroys it.
async fn rollback(c: &dyn NativeContainer) {
    if c.running().await {
        if let Err(e) = c.stop().await {
            tracing::error!(container = %c.name(), error = %e, "failed to stop container during rollback");
        }
    }
    if !c.defined().await {
        return;
    }
    if let Err(e) = c.destroy().await {
        tracing::error!(container = %c.name(), error = %e, "failed to destroy container during rollback");
    }
}
