//! Per-task handle: liveness monitoring, shutdown, and statistics.
//!
//! A handle owns the reference to its container and the task's lifecycle
//! record. The record is only written by the handle's own monitor (and by
//! recovery before the monitor is spawned); every other caller reads a
//! snapshot.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lxtask_common::error::Result;
use lxtask_common::spec::TaskSpec;
use lxtask_common::types::{ExitResult, TaskId, TaskResourceUsage, TaskState, TaskStatus};
use lxtask_core::cgroup::GenerationCache;
use lxtask_core::cgroup::cpu::CpuTracker;
use lxtask_core::namespace::pid::{self, Liveness};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::NativeContainer;
use crate::event::{Eventer, TaskEvent, TaskEventKind};
use crate::metrics;

#[derive(Debug, Clone)]
struct Lifecycle {
    state: TaskState,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
}

/// A supervised task bound to its container.
#[derive(Debug)]
pub struct TaskHandle {
    spec: TaskSpec,
    container: Arc<dyn NativeContainer>,
    init_pid: i32,
    started_at: DateTime<Utc>,
    cgroups: Arc<GenerationCache>,
    lifecycle: RwLock<Lifecycle>,
    latest_usage: Mutex<Option<TaskResourceUsage>>,
}

impl TaskHandle {
    /// Creates a handle in `state`.
    #[must_use]
    pub fn new(
        spec: TaskSpec,
        container: Arc<dyn NativeContainer>,
        init_pid: i32,
        started_at: DateTime<Utc>,
        state: TaskState,
        cgroups: Arc<GenerationCache>,
    ) -> Self {
        Self {
            spec,
            container,
            init_pid,
            started_at,
            cgroups,
            lifecycle: RwLock::new(Lifecycle {
                state,
                completed_at: None,
                exit_result: None,
            }),
            latest_usage: Mutex::new(None),
        }
    }

    /// Task identifier.
    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.spec.id
    }

    /// Specification the task was started from.
    #[must_use]
    pub const fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Backing container.
    #[must_use]
    pub fn container(&self) -> &Arc<dyn NativeContainer> {
        &self.container
    }

    /// Host PID of the container's init process.
    #[must_use]
    pub const fn pid(&self) -> i32 {
        self.init_pid
    }

    /// When the task was started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.read().state
    }

    /// Exit result, once the task is terminal.
    #[must_use]
    pub fn exit_result(&self) -> Option<ExitResult> {
        self.read().exit_result.clone()
    }

    /// Most recent resource sample taken by a stats stream.
    #[must_use]
    pub fn latest_usage(&self) -> Option<TaskResourceUsage> {
        self.latest_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns a point-in-time view of the handle.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        let lifecycle = self.read().clone();
        TaskStatus {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            container_name: self.container.name().to_owned(),
            pid: self.init_pid,
            state: lifecycle.state,
            started_at: self.started_at,
            completed_at: lifecycle.completed_at,
            exit_result: lifecycle.exit_result,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Lifecycle> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Lifecycle> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probes the init process once and updates the lifecycle.
    ///
    /// Returns `true` once the task is terminal.
    ///
    /// # Errors
    ///
    /// Returns an observation error if the probe itself fails.
    pub async fn poll_once(&self) -> Result<bool> {
        if self.state().is_terminal() {
            return Ok(true);
        }
        match pid::probe(self.init_pid)? {
            Liveness::Alive => {
                let mut lifecycle = self.write();
                if lifecycle.state == TaskState::Unknown {
                    lifecycle.state = TaskState::Running;
                }
                Ok(false)
            }
            Liveness::Gone => {
                let _ = self.mark_exited().await;
                Ok(true)
            }
        }
    }

    /// Records termination of the init process.
    ///
    /// An OOM kill recorded by the cgroup marks the task failed; otherwise
    /// it exited with code 0, the only code observable for a process that
    /// is not our child. A container left running without its init is
    /// stopped.
    pub async fn mark_exited(&self) -> ExitResult {
        if let Some(result) = self.exit_result() {
            return result;
        }

        let oom_killed = metrics::oom_kills(self.container.as_ref(), &self.cgroups)
            .await
            .is_some_and(|kills| kills > 0);
        let (state, result) = if oom_killed {
            (
                TaskState::Failed,
                ExitResult {
                    exit_code: 137,
                    oom_killed: true,
                    err: Some("container was killed by the OOM killer".into()),
                },
            )
        } else {
            (TaskState::Exited, ExitResult::default())
        };

        if self.container.running().await {
            if let Err(e) = self.container.stop().await {
                tracing::warn!(container = %self.container.name(), error = %e, "failed to stop container after init exit");
            }
        }

        let mut lifecycle = self.write();
        if !lifecycle.state.is_terminal() {
            lifecycle.state = state;
            lifecycle.completed_at = Some(Utc::now());
            lifecycle.exit_result = Some(result.clone());
            tracing::info!(task_id = %self.spec.id, pid = self.init_pid, %state, "task terminated");
        }
        lifecycle.exit_result.clone().unwrap_or(result)
    }

    /// Polls liveness every `interval` until the task terminates or
    /// `shutdown` is cancelled.
    pub async fn monitor(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
        events: Eventer,
    ) {
        tracing::debug!(task_id = %self.spec.id, pid = self.init_pid, "monitoring task");
        loop {
            match self.poll_once().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(task_id = %self.spec.id, error = %e, "liveness probe failed");
                }
            }
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!(task_id = %self.spec.id, "monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }
        }

        if let Some(result) = self.exit_result() {
            let message = if result.oom_killed {
                "container was killed by the OOM killer".to_owned()
            } else {
                format!("container exited with code {}", result.exit_code)
            };
            events.emit(TaskEvent::new(
                self.spec.id.clone(),
                TaskEventKind::Exited { result },
                message,
            ));
        }
    }

    /// Stops the task: `SIGTERM` first, a forced container stop after `timeout`.
    ///
    /// Idempotent: a terminal task or a vanished init process succeeds
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the forced stop fails.
    pub async fn shutdown(&self, timeout: Duration, poll: Duration) -> Result<()> {
        if self.state().is_terminal() || pid::probe(self.init_pid)? == Liveness::Gone {
            return Ok(());
        }

        tracing::info!(task_id = %self.spec.id, pid = self.init_pid, ?timeout, "stopping task");
        if let Err(e) = pid::terminate(self.init_pid) {
            tracing::warn!(task_id = %self.spec.id, error = %e, "SIGTERM failed, forcing stop");
        } else {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if pid::probe(self.init_pid)? == Liveness::Gone {
                    return Ok(());
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    break;
                }
                tokio::time::sleep(poll.min(deadline - now)).await;
            }
            tracing::warn!(task_id = %self.spec.id, ?timeout, "task ignored SIGTERM, forcing stop");
        }

        match self.container.stop().await {
            Ok(()) => Ok(()),
            Err(_) if pid::probe(self.init_pid)? == Liveness::Gone => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Streams resource usage every `interval` until `cancel` or `shutdown`
    /// fires, or the task terminates.
    ///
    /// Transient sampling failures are skipped.
    #[must_use]
    pub fn stats(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> mpsc::Receiver<TaskResourceUsage> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            let mut tracker = CpuTracker::new();
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if self.state().is_terminal() {
                    break;
                }
                let sample = metrics::collect_usage(
                    &self.spec.id,
                    self.container.as_ref(),
                    &self.cgroups,
                    &mut tracker,
                )
                .await;
                match sample {
                    Ok(usage) => {
                        *self
                            .latest_usage
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(usage.clone());
                        if tx.send(usage).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(task_id = %self.spec.id, error = %e, "skipping stats sample");
                    }
                }
            }
            tracing::debug!(task_id = %self.spec.id, "stats stream closed");
        });
        rx
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use lxtask_common::spec::{LxcTaskConfig, Resources, TaskDir};

    use super::*;
    use crate::backend::ContainerRuntime;
    use crate::backend::recording::RecordingRuntime;

    fn spec() -> TaskSpec {
        TaskSpec {
            id: TaskId::new("t1"),
            name: "web".into(),
            alloc_id: "a1".into(),
            command: vec![],
            env: BTreeMap::new(),
            resources: Resources::default(),
            mounts: vec![],
            devices: vec![],
            task_dir: TaskDir::for_task("/alloc/a1", "web"),
            driver: LxcTaskConfig::default(),
        }
    }

    /// Spawns `sleep`, reaping it on a background thread once it exits.
    fn sleeper(secs: &str) -> i32 {
        let mut child = std::process::Command::new("sleep").arg(secs).spawn().unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = std::thread::spawn(move || child.wait());
        pid
    }

    fn handle(runtime: &RecordingRuntime, pid: i32, state: TaskState) -> Arc<TaskHandle> {
        let container = runtime.adopt("web-a1", Path::new("/var/lib/lxc"), pid);
        let container: Arc<dyn NativeContainer> = container;
        Arc::new(TaskHandle::new(
            spec(),
            container,
            pid,
            Utc::now(),
            state,
            Arc::new(GenerationCache::new()),
        ))
    }

    #[tokio::test]
    async fn unknown_becomes_running_on_first_probe() {
        let runtime = RecordingRuntime::new("4.0.12");
        let pid = sleeper("30");
        let h = handle(&runtime, pid, TaskState::Unknown);
        assert!(!h.poll_once().await.unwrap());
        assert_eq!(h.state(), TaskState::Running);
        h.shutdown(Duration::from_secs(5), Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn monitor_records_exit_and_emits_event() {
        let runtime = RecordingRuntime::new("4.0.12");
        let pid = sleeper("0.2");
        let h = handle(&runtime, pid, TaskState::Running);
        let events = Eventer::new();
        let mut rx = events.subscribe();

        let monitor = tokio::spawn(Arc::clone(&h).monitor(
            Duration::from_millis(50),
            CancellationToken::new(),
            events,
        ));
        tokio::time::timeout(Duration::from_secs(5), monitor).await.unwrap().unwrap();

        assert_eq!(h.state(), TaskState::Exited);
        assert_eq!(h.exit_result(), Some(ExitResult::default()));
        assert!(h.status().completed_at.is_some());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, TaskEventKind::Exited { .. }));
    }

    #[tokio::test]
    async fn oom_kill_marks_task_failed() {
        let runtime = RecordingRuntime::new("4.0.12");
        runtime.set_cgroup_value("memory.events", &["oom_kill 2"]);
        let h = handle(&runtime, sleeper("0"), TaskState::Running);
        let result = h.mark_exited().await;
        assert!(result.oom_killed);
        assert_eq!(h.state(), TaskState::Failed);
    }

    #[tokio::test]
    async fn shutdown_terminates_and_is_idempotent() {
        let runtime = RecordingRuntime::new("4.0.12");
        let pid = sleeper("30");
        let h = handle(&runtime, pid, TaskState::Running);

        h.shutdown(Duration::from_secs(5), Duration::from_millis(20)).await.unwrap();
        assert_eq!(pid::probe(pid).unwrap(), Liveness::Gone);
        h.shutdown(Duration::from_secs(5), Duration::from_millis(20)).await.unwrap();

        let rec = runtime.recorded("web-a1").unwrap().snapshot();
        assert_eq!(rec.stops, 0);
    }

    #[tokio::test]
    async fn shutdown_escalates_after_timeout() {
        let runtime = RecordingRuntime::new("4.0.12");
        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = i32::try_from(child.id()).unwrap();
        let _ = std::thread::spawn(move || child.wait());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let h = handle(&runtime, pid, TaskState::Running);
        h.shutdown(Duration::from_millis(200), Duration::from_millis(20)).await.unwrap();

        let rec = runtime.recorded("web-a1").unwrap().snapshot();
        assert_eq!(rec.stops, 1);
    }

    #[tokio::test]
    async fn stats_stream_ends_on_cancel() {
        let runtime = RecordingRuntime::new("4.0.12");
        runtime.set_cgroup_value("cpu.stat", &["usage_usec 10", "user_usec 5", "system_usec 5"]);
        runtime.set_cgroup_value("memory.current", &["1024"]);
        let h = handle(&runtime, sleeper("30"), TaskState::Running);

        let cancel = CancellationToken::new();
        let mut rx = Arc::clone(&h).stats(
            Duration::from_millis(20),
            cancel.clone(),
            CancellationToken::new(),
        );
        let first = rx.recv().await.unwrap();
        assert_eq!(first.memory.usage_bytes, 1024);
        assert!(h.latest_usage().is_some());

        cancel.cancel();
        while rx.recv().await.is_some() {}
        h.shutdown(Duration::from_secs(5), Duration::from_millis(20)).await.unwrap();
    }
}
