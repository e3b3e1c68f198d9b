//! Container initialization and configuration.
//!
//! These steps only set directives on a [`NativeContainer`]; nothing is
//! materialized until the container is created.

use std::path::Path;
use std::sync::Arc;

use lxtask_common::error::Result;
use lxtask_common::spec::{NetworkMode, TaskSpec};
use lxtask_core::filesystem::mount::MountPlan;
use lxtask_core::namespace::network::{NetworkSchema, network_directives};

use crate::backend::{ContainerRuntime, NativeContainer};
use crate::logs;

/// Returns the container name of a task: `<task name>-<allocation id>`.
///
/// Characters LXC does not accept in names are replaced by `_`.
#[must_use]
pub fn container_name(spec: &TaskSpec) -> String {
    format!("{}-{}", spec.name, spec.alloc_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Obtains a container reference for `spec` and applies its base settings.
///
/// Sets verbosity, log level and log file, the cgroup directory, the
/// environment, and loads the base configuration file. A base file that
/// cannot be loaded is logged and skipped.
///
/// # Errors
///
/// Returns an error if the runtime refuses the reference or a directive.
pub async fn initialize(
    runtime: &dyn ContainerRuntime,
    lxc_path: &Path,
    default_config: &Path,
    spec: &TaskSpec,
) -> Result<Arc<dyn NativeContainer>> {
    let name = container_name(spec);
    let container = runtime.container(&name, lxc_path)?;
    let cfg = &spec.driver;

    container.set_verbosity(cfg.verbosity);
    container.set_log_level(cfg.log_level)?;
    container.set_log_file(&logs::log_path(&spec.task_dir.dir, &spec.name))?;

    if let Some(dir) = &cfg.cgroup {
        container.set_config_item("lxc.cgroup.dir", dir).await?;
    }

    for entry in &cfg.environment {
        container.set_config_item("lxc.environment", entry).await?;
    }
    for (key, value) in &spec.env {
        container
            .set_config_item("lxc.environment", &format!("{key}={value}"))
            .await?;
    }

    let base = cfg.default_config.as_deref().unwrap_or(default_config);
    if let Err(e) = container.load_config_file(base).await {
        tracing::warn!(
            container = %name,
            path = %base.display(),
            error = %e,
            "failed to load base config, continuing without it"
        );
    }

    tracing::debug!(container = %name, "container initialized");
    Ok(container)
}

/// Attaches the container to the network in `mode`.
///
/// # Errors
///
/// Returns an error if the runtime rejects a network directive.
pub async fn configure_network(
    container: &dyn NativeContainer,
    mode: NetworkMode,
    schema: NetworkSchema,
) -> Result<()> {
    for (key, value) in network_directives(mode, schema) {
        container.set_config_item(&key, &value).await?;
    }
    tracing::debug!(container = %container.name(), %mode, ?schema, "network configured");
    Ok(())
}

/// Applies a mount and device plan: mount entries first, then device rules.
///
/// # Errors
///
/// Returns an error if the runtime rejects an entry.
pub async fn apply_mount_plan(container: &dyn NativeContainer, plan: &MountPlan) -> Result<()> {
    for entry in &plan.mount_entries {
        container.set_config_item("lxc.mount.entry", entry).await?;
    }
    for rule in &plan.device_allows {
        container
            .set_config_item("lxc.cgroup.devices.allow", rule)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use lxtask_common::spec::{LxcTaskConfig, Resources, TaskDir};
    use lxtask_common::types::TaskId;

    use super::*;
    use crate::backend::recording::RecordingRuntime;

    fn spec() -> TaskSpec {
        TaskSpec {
            id: TaskId::new("t1"),
            name: "web".into(),
            alloc_id: "123".into(),
            command: vec![],
            env: BTreeMap::from([("PORT".into(), "80".into())]),
            resources: Resources::default(),
            mounts: vec![],
            devices: vec![],
            task_dir: TaskDir::for_task("/alloc/123", "web"),
            driver: LxcTaskConfig::default(),
        }
    }

    #[test]
    fn container_name_joins_task_and_allocation() {
        assert_eq!(container_name(&spec()), "web-123");

        let mut odd = spec();
        odd.name = "api/v1 worker".into();
        assert_eq!(container_name(&odd), "api_v1_worker-123");
    }

    #[tokio::test]
    async fn initialize_sets_environment_in_order() {
        let runtime = RecordingRuntime::new("4.0.12");
        let mut spec = spec();
        spec.driver.environment = vec!["PORT=8080".into()];
        spec.driver.cgroup = Some("lxtask/web".into());

        let c = initialize(
            &runtime,
            Path::new("/var/lib/lxc"),
            Path::new("/nonexistent/default.conf"),
            &spec,
        )
        .await
        .unwrap();
        assert_eq!(c.name(), "web-123");

        let rec = runtime.recorded("web-123").unwrap().snapshot();
        assert_eq!(rec.values("lxc.environment"), vec!["PORT=8080", "PORT=80"]);
        assert_eq!(rec.values("lxc.cgroup.dir"), vec!["lxtask/web"]);
        assert_eq!(
            rec.log_file,
            Some(PathBuf::from("/alloc/123/web/web-lxc.log"))
        );
        assert!(rec.base.is_empty());
    }

    #[tokio::test]
    async fn base_config_items_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("default.conf");
        std::fs::write(&base, "lxc.net.0.type = empty\n").unwrap();

        let runtime = RecordingRuntime::new("4.0.12");
        let c = initialize(&runtime, Path::new("/var/lib/lxc"), &base, &spec())
            .await
            .unwrap();
        configure_network(c.as_ref(), NetworkMode::Host, NetworkSchema::Indexed)
            .await
            .unwrap();

        let config = runtime.recorded("web-123").unwrap().snapshot().config();
        assert_eq!(config[0], ("lxc.net.0.type".into(), "empty".into()));
        assert_eq!(
            config.last().unwrap(),
            &("lxc.net.0.type".to_string(), "none".to_string())
        );
    }

    #[tokio::test]
    async fn bridge_network_on_legacy_schema() {
        let runtime = RecordingRuntime::new("2.0.9");
        let c = runtime.container("web-123", Path::new("/var/lib/lxc")).unwrap();
        configure_network(c.as_ref(), NetworkMode::Bridge, NetworkSchema::Legacy)
            .await
            .unwrap();

        let rec = runtime.recorded("web-123").unwrap().snapshot();
        assert_eq!(rec.values("lxc.network.type"), vec!["veth"]);
        assert_eq!(rec.values("lxc.network.link"), vec!["lxcbr0"]);
        assert_eq!(rec.values("lxc.network.flags"), vec!["up"]);
    }

    #[tokio::test]
    async fn mount_plan_entries_then_devices() {
        let runtime = RecordingRuntime::new("4.0.12");
        let c = runtime.container("web-123", Path::new("/var/lib/lxc")).unwrap();
        let plan = MountPlan {
            mount_entries: vec!["/a a none rw,bind,create=dir".into()],
            device_allows: vec!["c 1:3 rw".into()],
        };
        apply_mount_plan(c.as_ref(), &plan).await.unwrap();

        let rec = runtime.recorded("web-123").unwrap().snapshot();
        assert_eq!(rec.items[0].0, "lxc.mount.entry");
        assert_eq!(rec.items[1], ("lxc.cgroup.devices.allow".into(), "c 1:3 rw".into()));
    }
}
