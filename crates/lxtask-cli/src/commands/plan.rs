//! `lxtask plan`: render a task's container directives without touching LXC.

use std::path::PathBuf;

use clap::Args;
use lxtask_common::config::DriverConfig;
use lxtask_common::constants::DEFAULT_LXC_PATH;
use lxtask_common::spec::TaskSpec;
use lxtask_core::cgroup::GenerationCache;
use lxtask_core::filesystem::mount;
use lxtask_core::namespace::network::NetworkSchema;
use lxtask_runtime::backend::NativeContainer;
use lxtask_runtime::backend::recording::{Recorded, RecordingRuntime};
use lxtask_runtime::{container, limits};

use crate::task_file::TaskFile;

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the task file.
    pub file: PathBuf,

    /// LXC version to render network keys for.
    #[arg(long, default_value = "5.0.0")]
    pub lxc_version: String,
}

/// Executes the `plan` command.
///
/// Runs the same configuration steps as a real start against a recording
/// runtime and prints what it received.
///
/// # Errors
///
/// Returns an error if the task file is invalid or a volume or device is
/// rejected.
pub async fn execute(args: PlanArgs, config: &DriverConfig) -> anyhow::Result<()> {
    let spec = TaskFile::load(&args.file)?.into_spec();
    let recorded = render(&spec, config, &args.lxc_version).await?;

    println!("# container {}", container::container_name(&spec));
    if let Some(log) = &recorded.log_file {
        println!("# log {} ({})", log.display(), recorded.log_level);
    }
    println!("# template {}", spec.driver.template_options().template);
    for (key, value) in recorded.config() {
        println!("{key} = {value}");
    }
    if !recorded.cgroup.is_empty() || recorded.memory_limit.is_some() {
        println!();
        println!("# cgroup limits");
    }
    for (key, value) in &recorded.cgroup {
        println!("{key} = {value}");
    }
    if let Some(bytes) = recorded.memory_limit {
        println!("memory.limit_in_bytes = {bytes}");
    }
    Ok(())
}

/// Applies every configuration step of a start to a recorded container.
async fn render(spec: &TaskSpec, config: &DriverConfig, lxc_version: &str) -> anyhow::Result<Recorded> {
    spec.validate()?;
    let plan = mount::plan(spec, config.volumes_enabled)?;

    let runtime = RecordingRuntime::new(lxc_version);
    let lxc_path = config
        .lxc_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LXC_PATH));
    let c = container::initialize(&runtime, &lxc_path, &config.default_config, spec).await?;

    let mode = spec.driver.network_mode.unwrap_or(config.network_mode);
    container::configure_network(c.as_ref(), mode, NetworkSchema::for_version(lxc_version)).await?;
    container::apply_mount_plan(c.as_ref(), &plan).await?;
    limits::apply_limits(c.as_ref(), &spec.resources, &GenerationCache::new()).await?;

    Ok(runtime
        .recorded(c.name())
        .map(|r| r.snapshot())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(alloc_dir: &std::path::Path, extra: &str) -> TaskSpec {
        let text = format!(
            "id: t1\nname: web\nalloc_id: a1\nalloc_dir: {}\n{extra}",
            alloc_dir.display()
        );
        TaskFile::parse(&text).unwrap().into_spec()
    }

    fn config() -> DriverConfig {
        DriverConfig {
            default_config: PathBuf::from("/nonexistent/default.conf"),
            ..DriverConfig::default()
        }
    }

    #[tokio::test]
    async fn plan_renders_network_mounts_and_limits() {
        let root = tempfile::tempdir().unwrap();
        let spec = spec(root.path(), "resources:\n  memory_mb: 256\n");
        let recorded = render(&spec, &config(), "5.0.0").await.unwrap();

        assert_eq!(recorded.values("lxc.net.0.type"), vec!["veth"]);
        assert_eq!(recorded.values("lxc.mount.entry").len(), 3);
        assert_eq!(
            recorded.cgroup,
            vec![("memory.max".to_owned(), "268435456".to_owned())]
        );
        assert!(!recorded.created);
    }

    #[tokio::test]
    async fn old_runtime_uses_legacy_network_keys() {
        let root = tempfile::tempdir().unwrap();
        let spec = spec(root.path(), "");
        let recorded = render(&spec, &config(), "1.1.5").await.unwrap();
        assert_eq!(recorded.values("lxc.network.type"), vec!["veth"]);
    }

    #[tokio::test]
    async fn disallowed_volume_fails_the_plan() {
        let root = tempfile::tempdir().unwrap();
        let spec = spec(root.path(), "config:\n  volumes: [\"/etc:/host-etc\"]\n");
        let cfg = DriverConfig {
            volumes_enabled: false,
            ..config()
        };
        assert!(render(&spec, &cfg, "5.0.0").await.is_err());
    }
}
