//! Bind mount and device planning for a task.
//!
//! The plan is rendered as LXC `lxc.mount.entry` and
//! `lxc.cgroup.devices.allow` values. Mount entries are applied by the
//! runtime in order and later entries shadow earlier ones at the same
//! target, so the ordering is fixed: allocation directories, task mounts,
//! task devices, then user volumes.

use std::path::Path;

use lxtask_common::error::Result;
use lxtask_common::spec::{DeviceConfig, MountConfig, TaskSpec};

use super::volume::Volume;
use crate::cgroup::device::HostDevice;

/// Resolved mount and device directives of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    /// `lxc.mount.entry` values, in application order.
    pub mount_entries: Vec<String>,
    /// `lxc.cgroup.devices.allow` values.
    pub device_allows: Vec<String>,
}

/// Computes the mount and device plan of `spec`.
///
/// Every device must resolve on the host; a single unresolvable device
/// fails the whole plan.
///
/// # Errors
///
/// Returns a validation error for malformed or disallowed volumes and an
/// error for devices that cannot be resolved.
pub fn plan(spec: &TaskSpec, volumes_enabled: bool) -> Result<MountPlan> {
    let dirs = &spec.task_dir;
    let mut mount_entries = vec![
        format!("{} local none rw,bind,create=dir", dirs.local_dir.display()),
        format!("{} alloc none rw,bind,create=dir", dirs.shared_alloc_dir.display()),
        format!("{} secrets none rw,bind,create=dir", dirs.secrets_dir.display()),
    ];

    mount_entries.extend(spec.mounts.iter().map(format_task_mount));
    mount_entries.extend(spec.devices.iter().map(format_task_device));

    for raw in &spec.driver.volumes {
        let volume: Volume = raw.parse()?;
        let source = volume.resolve_source(&dirs.dir, volumes_enabled)?;
        tracing::debug!(volume = %raw, source = %source.display(), "volume resolved");
        mount_entries.push(volume.mount_entry(&source));
    }

    let device_allows = spec
        .devices
        .iter()
        .map(|d| HostDevice::from_path(&d.host_path, &d.permissions).map(|hd| hd.cgroup_rule()))
        .collect::<Result<Vec<_>>>()?;

    Ok(MountPlan {
        mount_entries,
        device_allows,
    })
}

fn format_task_mount(mount: &MountConfig) -> String {
    format_mount(&mount.host_path, &mount.task_path, mount.readonly)
}

fn format_task_device(device: &DeviceConfig) -> String {
    format_mount(
        &device.host_path,
        &device.task_path,
        !device.permissions.contains('w'),
    )
}

/// Renders a bind mount entry; the target is made relative to the rootfs.
fn format_mount(host_path: &Path, task_path: &Path, readonly: bool) -> String {
    let kind = match std::fs::metadata(host_path) {
        Ok(meta) if !meta.is_dir() => "file",
        Ok(_) => "dir",
        Err(e) => {
            tracing::warn!(
                path = %host_path.display(),
                error = %e,
                "failed to find mount host path type, defaulting to dir type"
            );
            "dir"
        }
    };
    let perm = if readonly { "ro" } else { "rw" };
    let target = task_path.to_string_lossy();
    format!(
        "{} {} none {perm},bind,create={kind}",
        host_path.display(),
        target.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use lxtask_common::spec::{LxcTaskConfig, Resources, TaskDir};
    use lxtask_common::types::TaskId;

    use super::*;

    fn spec_in(alloc_dir: &Path) -> TaskSpec {
        TaskSpec {
            id: TaskId::new("t1"),
            name: "web".into(),
            alloc_id: "123".into(),
            command: vec![],
            env: BTreeMap::new(),
            resources: Resources::default(),
            mounts: vec![],
            devices: vec![],
            task_dir: TaskDir {
                dir: alloc_dir.to_path_buf(),
                local_dir: alloc_dir.join("local"),
                shared_alloc_dir: alloc_dir.join("alloc"),
                secrets_dir: alloc_dir.join("secrets"),
            },
            driver: LxcTaskConfig::default(),
        }
    }

    #[test]
    fn fixed_mounts_come_first() {
        let plan = plan(&spec_in(Path::new("/alloc/123")), false).unwrap();
        assert_eq!(
            plan.mount_entries,
            vec![
                "/alloc/123/local local none rw,bind,create=dir",
                "/alloc/123/alloc alloc none rw,bind,create=dir",
                "/alloc/123/secrets secrets none rw,bind,create=dir",
            ]
        );
        assert!(plan.device_allows.is_empty());
    }

    #[test]
    fn relative_volume_with_volumes_enabled() {
        let mut spec = spec_in(Path::new("/alloc/123"));
        spec.driver.volumes = vec!["data:/app/data:rw:dir".into()];
        let plan = plan(&spec, true).unwrap();
        assert_eq!(
            plan.mount_entries.last().unwrap(),
            "/alloc/123/data app/data none rw,bind,create=dir"
        );
    }

    #[test]
    fn ordering_is_fixed_then_mounts_then_devices_then_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.txt");
        std::fs::write(&file, "x").unwrap();

        let mut spec = spec_in(dir.path());
        spec.mounts = vec![
            MountConfig {
                host_path: dir.path().to_path_buf(),
                task_path: PathBuf::from("/srv/share"),
                readonly: true,
            },
            MountConfig {
                host_path: file.clone(),
                task_path: PathBuf::from("/etc/app.conf"),
                readonly: false,
            },
        ];
        spec.devices = vec![DeviceConfig {
            host_path: PathBuf::from("/dev/null"),
            task_path: PathBuf::from("/dev/null"),
            permissions: "rw".into(),
        }];
        spec.driver.volumes = vec!["data:data:ro:dir".into()];

        let plan = plan(&spec, false).unwrap();
        let entries = &plan.mount_entries;
        assert_eq!(entries.len(), 7);
        assert_eq!(
            entries[3],
            format!("{} srv/share none ro,bind,create=dir", dir.path().display())
        );
        assert_eq!(
            entries[4],
            format!("{} etc/app.conf none rw,bind,create=file", file.display())
        );
        assert_eq!(entries[5], "/dev/null dev/null none rw,bind,create=file");
        assert_eq!(
            entries[6],
            format!("{}/data data none ro,bind,create=dir", dir.path().display())
        );
        assert_eq!(plan.device_allows, vec!["c 1:3 rw"]);
    }

    #[test]
    fn read_only_device_without_write_permission() {
        let mut spec = spec_in(Path::new("/alloc/1"));
        spec.devices = vec![DeviceConfig {
            host_path: PathBuf::from("/dev/zero"),
            task_path: PathBuf::from("/dev/zero"),
            permissions: "r".into(),
        }];
        let plan = plan(&spec, false).unwrap();
        assert_eq!(plan.mount_entries[3], "/dev/zero dev/zero none ro,bind,create=file");
    }

    #[test]
    fn unresolvable_device_fails_the_plan() {
        let mut spec = spec_in(Path::new("/alloc/1"));
        spec.devices = vec![DeviceConfig {
            host_path: PathBuf::from("/dev/lxtask-missing"),
            task_path: PathBuf::from("/dev/x"),
            permissions: "rwm".into(),
        }];
        assert!(plan(&spec, true).is_err());
    }

    #[test]
    fn absolute_volume_with_volumes_disabled_fails() {
        let mut spec = spec_in(Path::new("/alloc/1"));
        spec.driver.volumes = vec!["/srv:srv:rw:dir".into()];
        assert!(plan(&spec, false).unwrap_err().is_validation());
    }

    #[test]
    fn missing_mount_host_path_defaults_to_dir() {
        let mut spec = spec_in(Path::new("/alloc/1"));
        spec.mounts = vec![MountConfig {
            host_path: PathBuf::from("/lxtask/does/not/exist"),
            task_path: PathBuf::from("opt"),
            readonly: false,
        }];
        let plan = plan(&spec, false).unwrap();
        assert_eq!(plan.mount_entries[3], "/lxtask/does/not/exist opt none rw,bind,create=dir");
    }
}
