//! User-declared volumes and the sandbox-escape guard.

use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use lxtask_common::error::{LxtaskError, Result};

/// A volume declared as `source:target:mode:type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Host source, absolute or relative to the task directory.
    pub source: PathBuf,
    /// Target inside the container.
    pub target: String,
    /// Mount mode, `rw` or `ro`.
    pub mode: String,
    /// Path type created on demand, `dir` or `file`.
    pub kind: String,
}

impl FromStr for Volume {
    type Err = LxtaskError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let [source, target, mode, kind] = parts.as_slice() else {
            return Err(LxtaskError::validation(format!(
                "volume {s:?} must have the form source:target:mode:type"
            )));
        };
        if source.is_empty() || target.is_empty() {
            return Err(LxtaskError::validation(format!(
                "volume {s:?} has an empty source or target"
            )));
        }
        if !matches!(*mode, "rw" | "ro") {
            return Err(LxtaskError::validation(format!(
                "volume {s:?} mode must be rw or ro"
            )));
        }
        if !matches!(*kind, "dir" | "file") {
            return Err(LxtaskError::validation(format!(
                "volume {s:?} type must be dir or file"
            )));
        }
        Ok(Self {
            source: PathBuf::from(source),
            target: (*target).to_owned(),
            mode: (*mode).to_owned(),
            kind: (*kind).to_owned(),
        })
    }
}

impl Volume {
    /// Resolves the host source against `task_dir` and applies volume policy.
    ///
    /// Absolute sources need volume support. Relative sources are joined to
    /// the task directory and, without volume support, must stay inside it.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the policy rejects the source.
    pub fn resolve_source(&self, task_dir: &Path, volumes_enabled: bool) -> Result<PathBuf> {
        if self.source.is_absolute() {
            if !volumes_enabled {
                return Err(LxtaskError::validation(
                    "absolute bind-mount volume in config but volumes are disabled",
                ));
            }
            return Ok(self.source.clone());
        }

        let resolved = normalize(&task_dir.join(&self.source));
        if !volumes_enabled && escapes_sandbox(task_dir, &resolved) {
            return Err(LxtaskError::validation(
                "bind-mount path escapes task directory but volumes are disabled",
            ));
        }
        Ok(resolved)
    }

    /// Renders the LXC mount entry for this volume from a resolved source.
    #[must_use]
    pub fn mount_entry(&self, source: &Path) -> String {
        format!(
            "{} {} none {},bind,create={}",
            source.display(),
            self.target.trim_start_matches('/'),
            self.mode,
            self.kind
        )
    }
}

/// Returns whether `path` lies outside `sandbox` after lexical normalization.
#[must_use]
pub fn escapes_sandbox(sandbox: &Path, path: &Path) -> bool {
    let sandbox = normalize(sandbox);
    let path = normalize(path);
    path.strip_prefix(&sandbox).is_err()
}

/// Lexically normalizes a path: drops `.` and folds `..` into its parent.
///
/// Leading `..` components of a relative path are kept; `..` at the root
/// of an absolute path stays at the root.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    let _ = out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_part_volume() {
        let v: Volume = "data:app/data:rw:dir".parse().unwrap();
        assert_eq!(v.source, PathBuf::from("data"));
        assert_eq!(v.target, "app/data");
        assert_eq!(v.mode, "rw");
        assert_eq!(v.kind, "dir");
    }

    #[test]
    fn malformed_volumes_are_rejected() {
        for raw in ["data:app", "a:b:rw:dir:extra", ":b:rw:dir", "a:b:rx:dir", "a:b:rw:socket"] {
            let err = raw.parse::<Volume>().unwrap_err();
            assert!(err.is_validation(), "{raw}");
        }
    }

    #[test]
    fn relative_source_resolves_inside_task_dir() {
        let v: Volume = "data:/app/data:rw:dir".parse().unwrap();
        let src = v.resolve_source(Path::new("/alloc/123"), false).unwrap();
        assert_eq!(src, PathBuf::from("/alloc/123/data"));
        assert_eq!(v.mount_entry(&src), "/alloc/123/data app/data none rw,bind,create=dir");
    }

    #[test]
    fn relative_source_escaping_task_dir_depends_on_policy() {
        let v: Volume = "../../etc:etc:ro:dir".parse().unwrap();
        let err = v.resolve_source(Path::new("/alloc/123"), false).unwrap_err();
        assert!(err.to_string().contains("escapes task directory"));

        let src = v.resolve_source(Path::new("/alloc/123"), true).unwrap();
        assert_eq!(src, PathBuf::from("/etc"));
    }

    #[test]
    fn inner_parent_components_that_stay_inside_are_accepted() {
        let v: Volume = "local/../data/./x:x:rw:file".parse().unwrap();
        let src = v.resolve_source(Path::new("/alloc/123"), false).unwrap();
        assert_eq!(src, PathBuf::from("/alloc/123/data/x"));
    }

    #[test]
    fn absolute_source_requires_volume_support() {
        let v: Volume = "/srv/data:data:rw:dir".parse().unwrap();
        assert!(v.resolve_source(Path::new("/alloc/123"), false).unwrap_err().is_validation());
        assert_eq!(
            v.resolve_source(Path::new("/alloc/123"), true).unwrap(),
            PathBuf::from("/srv/data")
        );
    }

    #[test]
    fn normalize_folds_parents() {
        assert_eq!(normalize(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn task_dir_itself_does_not_escape() {
        assert!(!escapes_sandbox(Path::new("/alloc/123"), Path::new("/alloc/123")));
        assert!(escapes_sandbox(Path::new("/alloc/123"), Path::new("/alloc/1234")));
    }
}
