//! Device cgroup access rules.
//!
//! A host device node is resolved to its type and major/minor numbers and
//! encoded as a `devices.allow` rule such as `c 1:3 rwm`.

use std::fmt;
use std::path::Path;

use lxtask_common::error::{LxtaskError, Result};

/// Permissions granted when a device request leaves them empty.
pub const DEFAULT_PERMISSIONS: &str = "rwm";

/// Kind of device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

impl DeviceType {
    const fn as_char(self) -> char {
        match self {
            Self::Char => 'c',
            Self::Block => 'b',
        }
    }
}

/// A resolved host device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    /// Device type.
    pub kind: DeviceType,
    /// Major number.
    pub major: u64,
    /// Minor number.
    pub minor: u64,
    /// Cgroup permission characters.
    pub permissions: String,
}

impl HostDevice {
    /// Resolves the device node at `path`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed permissions and an I/O
    /// error if the path cannot be inspected or is not a device node.
    #[cfg(target_os = "linux")]
    pub fn from_path(path: &Path, permissions: &str) -> Result<Self> {
        use nix::sys::stat::{SFlag, major, minor, stat};

        let permissions = normalize_permissions(permissions)?;
        let st = stat(path).map_err(|e| LxtaskError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::from(e),
        })?;

        let kind = match SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT {
            SFlag::S_IFCHR => DeviceType::Char,
            SFlag::S_IFBLK => DeviceType::Block,
            _ => {
                return Err(LxtaskError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a device node",
                    ),
                });
            }
        };

        Ok(Self {
            kind,
            major: major(st.st_rdev),
            minor: minor(st.st_rdev),
            permissions,
        })
    }

    /// Stub for non-Linux platforms.
    ///
    /// # Errors
    ///
    /// Always returns an error, device nodes require Linux.
    #[cfg(not(target_os = "linux"))]
    pub fn from_path(path: &Path, _permissions: &str) -> Result<Self> {
        Err(LxtaskError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "Linux required for native container operations",
            ),
        })
    }

    /// Returns the `devices.allow` rule for this device.
    #[must_use]
    pub fn cgroup_rule(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HostDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} {}",
            self.kind.as_char(),
            self.major,
            self.minor,
            self.permissions
        )
    }
}

fn normalize_permissions(permissions: &str) -> Result<String> {
    if permissions.is_empty() {
        return Ok(DEFAULT_PERMISSIONS.into());
    }
    if permissions.chars().all(|c| matches!(c, 'r' | 'w' | 'm')) {
        Ok(permissions.into())
    } else {
        Err(LxtaskError::validation(format!(
            "device permissions {permissions:?} may only contain r, w and m"
        )))
    }
}
