//! Network attachment directives.
//!
//! LXC renamed its network keys in 2.1 (`lxc.network.*` became
//! `lxc.net.0.*`). The schema is chosen once from the installed runtime's
//! version and reused for every container.

use lxtask_common::constants::LXC_BRIDGE;
use lxtask_common::spec::NetworkMode;

/// Generation of the LXC network configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSchema {
    /// LXC 2.1 and later: indexed `lxc.net.0.*` keys.
    Indexed,
    /// LXC before 2.1: `lxc.network.*` keys.
    Legacy,
}

impl NetworkSchema {
    /// Picks the schema matching a runtime version string.
    ///
    /// Unparseable or empty versions are treated as current releases.
    #[must_use]
    pub fn for_version(version: &str) -> Self {
        match RuntimeVersion::parse(version) {
            Some(v) if !v.at_least(2, 1, 0) => Self::Legacy,
            _ => Self::Indexed,
        }
    }

    /// Returns the key prefix of this schema.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Indexed => "lxc.net.0.",
            Self::Legacy => "lxc.network.",
        }
    }
}

/// Returns the ordered configuration items attaching a container in `mode`.
///
/// ```
/// use lxtask_common::spec::NetworkMode;
/// use lxtask_core::namespace::network::{NetworkSchema, network_directives};
///
/// let items = network_directives(NetworkMode::Host, NetworkSchema::Indexed);
/// assert_eq!(items, vec![("lxc.net.0.type".to_string(), "none".to_string())]);
/// ```
#[must_use]
pub fn network_directives(mode: NetworkMode, schema: NetworkSchema) -> Vec<(String, String)> {
    let key = |suffix: &str| format!("{}{suffix}", schema.prefix());
    match mode {
        NetworkMode::Host => vec![(key("type"), "none".into())],
        NetworkMode::Bridge => vec![
            (key("type"), "veth".into()),
            (key("link"), LXC_BRIDGE.into()),
            (key("flags"), "up".into()),
        ],
    }
}

/// Lenient `major.minor.patch` version, ignoring distribution suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
}

impl RuntimeVersion {
    /// Parses strings such as `4.0.12`, `5.0.0~git2209-g5a7b9ce67` or `3.0`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.').map(leading_number);
        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Returns whether this version is at least `major.minor.patch`.
    #[must_use]
    pub fn at_least(self, major: u32, minor: u32, patch: u32) -> bool {
        self >= Self {
            major,
            minor,
            patch,
        }
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_mode_attaches_veth_to_lxc_bridge() {
        let items = network_directives(NetworkMode::Bridge, NetworkSchema::Indexed);
        assert_eq!(
            items,
            vec![
                ("lxc.net.0.type".into(), "veth".into()),
                ("lxc.net.0.link".into(), "lxcbr0".into()),
                ("lxc.net.0.flags".into(), "up".into()),
            ]
        );
    }

    #[test]
    fn old_runtimes_use_legacy_prefix() {
        assert_eq!(NetworkSchema::for_version("2.0.8"), NetworkSchema::Legacy);
        assert_eq!(NetworkSchema::for_version("1.1.5"), NetworkSchema::Legacy);
        let items = network_directives(NetworkMode::Host, NetworkSchema::Legacy);
        assert_eq!(items[0].0, "lxc.network.type");
    }

    #[test]
    fn current_runtimes_use_indexed_prefix() {
        assert_eq!(NetworkSchema::for_version("2.1.0"), NetworkSchema::Indexed);
        assert_eq!(NetworkSchema::for_version("4.0.12"), NetworkSchema::Indexed);
        assert_eq!(
            NetworkSchema::for_version("5.0.0~git2209-g5a7b9ce67"),
            NetworkSchema::Indexed
        );
        assert_eq!(NetworkSchema::for_version(""), NetworkSchema::Indexed);
    }

    #[test]
    fn version_parse_tolerates_suffixes() {
        let v = RuntimeVersion::parse("3.0.3-0ubuntu1").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (3, 0, 3));
        assert!(RuntimeVersion::parse("garbage").is_none());
    }
}
