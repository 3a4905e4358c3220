//! Deterministic shard assignment
//!
//! Maps a hostname (or namespace) to the parent virtual service that will
//! carry its routes. In shared mode a stable hash buckets hostnames onto a
//! bounded, power-of-two number of shared virtual services; per-namespace
//! and dedicated modes are identity mappings exposed through the same
//! interface so the rest of the system is shard-scheme-agnostic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::naming::Namer;

/// Identifies one parent virtual service slot
///
/// The key doubles as the parent's remote object name, which keeps the
/// graph, cache, and REST layers agreeing on identity for free.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(
    /// The key string, equal to the parent virtual service's remote name
    pub String,
);

impl ShardKey {
    /// The shard key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Named shard-count presets, mirroring the sizes operators configure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardSize {
    /// One shared virtual service
    #[default]
    Small,
    /// Four shared virtual services
    Medium,
    /// Eight shared virtual services
    Large,
}

impl ShardSize {
    /// The number of shard slots this size provides (always a power of two)
    pub fn count(self) -> u32 {
        match self {
            Self::Small => 1,
            Self::Medium => 4,
            Self::Large => 8,
        }
    }
}

impl std::str::FromStr for ShardSize {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SMALL" => Ok(Self::Small),
            "MEDIUM" => Ok(Self::Medium),
            "LARGE" => Ok(Self::Large),
            _ => Err(crate::Error::validation(format!(
                "invalid shard size: {s}, expected one of: SMALL, MEDIUM, LARGE"
            ))),
        }
    }
}

/// How hostnames are distributed across parent virtual services
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardScheme {
    /// Hostnames hash onto `count` shared virtual services
    Shared {
        /// Number of shard slots; must be a power of two
        count: u32,
    },
    /// Every namespace gets its own parent virtual service
    Namespace,
    /// Every hostname gets its own dedicated virtual service
    Dedicated,
}

impl ShardScheme {
    /// Stable bucket hash: CRC32 of the key masked to the slot count
    ///
    /// `count` must be a power of two. No randomness and no reliance on
    /// iteration order, so the same hostname maps to the same slot across
    /// process restarts and full cache rebuilds.
    pub fn bucket(key: &str, count: u32) -> u32 {
        debug_assert!(count.is_power_of_two());
        crc32fast::hash(key.as_bytes()) & (count - 1)
    }

    /// The shard key owning the given hostname
    ///
    /// `infra_setting` narrows shared-mode slots to the pool of virtual
    /// services dedicated to that infra setting.
    pub fn shard_key(
        &self,
        namer: &Namer,
        host: &str,
        namespace: &str,
        infra_setting: Option<&str>,
        evh: bool,
    ) -> ShardKey {
        match self {
            Self::Shared { count } => {
                let index = Self::bucket(host, *count);
                ShardKey(namer.shared_vs_name(index, infra_setting, evh))
            }
            Self::Namespace => ShardKey(namer.namespace_vs_name(namespace)),
            Self::Dedicated => ShardKey(namer.dedicated_vs_name(host)),
        }
    }

    /// True when sharding is disabled and parents are per-hostname
    pub fn is_dedicated(&self) -> bool {
        matches!(self, Self::Dedicated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namer() -> Namer {
        Namer::new("cluster", false)
    }

    #[test]
    fn bucket_is_deterministic_across_calls() {
        for host in ["foo.com", "bar.example.org", "a.b.c.d.e"] {
            for count in [1u32, 4, 8] {
                let first = ShardScheme::bucket(host, count);
                let second = ShardScheme::bucket(host, count);
                assert_eq!(first, second);
                assert!(first < count);
            }
        }
    }

    #[test]
    fn single_shard_collides_everything() {
        let scheme = ShardScheme::Shared { count: 1 };
        let a = scheme.shard_key(&namer(), "foo.com", "default", None, false);
        let b = scheme.shard_key(&namer(), "bar.com", "default", None, false);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "cluster--Shared-L7-0");
    }

    #[test]
    fn eight_shards_collide_and_separate_deterministically() {
        // Fixed inputs, fixed buckets: foo.com and bar.com collide under
        // CRC32 & 7, baz.com does not
        assert_eq!(ShardScheme::bucket("foo.com", 8), 3);
        assert_eq!(ShardScheme::bucket("bar.com", 8), 3);
        assert_eq!(ShardScheme::bucket("baz.com", 8), 2);

        let scheme = ShardScheme::Shared { count: 8 };
        let foo = scheme.shard_key(&namer(), "foo.com", "default", None, false);
        let bar = scheme.shard_key(&namer(), "bar.com", "default", None, false);
        let baz = scheme.shard_key(&namer(), "baz.com", "default", None, false);
        assert_eq!(foo, bar);
        assert_ne!(foo, baz);
    }

    #[test]
    fn namespace_and_dedicated_modes_are_identity_mappings() {
        let ns = ShardScheme::Namespace.shard_key(&namer(), "foo.com", "team-a", None, false);
        assert_eq!(ns.as_str(), "cluster--team-a-L7");

        let dedicated = ShardScheme::Dedicated.shard_key(&namer(), "foo.com", "team-a", None, false);
        assert_eq!(dedicated.as_str(), "cluster--foo.com-L7-dedicated");
    }

    #[test]
    fn infra_setting_scopes_the_shared_pool() {
        let scheme = ShardScheme::Shared { count: 4 };
        let plain = scheme.shard_key(&namer(), "foo.com", "default", None, false);
        let scoped = scheme.shard_key(&namer(), "foo.com", "default", Some("edge"), false);
        assert_ne!(plain, scoped);
        assert!(scoped.as_str().contains("edge"));
    }

    #[test]
    fn shard_size_presets() {
        assert_eq!(ShardSize::Small.count(), 1);
        assert_eq!(ShardSize::Medium.count(), 4);
        assert_eq!(ShardSize::Large.count(), 8);
        assert_eq!("large".parse::<ShardSize>().unwrap(), ShardSize::Large);
        assert!("huge".parse::<ShardSize>().is_err());
    }
}
