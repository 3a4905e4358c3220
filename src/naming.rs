//! Deterministic object naming and content checksums
//!
//! Every object Trellis creates on the remote controller carries a name
//! derived from the cluster name plus the Kubernetes identity of the source
//! object, so the same logical object always yields the same remote name
//! across restarts and full cache rebuilds. Content checksums detect whether
//! a desired object differs from the last-known-applied remote object
//! without a field-by-field comparison.

use sha2::{Digest, Sha256};
use tracing::warn;

/// Remote controllers commonly cap object names at 255 characters
const MAX_OBJECT_NAME_LEN: usize = 255;

/// Content checksum capability required of every graph node type
///
/// The object cache compares desired state against applied state purely by
/// checksum, so all node types must implement this consistently: the
/// checksum covers every attribute that affects remote configuration and
/// nothing else.
pub trait Checksum {
    /// Compute a checksum over all remotely-visible attributes
    fn checksum(&self) -> u32;
}

/// Checksum of a canonical string rendering
///
/// CRC32 is stable across platforms and toolchain versions, which matters
/// because checksums are compared against values recorded on earlier runs.
pub fn checksum_of(s: &str) -> u32 {
    crc32fast::hash(s.as_bytes())
}

/// Deterministic 16-hex-char digest of the input
///
/// Truncated SHA-256 rather than `DefaultHasher`, which is not guaranteed
/// stable across Rust releases.
pub fn digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

/// Generates remote object names scoped to one cluster
///
/// All names start with `{cluster}--` so that objects belonging to this
/// cluster can be recognized in the remote inventory during full sync.
#[derive(Clone, Debug)]
pub struct Namer {
    cluster: String,
    /// When true (EVH mode), child and leaf object names are digest-encoded
    /// instead of spelled out, keeping them within name-length limits for
    /// arbitrarily long host/path combinations.
    encode: bool,
}

impl Namer {
    /// Create a namer for the given cluster
    pub fn new(cluster: impl Into<String>, encode: bool) -> Self {
        Self {
            cluster: cluster.into(),
            encode,
        }
    }

    /// The `{cluster}--` prefix carried by every generated name
    pub fn prefix(&self) -> String {
        format!("{}--", self.cluster)
    }

    /// True if the given remote object name belongs to this cluster
    pub fn owns(&self, name: &str) -> bool {
        name.starts_with(&self.prefix())
    }

    /// Encode a logical name into its remote form
    ///
    /// In EVH mode the logical name is replaced by a digest; otherwise it is
    /// used as-is with a length check.
    pub fn encode(&self, logical: &str) -> String {
        let name = if self.encode {
            format!("{}{}", self.prefix(), digest(logical))
        } else {
            format!("{}{}", self.prefix(), logical)
        };
        if name.len() > MAX_OBJECT_NAME_LEN {
            warn!(name = %name, len = name.len(), "generated object name exceeds remote limit");
        }
        name
    }

    /// Name of a shared parent virtual service for the given shard index
    pub fn shared_vs_name(&self, index: u32, infra_setting: Option<&str>, evh: bool) -> String {
        let marker = if evh { "Shared-L7-EVH" } else { "Shared-L7" };
        match infra_setting {
            Some(setting) => format!("{}{}-{}-{}", self.prefix(), marker, setting, index),
            None => format!("{}{}-{}", self.prefix(), marker, index),
        }
    }

    /// Name of a per-namespace parent virtual service
    pub fn namespace_vs_name(&self, namespace: &str) -> String {
        format!("{}{}-L7", self.prefix(), namespace)
    }

    /// Name of a dedicated (per-hostname) parent virtual service
    pub fn dedicated_vs_name(&self, host: &str) -> String {
        format!("{}{}-L7-dedicated", self.prefix(), host)
    }

    /// Name of the child virtual service for one host
    pub fn child_vs_name(&self, namespace: &str, host: &str) -> String {
        self.encode(&format!("{}-{}", namespace, host))
    }

    /// Name of the pool for one (host, path, service) routing target
    pub fn pool_name(&self, namespace: &str, host: &str, path: &str, service: &str) -> String {
        let path = path.replace('/', "_");
        self.encode(&format!("{}-{}{}-{}", namespace, host, path, service))
    }

    /// Name of the pool group for one (host, path) routing rule
    pub fn pool_group_name(&self, namespace: &str, host: &str, path: &str) -> String {
        let path = path.replace('/', "_");
        self.encode(&format!("{}-{}{}-pg", namespace, host, path))
    }

    /// Name of the HTTP policy set for one host
    pub fn http_policy_name(&self, namespace: &str, host: &str) -> String {
        self.encode(&format!("{}-{}", namespace, host))
    }

    /// Name of the VIP object backing a parent virtual service
    pub fn vsvip_name(&self, parent_vs_name: &str) -> String {
        format!("{}-vsvip", parent_vs_name)
    }

    /// Name of the certificate object backing a TLS secret
    pub fn cert_name(&self, namespace: &str, secret: &str) -> String {
        self.encode(&format!("{}-{}", namespace, secret))
    }
}
