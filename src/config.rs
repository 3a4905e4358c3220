//! Controller configuration
//!
//! Parsed from CLI flags with environment-variable fallbacks, so the same
//! binary configures cleanly from a Deployment manifest or a shell.

use clap::Parser;

use crate::naming::Namer;
use crate::shard::{ShardScheme, ShardSize};
use crate::{DEFAULT_FULL_SYNC_SECS, DEFAULT_TENANT, DEFAULT_WORKERS};

/// Configuration for the Trellis controller
#[derive(Parser, Clone, Debug)]
pub struct ControllerConfig {
    /// Name of this Kubernetes cluster; prefixes every generated object name
    #[arg(long, env = "CLUSTER_NAME")]
    pub cluster_name: String,

    /// Base URL of the remote load-balancer controller API
    #[arg(long, env = "CONTROLLER_URL")]
    pub controller_url: String,

    /// Username for the remote controller API
    #[arg(long, env = "CONTROLLER_USERNAME", default_value = "admin")]
    pub controller_username: String,

    /// Password for the remote controller API
    #[arg(long, env = "CONTROLLER_PASSWORD", default_value = "", hide_env_values = true)]
    pub controller_password: String,

    /// Tenant all generated objects are created under
    #[arg(long, env = "TENANT", default_value = DEFAULT_TENANT)]
    pub tenant: String,

    /// Shared virtual-service shard size: SMALL, MEDIUM, or LARGE
    #[arg(long, env = "SHARD_VS_SIZE", default_value = "SMALL")]
    pub shard_size: String,

    /// One parent virtual service per namespace instead of shared shards
    #[arg(long, env = "NAMESPACE_SHARDING")]
    pub namespace_sharding: bool,

    /// One dedicated virtual service per hostname instead of shared shards
    #[arg(long, env = "DEDICATED_VS")]
    pub dedicated: bool,

    /// Enhanced-virtual-hosting child nodes instead of SNI children
    #[arg(long, env = "ENABLE_EVH")]
    pub evh: bool,

    /// Seconds between full-sync inventory pulls healing cache drift
    #[arg(long, env = "FULL_SYNC_INTERVAL", default_value_t = DEFAULT_FULL_SYNC_SECS)]
    pub full_sync_secs: u64,

    /// Number of reconciliation workers (power of two)
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,
}

impl ControllerConfig {
    /// Validate cross-field rules before anything is wired up
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cluster_name.is_empty() {
            return Err(crate::Error::validation("cluster name must not be empty"));
        }
        if self.namespace_sharding && self.dedicated {
            return Err(crate::Error::validation(
                "namespace sharding and dedicated virtual services are mutually exclusive",
            ));
        }
        if !self.workers.is_power_of_two() {
            return Err(crate::Error::validation(format!(
                "workers must be a power of two, got {}",
                self.workers
            )));
        }
        self.shard_size.parse::<ShardSize>()?;
        Ok(())
    }

    /// The namer scoped to this cluster
    pub fn namer(&self) -> Namer {
        Namer::new(self.cluster_name.clone(), self.evh)
    }

    /// The shard scheme this deployment runs under
    ///
    /// Call after [`Self::validate`]; an unparseable shard size falls back
    /// to one shared shard.
    pub fn shard_scheme(&self) -> ShardScheme {
        if self.dedicated {
            return ShardScheme::Dedicated;
        }
        if self.namespace_sharding {
            return ShardScheme::Namespace;
        }
        let size = self.shard_size.parse::<ShardSize>().unwrap_or_default();
        ShardScheme::Shared { count: size.count() }
    }
}

#[cfg(test)]
impl ControllerConfig {
    /// A minimal valid configuration for tests
    pub(crate) fn for_tests(cluster: &str) -> Self {
        Self {
            cluster_name: cluster.to_string(),
            controller_url: "https://controller.example.com".to_string(),
            controller_username: "admin".to_string(),
            controller_password: String::new(),
            tenant: DEFAULT_TENANT.to_string(),
            shard_size: "SMALL".to_string(),
            namespace_sharding: false,
            dedicated: false,
            evh: false,
            full_sync_secs: DEFAULT_FULL_SYNC_SECS,
            workers: DEFAULT_WORKERS,
        }
    }
}
