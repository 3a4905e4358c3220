//! InfraSetting Custom Resource Definition
//!
//! An InfraSetting scopes a group of ingresses to their own pool of shared
//! virtual services with distinct infrastructure: a service-engine group, a
//! VIP network, and optionally a shard size override. Cluster-scoped, since
//! infrastructure is not a per-namespace concern.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CrdStatus;
use crate::shard::ShardSize;

/// Specification for an InfraSetting
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "InfraSetting",
    plural = "infrasettings",
    shortname = "is",
    status = "CrdStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfraSettingSpec {
    /// Namespaces whose ingresses are scoped to this setting
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    /// Service-engine group placing virtual services on specific engines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_engine_group: Option<String>,

    /// Network from which VIPs are allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip_network: Option<String>,

    /// Shard size for virtual services scoped to this setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_size: Option<ShardSize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_size_override_round_trips() {
        let spec = InfraSettingSpec {
            namespaces: vec!["team-a".to_string()],
            service_engine_group: Some("edge-seg".to_string()),
            vip_network: Some("vip-net-1".to_string()),
            shard_size: Some(ShardSize::Large),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["shardSize"], "LARGE");
        let back: InfraSettingSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
