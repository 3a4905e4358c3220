//! PathOverride Custom Resource Definition
//!
//! A PathOverride tunes backend pool behavior for individual paths under one
//! FQDN: load-balancing algorithm, health monitors, and pool-side TLS.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CrdStatus, LbAlgorithm};

/// Pool-side TLS settings for one path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathTls {
    /// SSL profile used when re-encrypting to the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<String>,

    /// PKI profile validating the backend certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pki_profile: Option<String>,
}

/// Backend tuning for one path under the FQDN
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    /// The path this rule applies to, e.g. `/api`
    pub target: String,

    /// Load-balancing algorithm; absent means controller default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lb_algorithm: Option<LbAlgorithm>,

    /// Header to hash on; only meaningful with the consistent-hash algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_key: Option<String>,

    /// Health monitor references attached to the pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_monitors: Vec<String>,

    /// Pool-side TLS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<PathTls>,
}

/// Specification for a PathOverride
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "PathOverride",
    plural = "pathoverrides",
    shortname = "po",
    status = "CrdStatus",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.fqdn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PathOverrideSpec {
    /// The hostname whose paths are tuned
    pub fqdn: String,

    /// Per-path rules; paths not listed keep controller defaults
    pub paths: Vec<PathRule>,
}

impl PathOverrideSpec {
    /// Structural validation that needs no remote state
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.fqdn.is_empty() {
            return Err(crate::Error::validation("fqdn must not be empty"));
        }
        for rule in &self.paths {
            if rule.hash_key.is_some() && rule.lb_algorithm != Some(LbAlgorithm::ConsistentHash) {
                return Err(crate::Error::validation(format!(
                    "hashKey on path {} requires the CONSISTENT_HASH algorithm",
                    rule.target
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_requires_consistent_hash() {
        let spec = PathOverrideSpec {
            fqdn: "foo.com".to_string(),
            paths: vec![PathRule {
                target: "/api".to_string(),
                lb_algorithm: Some(LbAlgorithm::RoundRobin),
                hash_key: Some("x-user".to_string()),
                health_monitors: vec![],
                tls: None,
            }],
        };
        assert!(spec.validate().is_err());

        let spec = PathOverrideSpec {
            fqdn: "foo.com".to_string(),
            paths: vec![PathRule {
                target: "/api".to_string(),
                lb_algorithm: Some(LbAlgorithm::ConsistentHash),
                hash_key: Some("x-user".to_string()),
                health_monitors: vec![],
                tls: None,
            }],
        };
        assert!(spec.validate().is_ok());
    }
}
