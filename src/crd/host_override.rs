//! HostOverride Custom Resource Definition
//!
//! A HostOverride attaches host-level load-balancer policy to one FQDN:
//! profile references, TLS settings, listener ports, alias hostnames, and an
//! enable switch for the whole virtual host. Its effects reach the graph
//! only while the CRD is Accepted.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{CrdStatus, ListenerSpec};

/// TLS overrides for one virtual host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsOverride {
    /// Name of a certificate object already present on the remote controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_key_certificate: Option<String>,

    /// SSL profile to apply to the virtual host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_profile: Option<String>,
}

/// Specification for a HostOverride
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "HostOverride",
    plural = "hostoverrides",
    shortname = "ho",
    status = "CrdStatus",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.fqdn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostOverrideSpec {
    /// The hostname this override applies to
    pub fqdn: String,

    /// Additional hostnames served by the same virtual host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,

    /// Disable the virtual host without removing its routes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_virtual_host: Option<bool>,

    /// TLS settings for the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOverride>,

    /// WAF policy reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waf_policy: Option<String>,

    /// Application profile reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_profile: Option<String>,

    /// Analytics profile reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics_profile: Option<String>,

    /// Error-page profile reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_page_profile: Option<String>,

    /// Datascript references, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datascripts: Vec<String>,

    /// HTTP policy set references, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_policy_sets: Vec<String>,

    /// Listener ports for the parent virtual service serving this host
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerSpec>,
}

impl HostOverrideSpec {
    /// Structural validation that needs no remote state
    ///
    /// Reference existence is checked separately by the admission resolver;
    /// this only enforces rules internal to the spec.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.fqdn.is_empty() {
            return Err(crate::Error::validation("fqdn must not be empty"));
        }
        let mut seen = std::collections::HashSet::new();
        for listener in &self.listeners {
            if !seen.insert(listener.port) {
                return Err(crate::Error::validation(format!(
                    "duplicate listener port {} in host override for {}",
                    listener.port, self.fqdn
                )));
            }
        }
        Ok(())
    }
}
