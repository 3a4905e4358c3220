//! SsoPolicy Custom Resource Definition
//!
//! An SsoPolicy attaches single-sign-on configuration to one FQDN, either
//! SAML service-provider settings or OAuth settings. The two are mutually
//! exclusive on one policy.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CrdStatus;

/// How the assertion consumer service endpoint is selected
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcsType {
    /// Use the ACS URL advertised in metadata
    #[default]
    Url,
    /// Select the ACS endpoint by index
    Index,
}

/// SAML service-provider configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamlConfig {
    /// Certificate used to sign SAML requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_ssl_key_certificate: Option<String>,

    /// Service-provider entity ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// How the assertion consumer service endpoint is selected
    #[serde(default)]
    pub acs_type: AcsType,

    /// ACS endpoint index; only meaningful when `acsType` is `index`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acs_index: Option<u32>,
}

/// OAuth configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OauthConfig {
    /// Auth profile holding the authorization-server settings
    pub auth_profile: String,

    /// OAuth scopes requested at authorization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Specification for an SsoPolicy
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "SsoPolicy",
    plural = "ssopolicies",
    shortname = "sso",
    status = "CrdStatus",
    namespaced,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.fqdn"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SsoPolicySpec {
    /// The hostname this policy applies to
    pub fqdn: String,

    /// SSO policy object on the remote controller carrying session settings
    pub sso_policy_ref: String,

    /// SAML service-provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saml: Option<SamlConfig>,

    /// OAuth configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OauthConfig>,
}

impl SsoPolicySpec {
    /// Structural validation that needs no remote state
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.fqdn.is_empty() {
            return Err(crate::Error::validation("fqdn must not be empty"));
        }
        if self.saml.is_some() && self.oauth.is_some() {
            return Err(crate::Error::validation(
                "saml and oauth configuration are mutually exclusive on one SSO policy",
            ));
        }
        if self.saml.is_none() && self.oauth.is_none() {
            return Err(crate::Error::validation(
                "one of saml or oauth configuration must be specified",
            ));
        }
        if let Some(saml) = &self.saml {
            if saml.acs_index.is_some() && saml.acs_type != AcsType::Index {
                return Err(crate::Error::validation(
                    "acsIndex is only meaningful when acsType is index",
                ));
            }
        }
        Ok(())
    }
}
