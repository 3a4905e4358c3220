//! CRD admission: reference resolution and structural validation
//!
//! Every policy CRD is validated before its effects are allowed to touch
//! the graph: structural rules first, then every named reference resolved
//! against the object cache's mirror of the remote inventory. On failure the
//! CRD is Rejected with a descriptive error and has no effect; whatever
//! configuration was previously Accepted remains active.
//!
//! Validation re-runs on every update to the CRD. A referenced object
//! disappearing out-of-band does not retroactively invalidate an Accepted
//! CRD; only the next edit re-triggers validation.

use tracing::warn;

use crate::cache::{ObjectCache, ObjectKind};
use crate::crd::{HostOverrideSpec, InfraSettingSpec, PathOverrideSpec, SsoPolicySpec};

/// Outcome of validating one policy CRD
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// All references resolved; effects may be applied to the graph
    Accepted,
    /// Validation failed; the CRD must have no effect
    Rejected(String),
}

impl Admission {
    /// True when Accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// The rejection reason, if any
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Accepted => None,
            Self::Rejected(err) => Some(err),
        }
    }
}

/// Resolves CRD references against the object cache
pub struct Validator<'a> {
    cache: &'a ObjectCache,
    tenant: &'a str,
}

impl<'a> Validator<'a> {
    /// A validator reading the given cache under the given tenant
    pub fn new(cache: &'a ObjectCache, tenant: &'a str) -> Self {
        Self { cache, tenant }
    }

    /// Validate a HostOverride
    ///
    /// `duplicate_owner` names another CRD already claiming the same FQDN,
    /// which rejects this one: two overrides fighting over one host would
    /// make the applied configuration order-dependent.
    pub fn validate_host_override(
        &self,
        spec: &HostOverrideSpec,
        duplicate_owner: Option<&str>,
    ) -> Admission {
        if let Some(owner) = duplicate_owner {
            return self.reject(format!("duplicate fqdn {} found in {}", spec.fqdn, owner));
        }
        if let Err(err) = spec.validate() {
            return self.reject(err.to_string());
        }

        let mut refs: Vec<(ObjectKind, &str)> = Vec::new();
        if let Some(tls) = &spec.tls {
            if let Some(cert) = &tls.ssl_key_certificate {
                refs.push((ObjectKind::SslKeyCert, cert.as_str()));
            }
            if let Some(profile) = &tls.ssl_profile {
                refs.push((ObjectKind::SslProfile, profile.as_str()));
            }
        }
        for (kind, field) in [
            (ObjectKind::WafPolicy, &spec.waf_policy),
            (ObjectKind::ApplicationProfile, &spec.application_profile),
            (ObjectKind::AnalyticsProfile, &spec.analytics_profile),
            (ObjectKind::ErrorPageProfile, &spec.error_page_profile),
        ] {
            if let Some(name) = field {
                refs.push((kind, name.as_str()));
            }
        }
        for script in &spec.datascripts {
            refs.push((ObjectKind::Datascript, script.as_str()));
        }
        for policy in &spec.http_policy_sets {
            refs.push((ObjectKind::HttpPolicySet, policy.as_str()));
        }
        self.check_refs(&refs)
    }

    /// Validate a PathOverride
    pub fn validate_path_override(&self, spec: &PathOverrideSpec) -> Admission {
        if let Err(err) = spec.validate() {
            return self.reject(err.to_string());
        }
        let mut refs: Vec<(ObjectKind, &str)> = Vec::new();
        for rule in &spec.paths {
            for monitor in &rule.health_monitors {
                refs.push((ObjectKind::HealthMonitor, monitor.as_str()));
            }
            if let Some(tls) = &rule.tls {
                if let Some(profile) = &tls.ssl_profile {
                    refs.push((ObjectKind::SslProfile, profile.as_str()));
                }
                if let Some(profile) = &tls.pki_profile {
                    refs.push((ObjectKind::PkiProfile, profile.as_str()));
                }
            }
        }
        self.check_refs(&refs)
    }

    /// Validate an SsoPolicy
    pub fn validate_sso_policy(
        &self,
        spec: &SsoPolicySpec,
        duplicate_owner: Option<&str>,
    ) -> Admission {
        if let Some(owner) = duplicate_owner {
            return self.reject(format!("duplicate fqdn {} found in {}", spec.fqdn, owner));
        }
        if let Err(err) = spec.validate() {
            return self.reject(err.to_string());
        }
        let mut refs: Vec<(ObjectKind, &str)> =
            vec![(ObjectKind::SsoPolicy, spec.sso_policy_ref.as_str())];
        if let Some(oauth) = &spec.oauth {
            refs.push((ObjectKind::AuthProfile, oauth.auth_profile.as_str()));
        }
        if let Some(saml) = &spec.saml {
            if let Some(cert) = &saml.signing_ssl_key_certificate {
                refs.push((ObjectKind::SslKeyCert, cert.as_str()));
            }
        }
        self.check_refs(&refs)
    }

    /// Validate an InfraSetting
    pub fn validate_infra_setting(&self, spec: &InfraSettingSpec) -> Admission {
        let mut refs: Vec<(ObjectKind, &str)> = Vec::new();
        if let Some(seg) = &spec.service_engine_group {
            refs.push((ObjectKind::ServiceEngineGroup, seg.as_str()));
        }
        if let Some(network) = &spec.vip_network {
            refs.push((ObjectKind::Network, network.as_str()));
        }
        self.check_refs(&refs)
    }

    fn check_refs(&self, refs: &[(ObjectKind, &str)]) -> Admission {
        for (kind, name) in refs {
            if name.is_empty() {
                continue;
            }
            if !self.cache.contains(*kind, self.tenant, name) {
                return self.reject(format!(
                    "referenced {} {name} not found on the controller",
                    kind.api_path()
                ));
            }
        }
        Admission::Accepted
    }

    fn reject(&self, err: String) -> Admission {
        warn!(error = %err, "rejecting policy CRD");
        Admission::Rejected(err)
    }
}
