//! Graph node types for desired virtual-service state
//!
//! One parent virtual-service node per shard, each owning child virtual-host
//! nodes (SNI or EVH), which in turn own pools, pool groups, and HTTP policy
//! sets. Every node type implements [`Checksum`] over exactly the attributes
//! that affect remote configuration, which is what the sync engine diffs
//! against the object cache.

use std::collections::BTreeMap;
use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::crd::{LbAlgorithm, ListenerSpec, OauthConfig, SamlConfig};
use crate::naming::{checksum_of, Checksum};

/// Listener ports a parent virtual service carries when no override names any
pub const DEFAULT_LISTENERS: [ListenerSpec; 2] = [
    ListenerSpec { port: 80, enable_ssl: false },
    ListenerSpec { port: 443, enable_ssl: true },
];

/// One backend endpoint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Endpoint IP address
    pub ip: String,
    /// Endpoint port
    pub port: u16,
}

/// One backend pool
///
/// Servers are replaced wholesale on every endpoint-source update; pool PUTs
/// are idempotent, so churn is acceptable in exchange for consistency.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolNode {
    /// Encoded remote object name
    pub name: String,
    /// Tenant owning the remote object
    pub tenant: String,
    /// Load-balancing algorithm; absent means controller default
    pub lb_algorithm: Option<LbAlgorithm>,
    /// Hash key for the consistent-hash algorithm
    pub hash_key: Option<String>,
    /// Health monitor references
    pub health_monitors: Vec<String>,
    /// SSL profile for backend re-encryption
    pub ssl_profile: Option<String>,
    /// PKI profile validating backend certificates
    pub pki_profile: Option<String>,
    /// Ordered backend endpoints
    pub servers: Vec<Server>,
}

impl PoolNode {
    /// A pool with the given name and servers, everything else defaulted
    pub fn new(name: impl Into<String>, tenant: impl Into<String>, servers: Vec<Server>) -> Self {
        Self {
            name: name.into(),
            tenant: tenant.into(),
            lb_algorithm: None,
            hash_key: None,
            health_monitors: vec![],
            ssl_profile: None,
            pki_profile: None,
            servers,
        }
    }
}

impl Checksum for PoolNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(s, "{}|{}|", self.name, self.tenant);
        if let Some(algo) = self.lb_algorithm {
            let _ = write!(s, "{algo}|");
        }
        if let Some(key) = &self.hash_key {
            let _ = write!(s, "{key}|");
        }
        for hm in &self.health_monitors {
            let _ = write!(s, "hm:{hm}|");
        }
        if let Some(p) = &self.ssl_profile {
            let _ = write!(s, "ssl:{p}|");
        }
        if let Some(p) = &self.pki_profile {
            let _ = write!(s, "pki:{p}|");
        }
        for server in &self.servers {
            let _ = write!(s, "{}:{}|", server.ip, server.port);
        }
        checksum_of(&s)
    }
}

/// One (pool, weight) member of a pool group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolGroupMember {
    /// Referenced pool name
    pub pool_name: String,
    /// Traffic ratio weight
    pub weight: u32,
}

/// Ordered weighted collection of pools serving one routing rule
#[derive(Clone, Debug, PartialEq)]
pub struct PoolGroupNode {
    /// Encoded remote object name
    pub name: String,
    /// Tenant owning the remote object
    pub tenant: String,
    /// Ordered members
    pub members: Vec<PoolGroupMember>,
}

impl Checksum for PoolGroupNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(s, "{}|{}|", self.name, self.tenant);
        for m in &self.members {
            let _ = write!(s, "{}@{}|", m.pool_name, m.weight);
        }
        checksum_of(&s)
    }
}

/// How a path match is evaluated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchCriteria {
    /// Path begins with the target
    BeginsWith,
    /// Path equals the target exactly
    Equals,
    /// Target is a regular expression
    Regex,
}

impl MatchCriteria {
    /// Wire representation of the criteria
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeginsWith => "BEGINS_WITH",
            Self::Equals => "EQUALS",
            Self::Regex => "REGEX_MATCH",
        }
    }
}

/// One rule in an HTTP policy set
///
/// A rule either switches matching requests to a pool group or redirects a
/// host to HTTPS; the two are mutually exclusive by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum HttpRule {
    /// Route requests matching a path to a pool group
    Switch {
        /// Path to match
        path: String,
        /// How the path is matched
        criteria: MatchCriteria,
        /// Pool group receiving matching requests
        pool_group: String,
    },
    /// Redirect requests for a host to HTTPS
    Redirect {
        /// Host to match
        host: String,
        /// Redirect target port
        port: u16,
    },
}

/// One HTTP policy set: an ordered list of match/action rules
#[derive(Clone, Debug, PartialEq)]
pub struct HttpPolicyNode {
    /// Encoded remote object name
    pub name: String,
    /// Tenant owning the remote object
    pub tenant: String,
    /// Rules evaluated in order
    pub rules: Vec<HttpRule>,
}

impl Checksum for HttpPolicyNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(s, "{}|{}|", self.name, self.tenant);
        for rule in &self.rules {
            match rule {
                HttpRule::Switch { path, criteria, pool_group } => {
                    let _ = write!(s, "sw:{path}:{}:{pool_group}|", criteria.as_str());
                }
                HttpRule::Redirect { host, port } => {
                    let _ = write!(s, "rd:{host}:{port}|");
                }
            }
        }
        checksum_of(&s)
    }
}

/// A certificate-and-key object derived from a TLS secret
///
/// Created on the remote controller so child virtual services can reference
/// it; lives and dies with the Kubernetes secret backing it.
#[derive(Clone, Debug, PartialEq)]
pub struct TlsCertNode {
    /// Encoded remote object name
    pub name: String,
    /// Tenant owning the remote object
    pub tenant: String,
    /// PEM certificate chain
    pub cert: String,
    /// PEM private key
    pub key: String,
}

impl Checksum for TlsCertNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(s, "{}|{}|{}|{}", self.name, self.tenant, self.cert, self.key);
        checksum_of(&s)
    }
}

/// Child node flavor: SNI children or enhanced virtual hosts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    /// SNI-based child, selected by TLS server name
    Sni,
    /// Enhanced virtual host, selected by host header
    Evh,
}

/// Lifecycle state of a child node
///
/// A child cycles Active → Building → Active as backends flap; it is never
/// deleted while any routing rule references it, regardless of backend
/// health.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChildState {
    /// Routing rule seen, backend not yet resolved
    #[default]
    Building,
    /// Backend resolved, checksum computed
    Active,
}

/// Policy-derived override fields on a child node
///
/// Each field is nullable; absent means "inherit default / none". Only ever
/// populated from Accepted CRDs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostOverrideEffect {
    /// Explicit enable/disable of the virtual host
    pub enabled: Option<bool>,
    /// Additional hostnames served by this child
    pub aliases: Vec<String>,
    /// Certificate object replacing secret-derived certificates
    pub ssl_key_certificate: Option<String>,
    /// SSL profile reference
    pub ssl_profile: Option<String>,
    /// WAF policy reference
    pub waf_policy: Option<String>,
    /// Application profile reference
    pub application_profile: Option<String>,
    /// Analytics profile reference
    pub analytics_profile: Option<String>,
    /// Error-page profile reference
    pub error_page_profile: Option<String>,
    /// Datascript references
    pub datascripts: Vec<String>,
    /// Extra HTTP policy set references
    pub http_policy_sets: Vec<String>,
    /// Listener ports for the owning parent
    pub listeners: Vec<ListenerSpec>,
    /// SSO configuration
    pub sso: Option<SsoEffect>,
}

impl HostOverrideEffect {
    fn checksum_fragment(&self) -> String {
        let mut s = String::new();
        if let Some(e) = self.enabled {
            let _ = write!(s, "en:{e}|");
        }
        for a in &self.aliases {
            let _ = write!(s, "al:{a}|");
        }
        for field in [
            &self.ssl_key_certificate,
            &self.ssl_profile,
            &self.waf_policy,
            &self.application_profile,
            &self.analytics_profile,
            &self.error_page_profile,
        ]
        .into_iter()
        .flatten()
        {
            let _ = write!(s, "{field}|");
        }
        for d in &self.datascripts {
            let _ = write!(s, "ds:{d}|");
        }
        for p in &self.http_policy_sets {
            let _ = write!(s, "hps:{p}|");
        }
        for l in &self.listeners {
            let _ = write!(s, "l:{}:{}|", l.port, l.enable_ssl);
        }
        if let Some(sso) = &self.sso {
            let _ = write!(s, "sso:{}|", sso.checksum_fragment());
        }
        s
    }
}

/// SSO configuration applied to a child node
#[derive(Clone, Debug, PartialEq)]
pub struct SsoEffect {
    /// SSO policy object reference
    pub policy_ref: String,
    /// SAML service-provider settings
    pub saml: Option<SamlConfig>,
    /// OAuth settings
    pub oauth: Option<OauthConfig>,
}

impl SsoEffect {
    fn checksum_fragment(&self) -> String {
        let mut s = self.policy_ref.clone();
        if let Some(saml) = &self.saml {
            let _ = write!(
                s,
                "|saml:{}:{:?}:{:?}",
                saml.signing_ssl_key_certificate.as_deref().unwrap_or(""),
                saml.acs_type,
                saml.acs_index
            );
        }
        if let Some(oauth) = &self.oauth {
            let _ = write!(s, "|oauth:{}:{}", oauth.auth_profile, oauth.scopes.join(","));
        }
        s
    }
}

/// One (host, path-set) unit of routing: an SNI or EVH child virtual service
#[derive(Clone, Debug, PartialEq)]
pub struct ChildVsNode {
    /// Encoded remote object name
    pub name: String,
    /// SNI or EVH flavor
    pub kind: ChildKind,
    /// Primary hostname
    pub host: String,
    /// Namespace the routing rules came from
    pub namespace: String,
    /// Lifecycle state
    pub state: ChildState,
    /// Certificate objects derived from TLS secrets
    pub certs: Vec<TlsCertNode>,
    /// Backend pools owned by this child
    pub pools: Vec<PoolNode>,
    /// Pool groups owned by this child
    pub pool_groups: Vec<PoolGroupNode>,
    /// HTTP policy sets owned by this child
    pub http_policies: Vec<HttpPolicyNode>,
    /// Policy-derived overrides, empty unless an Accepted CRD names this host
    pub overrides: HostOverrideEffect,
}

impl ChildVsNode {
    /// True unless an Accepted override disabled the virtual host
    pub fn enabled(&self) -> bool {
        self.overrides.enabled.unwrap_or(true)
    }

    /// True if this child terminates TLS for its host
    pub fn is_secure(&self) -> bool {
        !self.certs.is_empty() || self.overrides.ssl_key_certificate.is_some()
    }

    /// Names of the certificate objects this child references
    pub fn cert_refs(&self) -> Vec<String> {
        match &self.overrides.ssl_key_certificate {
            // An Accepted override's certificate replaces secret-derived ones
            Some(cert) => vec![cert.clone()],
            None => self.certs.iter().map(|c| c.name.clone()).collect(),
        }
    }

    /// All hostnames served by this child: primary plus Accepted aliases
    pub fn fqdns(&self) -> Vec<String> {
        let mut fqdns = vec![self.host.clone()];
        fqdns.extend(self.overrides.aliases.iter().cloned());
        fqdns
    }
}

impl Checksum for ChildVsNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(
            s,
            "{}|{:?}|{}|{}|{}|",
            self.name,
            self.kind,
            self.host,
            self.namespace,
            self.enabled()
        );
        for c in &self.certs {
            let _ = write!(s, "cert:{}|", c.checksum());
        }
        let _ = write!(s, "{}", self.overrides.checksum_fragment());
        // Owned objects roll up so any nested change surfaces on the child
        for pool in &self.pools {
            let _ = write!(s, "{}|", pool.checksum());
        }
        for pg in &self.pool_groups {
            let _ = write!(s, "{}|", pg.checksum());
        }
        for pol in &self.http_policies {
            let _ = write!(s, "{}|", pol.checksum());
        }
        checksum_of(&s)
    }
}

/// One shared (or dedicated) parent virtual service
#[derive(Clone, Debug, PartialEq)]
pub struct ParentVsNode {
    /// Remote object name; equal to the shard key string
    pub name: String,
    /// Tenant owning the remote object
    pub tenant: String,
    /// Whether the virtual service accepts traffic
    pub enabled: bool,
    /// Listener port/protocol list
    pub listeners: Vec<ListenerSpec>,
    /// Hosts with an active HTTP→HTTPS redirect rule
    pub redirect_hosts: std::collections::BTreeSet<String>,
    /// Name of the VIP object backing this virtual service
    pub vip_ref: String,
    /// Network the VIP is allocated from
    pub vip_network: Option<String>,
    /// Service-engine group placement
    pub se_group: Option<String>,
    /// Application profile reference
    pub application_profile: Option<String>,
    /// Analytics profile reference
    pub analytics_profile: Option<String>,
    /// WAF policy reference
    pub waf_policy: Option<String>,
    /// Error-page profile reference
    pub error_page_profile: Option<String>,
    /// SSL profile reference
    pub ssl_profile: Option<String>,
    /// Datascript references
    pub datascripts: Vec<String>,
    /// HTTP policy set references attached directly to the parent
    pub http_policy_refs: Vec<String>,
    /// Children keyed by primary hostname; ownership is exclusive, and a
    /// child moves between parents only by removal-then-add
    pub children: BTreeMap<String, ChildVsNode>,
}

impl ParentVsNode {
    /// A parent with default listeners and no children
    pub fn new(name: impl Into<String>, tenant: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            vip_ref: format!("{name}-vsvip"),
            name,
            tenant: tenant.into(),
            enabled: true,
            listeners: DEFAULT_LISTENERS.to_vec(),
            redirect_hosts: Default::default(),
            vip_network: None,
            se_group: None,
            application_profile: None,
            analytics_profile: None,
            waf_policy: None,
            error_page_profile: None,
            ssl_profile: None,
            datascripts: vec![],
            http_policy_refs: vec![],
            children: BTreeMap::new(),
        }
    }

    /// True when the parent carries no children and no redirect rules
    ///
    /// An empty parent is a candidate for deletion; whether it is actually
    /// deleted is decided by the sync engine against the cache.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.redirect_hosts.is_empty()
    }

    /// All hostnames served by this parent and its children
    pub fn fqdns(&self) -> Vec<String> {
        let mut fqdns: Vec<String> = Vec::new();
        for child in self.children.values() {
            fqdns.extend(child.fqdns());
        }
        fqdns.sort();
        fqdns.dedup();
        fqdns
    }
}

impl Checksum for ParentVsNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(s, "{}|{}|{}|", self.name, self.tenant, self.enabled);
        for l in &self.listeners {
            let _ = write!(s, "l:{}:{}|", l.port, l.enable_ssl);
        }
        for h in &self.redirect_hosts {
            let _ = write!(s, "rd:{h}|");
        }
        let _ = write!(s, "vip:{}|", self.vip_ref);
        for field in [
            &self.vip_network,
            &self.se_group,
            &self.application_profile,
            &self.analytics_profile,
            &self.waf_policy,
            &self.error_page_profile,
            &self.ssl_profile,
        ]
        .into_iter()
        .flatten()
        {
            let _ = write!(s, "{field}|");
        }
        for d in &self.datascripts {
            let _ = write!(s, "ds:{d}|");
        }
        for p in &self.http_policy_refs {
            let _ = write!(s, "hps:{p}|");
        }
        for child in self.children.values() {
            let _ = write!(s, "{}|", child.checksum());
        }
        checksum_of(&s)
    }
}

/// The VIP object backing a parent virtual service
///
/// Materialized by the sync engine from the parent node; carries the FQDNs
/// of every host the parent serves so the controller can publish DNS.
#[derive(Clone, Debug, PartialEq)]
pub struct VsVipNode {
    /// Remote object name
    pub name: String,
    /// Tenant owning the remote object
    pub tenant: String,
    /// Network the VIP is allocated from
    pub network: Option<String>,
    /// Hostnames published for this VIP
    pub fqdns: Vec<String>,
}

impl Checksum for VsVipNode {
    fn checksum(&self) -> u32 {
        let mut s = String::new();
        let _ = write!(s, "{}|{}|", self.name, self.tenant);
        if let Some(n) = &self.network {
            let _ = write!(s, "net:{n}|");
        }
        for f in &self.fqdns {
            let _ = write!(s, "{f}|");
        }
        checksum_of(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(servers: Vec<Server>) -> PoolNode {
        PoolNode {
            name: "c--default-foo.com_api-backend".to_string(),
            tenant: "admin".to_string(),
            lb_algorithm: None,
            hash_key: None,
            health_monitors: vec!["hm-http".to_string()],
            ssl_profile: None,
            pki_profile: None,
            servers,
        }
    }

    fn server(ip: &str) -> Server {
        Server { ip: ip.to_string(), port: 8080 }
    }

    #[test]
    fn pool_checksum_sees_server_changes() {
        let one = pool(vec![server("10.0.0.1")]);
        let two = pool(vec![server("10.0.0.1"), server("10.0.0.2")]);
        assert_ne!(one.checksum(), two.checksum());

        // Identical content yields identical checksums, every time
        assert_eq!(one.checksum(), pool(vec![server("10.0.0.1")]).checksum());
    }

    #[test]
    fn pool_checksum_sees_every_tuned_field() {
        let base = pool(vec![server("10.0.0.1")]);

        let mut algo = base.clone();
        algo.lb_algorithm = Some(LbAlgorithm::LeastConnections);
        assert_ne!(base.checksum(), algo.checksum());

        let mut monitors = base.clone();
        monitors.health_monitors.push("hm-tcp".to_string());
        assert_ne!(base.checksum(), monitors.checksum());

        let mut tls = base.clone();
        tls.ssl_profile = Some("backend-tls".to_string());
        assert_ne!(base.checksum(), tls.checksum());
    }

    #[test]
    fn http_rules_are_switch_or_redirect_never_both() {
        let policy = HttpPolicyNode {
            name: "c--default-foo.com".to_string(),
            tenant: "admin".to_string(),
            rules: vec![
                HttpRule::Switch {
                    path: "/api".to_string(),
                    criteria: MatchCriteria::BeginsWith,
                    pool_group: "c--default-foo.com_api-pg".to_string(),
                },
                HttpRule::Redirect { host: "foo.com".to_string(), port: 443 },
            ],
        };
        // Reordering rules changes the checksum: rule order is semantic
        let mut reordered = policy.clone();
        reordered.rules.reverse();
        assert_ne!(policy.checksum(), reordered.checksum());
    }

    fn child(host: &str) -> ChildVsNode {
        ChildVsNode {
            name: format!("c--default-{host}"),
            kind: ChildKind::Sni,
            host: host.to_string(),
            namespace: "default".to_string(),
            state: ChildState::Active,
            certs: vec![],
            pools: vec![pool(vec![server("10.0.0.1")])],
            pool_groups: vec![],
            http_policies: vec![],
            overrides: HostOverrideEffect::default(),
        }
    }

    #[test]
    fn child_checksum_rolls_up_owned_objects() {
        let a = child("foo.com");
        let mut b = a.clone();
        b.pools[0].servers.push(server("10.0.0.9"));
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn child_override_fields_reach_the_checksum() {
        let a = child("foo.com");
        let mut b = a.clone();
        b.overrides.waf_policy = Some("strict-waf".to_string());
        assert_ne!(a.checksum(), b.checksum());

        let mut c = a.clone();
        c.overrides.enabled = Some(false);
        assert_ne!(a.checksum(), c.checksum());
        assert!(!c.enabled());
    }

    #[test]
    fn child_fqdns_include_accepted_aliases() {
        let mut node = child("foo.com");
        node.overrides.aliases = vec!["www.foo.com".to_string()];
        assert_eq!(node.fqdns(), vec!["foo.com", "www.foo.com"]);
    }

    #[test]
    fn empty_parent_is_a_deletion_candidate_only() {
        let mut parent = ParentVsNode::new("c--Shared-L7-0", "admin");
        assert!(parent.is_empty());

        parent.children.insert("foo.com".to_string(), child("foo.com"));
        assert!(!parent.is_empty());

        parent.children.clear();
        parent.redirect_hosts.insert("foo.com".to_string());
        assert!(!parent.is_empty());
    }

    #[test]
    fn parent_checksum_sees_children_and_redirects() {
        let bare = ParentVsNode::new("c--Shared-L7-0", "admin");
        let mut with_child = bare.clone();
        with_child
            .children
            .insert("foo.com".to_string(), child("foo.com"));
        assert_ne!(bare.checksum(), with_child.checksum());

        let mut with_redirect = with_child.clone();
        with_redirect.redirect_hosts.insert("foo.com".to_string());
        assert_ne!(with_child.checksum(), with_redirect.checksum());
    }
}
