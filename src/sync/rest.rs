//! REST operation model and the remote controller boundary
//!
//! The sync engine expresses convergence as an ordered list of [`RestOp`]s
//! over typed JSON bodies built from graph nodes. The remote controller
//! itself is behind the [`LbApi`] trait so reconciliation tests run against
//! mocks and fakes.
//!
//! Per-object checksums are computed over the serialized body (serde_json
//! maps are ordered, so the rendering is canonical), which guarantees every
//! object kind is compared the same way.

use async_trait::async_trait;
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use crate::cache::ObjectKind;
use crate::graph::{
    ChildKind, ChildVsNode, HttpPolicyNode, HttpRule, ParentVsNode, PoolGroupNode, PoolNode,
    Server, TlsCertNode, VsVipNode,
};
use crate::naming::checksum_of;
use crate::Result;

/// Response to a successful create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateResponse {
    /// UUID assigned by the controller
    pub uuid: String,
    /// VIP address, echoed when creating a VsVip object
    pub vip: Option<String>,
}

/// One object from a tenant inventory listing
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteObject {
    /// Object name
    pub name: String,
    /// Remote UUID
    pub uuid: String,
    /// Checksum the sync engine stamped into the object on its last write,
    /// read back from the `cloud_config_cksum` field; zero for objects this
    /// controller never wrote
    pub checksum: u32,
    /// VIP address for VsVip objects
    pub vip: Option<String>,
    /// Owning parent virtual-service name, for child virtual services
    pub parent: Option<String>,
}

/// Typed partial-update document
///
/// Only known patchable field groups are expressible, so a patch can never
/// silently carry arbitrary fields.
#[derive(Clone, Debug, PartialEq)]
pub enum RestPatch {
    /// Replace a parent's child virtual-service references
    VsChildren(Vec<String>),
    /// Replace a virtual service's certificate references
    VsSslCerts(Vec<String>),
    /// Replace a pool's server list
    PoolServers(Vec<Server>),
}

impl RestPatch {
    /// The JSON body for this patch
    pub fn body(&self) -> Value {
        match self {
            Self::VsChildren(children) => json!({
                "vh_child_vs_refs": children
                    .iter()
                    .map(|c| vs_ref(c))
                    .collect::<Vec<_>>(),
            }),
            Self::VsSslCerts(certs) => json!({
                "ssl_key_and_certificate_refs": certs
                    .iter()
                    .map(|c| obj_ref(ObjectKind::SslKeyCert, c))
                    .collect::<Vec<_>>(),
            }),
            Self::PoolServers(servers) => json!({
                "servers": servers.iter().map(server_body).collect::<Vec<_>>(),
            }),
        }
    }
}

/// One ordered REST operation emitted by the diff
#[derive(Clone, Debug)]
pub enum RestOp {
    /// Create a missing object
    Create {
        /// Object kind
        kind: ObjectKind,
        /// Tenant
        tenant: String,
        /// Object name
        name: String,
        /// Full object body
        body: Value,
        /// Checksum recorded in the cache on success
        checksum: u32,
    },
    /// Replace an object whose checksum drifted
    Update {
        /// Object kind
        kind: ObjectKind,
        /// Tenant
        tenant: String,
        /// Object name
        name: String,
        /// Remote UUID
        uuid: String,
        /// Full object body
        body: Value,
        /// Checksum recorded in the cache on success
        checksum: u32,
    },
    /// Apply a typed partial update
    Patch {
        /// Object kind
        kind: ObjectKind,
        /// Tenant
        tenant: String,
        /// Object name
        name: String,
        /// Remote UUID
        uuid: String,
        /// The partial update
        patch: RestPatch,
    },
    /// Delete an object absent from the desired graph
    Delete {
        /// Object kind
        kind: ObjectKind,
        /// Tenant
        tenant: String,
        /// Object name
        name: String,
        /// Remote UUID
        uuid: String,
    },
}

impl RestOp {
    /// Kind, tenant, and name of the object this operation touches
    pub fn target(&self) -> (ObjectKind, &str, &str) {
        match self {
            Self::Create { kind, tenant, name, .. }
            | Self::Update { kind, tenant, name, .. }
            | Self::Patch { kind, tenant, name, .. }
            | Self::Delete { kind, tenant, name, .. } => (*kind, tenant, name),
        }
    }
}

/// The remote load-balancer controller boundary
///
/// A generic submit-object capability; the sync engine depends on nothing
/// beyond these five operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LbApi: Send + Sync {
    /// Create an object, returning its UUID
    async fn create(&self, kind: ObjectKind, tenant: &str, body: &Value) -> Result<CreateResponse>;
    /// Replace an object in full
    async fn update(&self, kind: ObjectKind, tenant: &str, uuid: &str, body: &Value) -> Result<()>;
    /// Apply a typed partial update
    async fn patch(&self, kind: ObjectKind, tenant: &str, uuid: &str, patch: &RestPatch) -> Result<()>;
    /// Delete an object
    async fn delete(&self, kind: ObjectKind, tenant: &str, uuid: &str) -> Result<()>;
    /// List every object of a kind under a tenant, for inventory pulls
    async fn list_by_tenant(&self, kind: ObjectKind, tenant: &str) -> Result<Vec<RemoteObject>>;
}

/// Name-based reference to another object
fn obj_ref(kind: ObjectKind, name: &str) -> String {
    format!("/api/{}?name={}", kind.api_path(), name)
}

fn vs_ref(name: &str) -> String {
    obj_ref(ObjectKind::VirtualService, name)
}

fn tenant_ref(tenant: &str) -> String {
    format!("/api/tenant?name={tenant}")
}

fn server_body(server: &Server) -> Value {
    json!({
        "ip": { "addr": server.ip, "type": "V4" },
        "port": server.port,
    })
}

/// Full body for a pool
pub fn pool_body(pool: &PoolNode) -> Value {
    let mut body = json!({
        "name": pool.name,
        "tenant_ref": tenant_ref(&pool.tenant),
        "servers": pool.servers.iter().map(server_body).collect::<Vec<_>>(),
        "health_monitor_refs": pool
            .health_monitors
            .iter()
            .map(|hm| obj_ref(ObjectKind::HealthMonitor, hm))
            .collect::<Vec<_>>(),
    });
    if let Some(algo) = pool.lb_algorithm {
        body["lb_algorithm"] = json!(algo.to_string());
    }
    if let Some(key) = &pool.hash_key {
        body["lb_algorithm_hash"] = json!("LB_ALGORITHM_CONSISTENT_HASH_CUSTOM_HEADER");
        body["lb_algorithm_consistent_hash_hdr"] = json!(key);
    }
    if let Some(profile) = &pool.ssl_profile {
        body["ssl_profile_ref"] = json!(obj_ref(ObjectKind::SslProfile, profile));
    }
    if let Some(profile) = &pool.pki_profile {
        body["pki_profile_ref"] = json!(obj_ref(ObjectKind::PkiProfile, profile));
    }
    body
}

/// Full body for a pool group
pub fn pool_group_body(group: &PoolGroupNode) -> Value {
    json!({
        "name": group.name,
        "tenant_ref": tenant_ref(&group.tenant),
        "members": group
            .members
            .iter()
            .map(|m| json!({
                "pool_ref": obj_ref(ObjectKind::Pool, &m.pool_name),
                "ratio": m.weight,
            }))
            .collect::<Vec<_>>(),
    })
}

/// Full body for an HTTP policy set
pub fn http_policy_body(policy: &HttpPolicyNode) -> Value {
    let rules: Vec<Value> = policy
        .rules
        .iter()
        .enumerate()
        .map(|(index, rule)| match rule {
            HttpRule::Switch { path, criteria, pool_group } => json!({
                "index": index + 1,
                "match": {
                    "path": {
                        "match_criteria": criteria.as_str(),
                        "match_str": [path],
                    }
                },
                "switching_action": {
                    "action": "HTTP_SWITCHING_SELECT_POOLGROUP",
                    "pool_group_ref": obj_ref(ObjectKind::PoolGroup, pool_group),
                },
            }),
            HttpRule::Redirect { host, port } => json!({
                "index": index + 1,
                "match": {
                    "host_hdr": {
                        "match_criteria": "HDR_EQUALS",
                        "value": [host],
                    }
                },
                "redirect_action": {
                    "protocol": "HTTPS",
                    "port": port,
                    "status_code": "HTTP_REDIRECT_STATUS_CODE_302",
                },
            }),
        })
        .collect();

    json!({
        "name": policy.name,
        "tenant_ref": tenant_ref(&policy.tenant),
        "http_request_policy": { "rules": rules },
    })
}

/// Full body for a certificate object derived from a TLS secret
pub fn tls_cert_body(cert: &TlsCertNode) -> Value {
    json!({
        "name": cert.name,
        "tenant_ref": tenant_ref(&cert.tenant),
        "type": "SSL_CERTIFICATE_TYPE_VIRTUALSERVICE",
        "certificate": { "certificate": cert.cert },
        "key": cert.key,
    })
}

/// Full body for a VIP object
pub fn vsvip_body(vsvip: &VsVipNode) -> Value {
    let mut vip = json!({ "vip_id": "0", "auto_allocate_ip": true });
    if let Some(network) = &vsvip.network {
        vip["ipam_network_subnet"] = json!({
            "network_ref": obj_ref(ObjectKind::Network, network),
        });
    }
    json!({
        "name": vsvip.name,
        "tenant_ref": tenant_ref(&vsvip.tenant),
        "vip": [vip],
        "dns_info": vsvip
            .fqdns
            .iter()
            .map(|fqdn| json!({ "fqdn": fqdn, "type": "DNS_RECORD_A" }))
            .collect::<Vec<_>>(),
    })
}

/// Full body for a parent virtual service
///
/// `redirect_policy` names the synthesized HTTP→HTTPS policy attached when
/// any secure host lives on this parent.
pub fn parent_vs_body(parent: &ParentVsNode, redirect_policy: Option<&str>) -> Value {
    let mut policy_refs: Vec<String> = Vec::new();
    if let Some(name) = redirect_policy {
        policy_refs.push(obj_ref(ObjectKind::HttpPolicySet, name));
    }
    policy_refs.extend(
        parent
            .http_policy_refs
            .iter()
            .map(|p| obj_ref(ObjectKind::HttpPolicySet, p)),
    );

    let mut body = json!({
        "name": parent.name,
        "tenant_ref": tenant_ref(&parent.tenant),
        "enabled": parent.enabled,
        "services": parent
            .listeners
            .iter()
            .map(|l| json!({ "port": l.port, "enable_ssl": l.enable_ssl }))
            .collect::<Vec<_>>(),
        "vsvip_ref": obj_ref(ObjectKind::VsVip, &parent.vip_ref),
        "http_policy_refs": policy_refs,
        "vh_child_vs_refs": parent.children.values().map(|c| vs_ref(&c.name)).collect::<Vec<_>>(),
    });
    if let Some(seg) = &parent.se_group {
        body["se_group_ref"] = json!(obj_ref(ObjectKind::ServiceEngineGroup, seg));
    }
    for (field, kind, value) in [
        ("application_profile_ref", ObjectKind::ApplicationProfile, &parent.application_profile),
        ("analytics_profile_ref", ObjectKind::AnalyticsProfile, &parent.analytics_profile),
        ("waf_policy_ref", ObjectKind::WafPolicy, &parent.waf_policy),
        ("error_page_profile_ref", ObjectKind::ErrorPageProfile, &parent.error_page_profile),
        ("ssl_profile_ref", ObjectKind::SslProfile, &parent.ssl_profile),
    ] {
        if let Some(name) = value {
            body[field] = json!(obj_ref(kind, name));
        }
    }
    if !parent.datascripts.is_empty() {
        body["vs_datascripts"] = json!(parent
            .datascripts
            .iter()
            .enumerate()
            .map(|(i, ds)| json!({
                "index": i + 1,
                "vs_datascript_set_ref": obj_ref(ObjectKind::Datascript, ds),
            }))
            .collect::<Vec<_>>());
    }
    body
}

/// Full body for a child virtual service
pub fn child_vs_body(child: &ChildVsNode, parent: &ParentVsNode) -> Value {
    let vh_type = match child.kind {
        ChildKind::Sni => "VS_TYPE_VH_SNI",
        ChildKind::Evh => "VS_TYPE_VH_ENHANCED",
    };
    let certs: Vec<String> = child
        .cert_refs()
        .iter()
        .map(|c| obj_ref(ObjectKind::SslKeyCert, c))
        .collect();

    let mut body = json!({
        "name": child.name,
        "tenant_ref": tenant_ref(&parent.tenant),
        "enabled": child.enabled(),
        "type": "VS_TYPE_VH_CHILD",
        "vh_type": vh_type,
        "vh_parent_vs_ref": vs_ref(&parent.name),
        "vh_domain_name": child.fqdns(),
        "ssl_key_and_certificate_refs": certs,
        "http_policy_refs": child
            .http_policies
            .iter()
            .map(|p| obj_ref(ObjectKind::HttpPolicySet, &p.name))
            .chain(
                child
                    .overrides
                    .http_policy_sets
                    .iter()
                    .map(|p| obj_ref(ObjectKind::HttpPolicySet, p)),
            )
            .collect::<Vec<_>>(),
    });
    for (field, kind, value) in [
        ("waf_policy_ref", ObjectKind::WafPolicy, &child.overrides.waf_policy),
        ("application_profile_ref", ObjectKind::ApplicationProfile, &child.overrides.application_profile),
        ("analytics_profile_ref", ObjectKind::AnalyticsProfile, &child.overrides.analytics_profile),
        ("error_page_profile_ref", ObjectKind::ErrorPageProfile, &child.overrides.error_page_profile),
        ("ssl_profile_ref", ObjectKind::SslProfile, &child.overrides.ssl_profile),
    ] {
        if let Some(name) = value {
            body[field] = json!(obj_ref(kind, name));
        }
    }
    if !child.overrides.datascripts.is_empty() {
        body["vs_datascripts"] = json!(child
            .overrides
            .datascripts
            .iter()
            .enumerate()
            .map(|(i, ds)| json!({
                "index": i + 1,
                "vs_datascript_set_ref": obj_ref(ObjectKind::Datascript, ds),
            }))
            .collect::<Vec<_>>());
    }
    if let Some(sso) = &child.overrides.sso {
        body["sso_policy_ref"] = json!(obj_ref(ObjectKind::SsoPolicy, &sso.policy_ref));
        if let Some(saml) = &sso.saml {
            let mut saml_body = json!({ "acs_type": format!("{:?}", saml.acs_type).to_uppercase() });
            if let Some(cert) = &saml.signing_ssl_key_certificate {
                saml_body["signing_ssl_key_and_certificate_ref"] =
                    json!(obj_ref(ObjectKind::SslKeyCert, cert));
            }
            if let Some(entity) = &saml.entity_id {
                saml_body["entity_id"] = json!(entity);
            }
            if let Some(index) = saml.acs_index {
                saml_body["acs_index"] = json!(index);
            }
            body["saml_sp_config"] = saml_body;
        }
        if let Some(oauth) = &sso.oauth {
            body["oauth_vs_config"] = json!({
                "auth_profile_ref": obj_ref(ObjectKind::AuthProfile, &oauth.auth_profile),
                "scopes": oauth.scopes,
            });
        }
    }
    body
}

/// Checksum of a body's canonical rendering
pub fn body_checksum(body: &Value) -> u32 {
    checksum_of(&body.to_string())
}
