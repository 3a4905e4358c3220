//! Kubernetes object ingestion
//!
//! Consumes add/update/delete notifications carrying full object snapshots
//! and converges the graph model. The informer layer that produces the
//! notifications is an external collaborator; this module never assumes
//! delivery order across object kinds and re-derives shard membership from
//! whatever the current snapshots imply.
//!
//! Ingestion only mutates the graph (never issues REST calls) and returns
//! the affected shard keys for the caller to enqueue.

mod ingress;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{debug, info, warn};

pub use ingress::{parse_ingress, resolve_servers, HostModel, PathModel};

#[cfg(test)]
pub(crate) use ingress::test_fixtures;

use crate::admission::{Admission, Validator};
use crate::cache::ObjectCache;
use crate::config::ControllerConfig;
use crate::crd::{
    CrdStatus, HostOverride, HostOverrideSpec, InfraSetting, InfraSettingSpec, PathOverride,
    PathOverrideSpec, SsoPolicy,
};
use crate::graph::{
    ChildKind, ChildState, ChildVsNode, HostOverrideEffect, HttpPolicyNode, HttpRule, ParentVsNode,
    PoolGroupMember, PoolGroupNode, PoolNode, SsoEffect, TlsCertNode, VsGraph,
};
use crate::naming::{Checksum, Namer};
use crate::shard::{ShardKey, ShardScheme};
use crate::status::{CrdKind, StatusSink};

/// Namespace + name identity of a Kubernetes object
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ObjectKey {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Build a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object snapshot
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone().unwrap_or_default(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One Kubernetes notification with its object snapshot
#[derive(Clone, Debug)]
pub enum ObjectEvent {
    /// Ingress created or updated
    IngressApplied(Box<Ingress>),
    /// Ingress deleted
    IngressDeleted(ObjectKey),
    /// Service created or updated
    ServiceApplied(Box<Service>),
    /// Service deleted
    ServiceDeleted(ObjectKey),
    /// Endpoints created or updated
    EndpointsApplied(Box<Endpoints>),
    /// Endpoints deleted
    EndpointsDeleted(ObjectKey),
    /// Secret created or updated
    SecretApplied(Box<Secret>),
    /// Secret deleted
    SecretDeleted(ObjectKey),
    /// HostOverride created or updated
    HostOverrideApplied(Box<HostOverride>),
    /// HostOverride deleted
    HostOverrideDeleted(ObjectKey),
    /// PathOverride created or updated
    PathOverrideApplied(Box<PathOverride>),
    /// PathOverride deleted
    PathOverrideDeleted(ObjectKey),
    /// SsoPolicy created or updated
    SsoPolicyApplied(Box<SsoPolicy>),
    /// SsoPolicy deleted
    SsoPolicyDeleted(ObjectKey),
    /// InfraSetting created or updated
    InfraSettingApplied(Box<InfraSetting>),
    /// InfraSetting deleted, by name (cluster-scoped)
    InfraSettingDeleted(String),
}

/// Latest object snapshots, keyed by namespace/name
///
/// Stands in for informer listers: cross-object resolution (an Ingress path
/// needs its Service and Endpoints) reads the latest snapshot seen for each
/// object, whatever order events arrived in.
#[derive(Debug, Default)]
struct SnapshotStore {
    ingresses: DashMap<ObjectKey, Ingress>,
    services: DashMap<ObjectKey, Service>,
    endpoints: DashMap<ObjectKey, Endpoints>,
    secrets: DashMap<ObjectKey, Secret>,
}

/// Converges Kubernetes snapshots onto the graph model
pub struct Ingestor {
    namer: Namer,
    scheme: ShardScheme,
    tenant: String,
    evh: bool,

    graph: Arc<VsGraph>,
    cache: Arc<ObjectCache>,
    status: Arc<dyn StatusSink>,

    store: SnapshotStore,

    /// Hosts each ingress contributes, for diffing on update
    ingress_hosts: DashMap<ObjectKey, HashSet<String>>,
    /// Ingresses contributing to each host, for merge and status write-back
    host_ingresses: DashMap<String, HashSet<ObjectKey>>,
    /// Ingresses referencing each service, for endpoint churn fan-out
    service_ingresses: DashMap<ObjectKey, HashSet<ObjectKey>>,

    /// Accepted host-level overrides by FQDN
    host_overrides: DashMap<String, (ObjectKey, HostOverrideSpec)>,
    /// Accepted path-level overrides by FQDN
    path_overrides: DashMap<String, (ObjectKey, PathOverrideSpec)>,
    /// Accepted SSO effects by FQDN
    sso_effects: DashMap<String, (ObjectKey, SsoEffect)>,
    /// Accepted infra settings by name
    infra_settings: DashMap<String, InfraSettingSpec>,
    /// Namespace → infra setting name
    namespace_infra: DashMap<String, String>,
    /// Last written CRD status, to skip no-op writes
    crd_statuses: DashMap<(CrdKind, ObjectKey), CrdStatus>,
}

impl Ingestor {
    /// Build an ingestor over the shared graph, cache, and status sink
    pub fn new(
        config: &ControllerConfig,
        graph: Arc<VsGraph>,
        cache: Arc<ObjectCache>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            namer: config.namer(),
            scheme: config.shard_scheme(),
            tenant: config.tenant.clone(),
            evh: config.evh,
            graph,
            cache,
            status,
            store: SnapshotStore::default(),
            ingress_hosts: DashMap::new(),
            host_ingresses: DashMap::new(),
            service_ingresses: DashMap::new(),
            host_overrides: DashMap::new(),
            path_overrides: DashMap::new(),
            sso_effects: DashMap::new(),
            infra_settings: DashMap::new(),
            namespace_infra: DashMap::new(),
            crd_statuses: DashMap::new(),
        }
    }

    /// Ingresses currently contributing routes to a host
    pub fn ingresses_for_host(&self, host: &str) -> Vec<ObjectKey> {
        self.host_ingresses
            .get(host)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply one notification and return the shards needing reconciliation
    pub async fn handle(&self, event: ObjectEvent) -> Vec<ShardKey> {
        match event {
            ObjectEvent::IngressApplied(ingress) => self.ingress_applied(*ingress),
            ObjectEvent::IngressDeleted(key) => self.ingress_deleted(&key),
            ObjectEvent::ServiceApplied(service) => {
                let key = ObjectKey::of(&*service);
                self.store.services.insert(key.clone(), *service);
                self.rebuild_service_referrers(&key)
            }
            ObjectEvent::ServiceDeleted(key) => {
                self.store.services.remove(&key);
                self.rebuild_service_referrers(&key)
            }
            ObjectEvent::EndpointsApplied(endpoints) => {
                let key = ObjectKey::of(&*endpoints);
                self.store.endpoints.insert(key.clone(), *endpoints);
                self.rebuild_service_referrers(&key)
            }
            ObjectEvent::EndpointsDeleted(key) => {
                self.store.endpoints.remove(&key);
                self.rebuild_service_referrers(&key)
            }
            ObjectEvent::SecretApplied(secret) => {
                let key = ObjectKey::of(&*secret);
                self.store.secrets.insert(key.clone(), *secret);
                self.rebuild_secret_referrers(&key)
            }
            ObjectEvent::SecretDeleted(key) => {
                self.store.secrets.remove(&key);
                self.rebuild_secret_referrers(&key)
            }
            ObjectEvent::HostOverrideApplied(crd) => self.host_override_applied(*crd).await,
            ObjectEvent::HostOverrideDeleted(key) => self.host_override_deleted(&key),
            ObjectEvent::PathOverrideApplied(crd) => self.path_override_applied(*crd).await,
            ObjectEvent::PathOverrideDeleted(key) => self.path_override_deleted(&key),
            ObjectEvent::SsoPolicyApplied(crd) => self.sso_policy_applied(*crd).await,
            ObjectEvent::SsoPolicyDeleted(key) => self.sso_policy_deleted(&key),
            ObjectEvent::InfraSettingApplied(crd) => self.infra_setting_applied(*crd).await,
            ObjectEvent::InfraSettingDeleted(name) => self.infra_setting_deleted(&name),
        }
    }

    // ------------------------------------------------------------------
    // Routing object flows
    // ------------------------------------------------------------------

    fn ingress_applied(&self, ingress: Ingress) -> Vec<ShardKey> {
        let key = ObjectKey::of(&ingress);
        let models = parse_ingress(&ingress);
        let new_hosts: HashSet<String> = models.iter().map(|m| m.host.clone()).collect();

        let old_hosts = self
            .ingress_hosts
            .insert(key.clone(), new_hosts.clone())
            .unwrap_or_default();

        for host in &new_hosts {
            self.host_ingresses
                .entry(host.clone())
                .or_default()
                .insert(key.clone());
        }
        for host in old_hosts.difference(&new_hosts) {
            self.unindex_host(host, &key);
        }

        self.reindex_services(&key, &ingress);
        self.store.ingresses.insert(key.clone(), ingress);

        debug!(ingress = %key, hosts = new_hosts.len(), "ingress applied");
        self.rebuild_hosts(old_hosts.union(&new_hosts).cloned())
    }

    fn ingress_deleted(&self, key: &ObjectKey) -> Vec<ShardKey> {
        self.store.ingresses.remove(key);
        self.service_ingresses.iter_mut().for_each(|mut entry| {
            entry.value_mut().remove(key);
        });
        let old_hosts = self.ingress_hosts.remove(key).map(|(_, h)| h).unwrap_or_default();
        for host in &old_hosts {
            self.unindex_host(host, key);
        }
        info!(ingress = %key, "ingress deleted");
        self.rebuild_hosts(old_hosts.into_iter())
    }

    fn unindex_host(&self, host: &str, ingress: &ObjectKey) {
        if let Some(mut set) = self.host_ingresses.get_mut(host) {
            set.remove(ingress);
        }
        self.host_ingresses
            .remove_if(host, |_, set| set.is_empty());
    }

    fn reindex_services(&self, ingress: &ObjectKey, snapshot: &Ingress) {
        self.service_ingresses.iter_mut().for_each(|mut entry| {
            entry.value_mut().remove(ingress);
        });
        for model in parse_ingress(snapshot) {
            for path in &model.paths {
                let svc = ObjectKey::new(ingress.namespace.clone(), path.service.clone());
                self.service_ingresses
                    .entry(svc)
                    .or_default()
                    .insert(ingress.clone());
            }
        }
    }

    fn rebuild_service_referrers(&self, service: &ObjectKey) -> Vec<ShardKey> {
        let ingresses: Vec<ObjectKey> = self
            .service_ingresses
            .get(service)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut hosts = HashSet::new();
        for ingress in ingresses {
            if let Some(set) = self.ingress_hosts.get(&ingress) {
                hosts.extend(set.iter().cloned());
            }
        }
        self.rebuild_hosts(hosts.into_iter())
    }

    fn rebuild_secret_referrers(&self, secret: &ObjectKey) -> Vec<ShardKey> {
        // Secrets rotate rarely; a scan over same-namespace ingresses beats
        // maintaining another index
        let mut hosts = HashSet::new();
        for entry in self.store.ingresses.iter() {
            if entry.key().namespace != secret.namespace {
                continue;
            }
            for model in parse_ingress(entry.value()) {
                if model.tls_secret.as_deref() == Some(secret.name.as_str()) {
                    hosts.insert(model.host.clone());
                }
            }
        }
        self.rebuild_hosts(hosts.into_iter())
    }

    fn rebuild_hosts(&self, hosts: impl Iterator<Item = String>) -> Vec<ShardKey> {
        let mut shards = HashSet::new();
        for host in hosts {
            shards.extend(self.rebuild_host(&host));
        }
        shards.into_iter().collect()
    }

    /// Rebuild the child node for one host from current snapshots
    ///
    /// Returns every shard touched: the host's current shard, plus its old
    /// one when shard membership changed (re-parenting is removal-then-add).
    fn rebuild_host(&self, host: &str) -> Vec<ShardKey> {
        let contributors = self.ingresses_for_host(host);

        if contributors.is_empty() {
            // Last routing rule gone: detach the child; the parent stays as
            // a deletion candidate for the sync engine to judge
            if let Some(shard) = self.graph.shard_of(host) {
                self.graph.remove_child(&shard, host);
                return vec![shard];
            }
            return vec![];
        }

        let namespace = contributors[0].namespace.clone();
        if contributors.iter().any(|k| k.namespace != namespace) {
            warn!(host, "host claimed by ingresses in multiple namespaces, using {namespace}");
        }

        let infra_name = self.namespace_infra.get(&namespace).map(|v| v.clone());
        let infra = infra_name
            .as_deref()
            .and_then(|name| self.infra_settings.get(name).map(|s| s.clone()));

        // An infra-setting shard-size override narrows shared mode only
        let scheme = match (&self.scheme, infra.as_ref().and_then(|i| i.shard_size)) {
            (ShardScheme::Shared { .. }, Some(size)) => ShardScheme::Shared { count: size.count() },
            (scheme, _) => scheme.clone(),
        };
        let shard = scheme.shard_key(&self.namer, host, &namespace, infra_name.as_deref(), self.evh);

        let child = self.build_child(host, &namespace, &contributors);
        let state = child.state;

        let mut touched = vec![shard.clone()];
        if let Some(previous) = self.graph.shard_of(host) {
            if previous != shard {
                self.graph.remove_child(&previous, host);
                touched.push(previous);
            } else if self.graph.child_checksum(&shard, host) == Some(child.checksum()) {
                // Identical rebuild: nothing for the sync engine to do
                return vec![];
            }
        }

        let tenant = self.tenant.clone();
        let name = shard.as_str().to_string();
        let infra_for_parent = infra.clone();
        self.graph.upsert_child(&shard, child, move || {
            let mut parent = ParentVsNode::new(name, tenant);
            if let Some(infra) = infra_for_parent {
                parent.se_group = infra.service_engine_group.clone();
                parent.vip_network = infra.vip_network.clone();
            }
            parent
        });
        debug!(host, shard = %shard, ?state, "rebuilt child node");
        touched
    }

    /// Build the desired child node for a host from all contributing
    /// ingresses and any Accepted path overrides
    fn build_child(&self, host: &str, namespace: &str, contributors: &[ObjectKey]) -> ChildVsNode {
        let mut paths: Vec<PathModel> = Vec::new();
        let mut tls_secret: Option<String> = None;
        for key in contributors {
            let Some(ingress) = self.store.ingresses.get(key).map(|i| i.clone()) else {
                continue;
            };
            for model in parse_ingress(&ingress) {
                if model.host != host {
                    continue;
                }
                if tls_secret.is_none() {
                    tls_secret = model.tls_secret.clone();
                }
                for path in model.paths {
                    if !paths.iter().any(|p| p.path == path.path) {
                        paths.push(path);
                    }
                }
            }
        }
        // Longest prefix first so more specific rules win on the controller
        paths.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));

        let path_override = self.path_overrides.get(host).map(|e| e.value().1.clone());

        let mut pools = Vec::new();
        let mut pool_groups = Vec::new();
        let mut rules = Vec::new();
        let mut resolved_all = true;
        for path in &paths {
            let svc_key = ObjectKey::new(namespace, path.service.clone());
            let service = self.store.services.get(&svc_key).map(|s| s.clone());
            let endpoints = self.store.endpoints.get(&svc_key).map(|e| e.clone());

            let servers = match (&service, &endpoints) {
                (Some(service), Some(endpoints)) => resolve_servers(service, endpoints, path),
                _ => {
                    resolved_all = false;
                    vec![]
                }
            };

            let mut pool = PoolNode::new(
                self.namer.pool_name(namespace, host, &path.path, &path.service),
                self.tenant.clone(),
                servers,
            );
            if let Some(rule) = path_override
                .as_ref()
                .and_then(|o| o.paths.iter().find(|r| r.target == path.path))
            {
                pool.lb_algorithm = rule.lb_algorithm;
                pool.hash_key = rule.hash_key.clone();
                pool.health_monitors = rule.health_monitors.clone();
                if let Some(tls) = &rule.tls {
                    pool.ssl_profile = tls.ssl_profile.clone();
                    pool.pki_profile = tls.pki_profile.clone();
                }
            }

            let group = PoolGroupNode {
                name: self.namer.pool_group_name(namespace, host, &path.path),
                tenant: self.tenant.clone(),
                members: vec![PoolGroupMember {
                    pool_name: pool.name.clone(),
                    weight: 100,
                }],
            };
            rules.push(HttpRule::Switch {
                path: path.path.clone(),
                criteria: path.criteria,
                pool_group: group.name.clone(),
            });
            pools.push(pool);
            pool_groups.push(group);
        }

        // The certificate object exists only while the secret does; losing
        // the secret downgrades the host without deleting its routes
        let certs = tls_secret
            .and_then(|secret| {
                let snapshot = self.store.secrets.get(&ObjectKey::new(namespace, secret.clone()))?;
                let data = snapshot.data.as_ref()?;
                let cert = data.get("tls.crt")?;
                let key = data.get("tls.key")?;
                Some(vec![TlsCertNode {
                    name: self.namer.cert_name(namespace, &secret),
                    tenant: self.tenant.clone(),
                    cert: String::from_utf8_lossy(&cert.0).to_string(),
                    key: String::from_utf8_lossy(&key.0).to_string(),
                }])
            })
            .unwrap_or_default();

        let state = if resolved_all && !pools.is_empty() {
            ChildState::Active
        } else {
            ChildState::Building
        };

        ChildVsNode {
            name: self.namer.child_vs_name(namespace, host),
            kind: if self.evh { ChildKind::Evh } else { ChildKind::Sni },
            host: host.to_string(),
            namespace: namespace.to_string(),
            state,
            certs,
            pools,
            pool_groups,
            http_policies: vec![HttpPolicyNode {
                name: self.namer.http_policy_name(namespace, host),
                tenant: self.tenant.clone(),
                rules,
            }],
            overrides: self.effective_override(host),
        }
    }

    /// The override effect currently Accepted for a host, or defaults
    fn effective_override(&self, host: &str) -> HostOverrideEffect {
        let mut effect = self
            .host_overrides
            .get(host)
            .map(|e| Self::effect_of(&e.value().1))
            .unwrap_or_default();
        effect.sso = self.sso_effects.get(host).map(|e| e.value().1.clone());
        effect
    }

    fn effect_of(spec: &HostOverrideSpec) -> HostOverrideEffect {
        HostOverrideEffect {
            enabled: spec.enable_virtual_host,
            aliases: spec.aliases.clone(),
            ssl_key_certificate: spec.tls.as_ref().and_then(|t| t.ssl_key_certificate.clone()),
            ssl_profile: spec.tls.as_ref().and_then(|t| t.ssl_profile.clone()),
            waf_policy: spec.waf_policy.clone(),
            application_profile: spec.application_profile.clone(),
            analytics_profile: spec.analytics_profile.clone(),
            error_page_profile: spec.error_page_profile.clone(),
            datascripts: spec.datascripts.clone(),
            http_policy_sets: spec.http_policy_sets.clone(),
            listeners: spec.listeners.clone(),
            sso: None,
        }
    }

    // ------------------------------------------------------------------
    // Policy CRD flows
    // ------------------------------------------------------------------

    async fn host_override_applied(&self, crd: HostOverride) -> Vec<ShardKey> {
        let key = ObjectKey::of(&crd);
        let fqdn = crd.spec.fqdn.clone();

        let duplicate = self
            .host_overrides
            .get(&fqdn)
            .map(|e| e.value().0.clone())
            .filter(|owner| *owner != key)
            .map(|owner| owner.to_string());

        let validator = Validator::new(&self.cache, &self.tenant);
        let outcome = validator.validate_host_override(&crd.spec, duplicate.as_deref());
        self.write_crd_status(CrdKind::HostOverride, &key, &outcome).await;

        if !outcome.is_accepted() {
            // The last Accepted configuration, if any, stays in effect
            return vec![];
        }

        self.host_overrides
            .insert(fqdn.clone(), (key, crd.spec.clone()));
        self.apply_effective(&fqdn)
    }

    fn host_override_deleted(&self, key: &ObjectKey) -> Vec<ShardKey> {
        let fqdn = self
            .host_overrides
            .iter()
            .find(|e| e.value().0 == *key)
            .map(|e| e.key().clone());
        let Some(fqdn) = fqdn else {
            return vec![];
        };
        self.host_overrides.remove(&fqdn);
        self.crd_statuses
            .remove(&(CrdKind::HostOverride, key.clone()));
        info!(crd = %key, fqdn, "host override deleted, reverting to defaults");
        self.apply_effective(&fqdn)
    }

    async fn path_override_applied(&self, crd: PathOverride) -> Vec<ShardKey> {
        let key = ObjectKey::of(&crd);
        let fqdn = crd.spec.fqdn.clone();

        let validator = Validator::new(&self.cache, &self.tenant);
        let outcome = validator.validate_path_override(&crd.spec);
        self.write_crd_status(CrdKind::PathOverride, &key, &outcome).await;

        if !outcome.is_accepted() {
            return vec![];
        }
        self.path_overrides.insert(fqdn.clone(), (key, crd.spec.clone()));
        // Pool-level effects land during child rebuild
        self.rebuild_hosts(std::iter::once(fqdn))
    }

    fn path_override_deleted(&self, key: &ObjectKey) -> Vec<ShardKey> {
        let fqdn = self
            .path_overrides
            .iter()
            .find(|e| e.value().0 == *key)
            .map(|e| e.key().clone());
        let Some(fqdn) = fqdn else {
            return vec![];
        };
        self.path_overrides.remove(&fqdn);
        self.crd_statuses
            .remove(&(CrdKind::PathOverride, key.clone()));
        self.rebuild_hosts(std::iter::once(fqdn))
    }

    async fn sso_policy_applied(&self, crd: SsoPolicy) -> Vec<ShardKey> {
        let key = ObjectKey::of(&crd);
        let fqdn = crd.spec.fqdn.clone();

        let duplicate = self
            .sso_effects
            .get(&fqdn)
            .map(|e| e.value().0.clone())
            .filter(|owner| *owner != key)
            .map(|owner| owner.to_string());

        let validator = Validator::new(&self.cache, &self.tenant);
        let outcome = validator.validate_sso_policy(&crd.spec, duplicate.as_deref());
        self.write_crd_status(CrdKind::SsoPolicy, &key, &outcome).await;

        if !outcome.is_accepted() {
            return vec![];
        }
        let effect = SsoEffect {
            policy_ref: crd.spec.sso_policy_ref.clone(),
            saml: crd.spec.saml.clone(),
            oauth: crd.spec.oauth.clone(),
        };
        self.sso_effects.insert(fqdn.clone(), (key, effect));
        self.apply_effective(&fqdn)
    }

    fn sso_policy_deleted(&self, key: &ObjectKey) -> Vec<ShardKey> {
        let fqdn = self
            .sso_effects
            .iter()
            .find(|e| e.value().0 == *key)
            .map(|e| e.key().clone());
        let Some(fqdn) = fqdn else {
            return vec![];
        };
        self.sso_effects.remove(&fqdn);
        self.crd_statuses.remove(&(CrdKind::SsoPolicy, key.clone()));
        self.apply_effective(&fqdn)
    }

    async fn infra_setting_applied(&self, crd: InfraSetting) -> Vec<ShardKey> {
        let name = crd.name_any();
        let key = ObjectKey::new(String::new(), name.clone());

        let validator = Validator::new(&self.cache, &self.tenant);
        let outcome = validator.validate_infra_setting(&crd.spec);
        self.write_crd_status(CrdKind::InfraSetting, &key, &outcome).await;

        if !outcome.is_accepted() {
            return vec![];
        }

        let mut affected: HashSet<String> = self
            .namespace_infra
            .iter()
            .filter(|e| *e.value() == name)
            .map(|e| e.key().clone())
            .collect();
        self.namespace_infra.retain(|_, setting| *setting != name);
        for namespace in &crd.spec.namespaces {
            self.namespace_infra.insert(namespace.clone(), name.clone());
            affected.insert(namespace.clone());
        }
        self.infra_settings.insert(name, crd.spec.clone());

        self.rebuild_namespaces(&affected)
    }

    fn infra_setting_deleted(&self, name: &str) -> Vec<ShardKey> {
        self.infra_settings.remove(name);
        self.crd_statuses
            .remove(&(CrdKind::InfraSetting, ObjectKey::new(String::new(), name)));
        let affected: HashSet<String> = self
            .namespace_infra
            .iter()
            .filter(|e| e.value() == name)
            .map(|e| e.key().clone())
            .collect();
        self.namespace_infra.retain(|_, setting| setting != name);
        self.rebuild_namespaces(&affected)
    }

    fn rebuild_namespaces(&self, namespaces: &HashSet<String>) -> Vec<ShardKey> {
        let hosts: HashSet<String> = self
            .ingress_hosts
            .iter()
            .filter(|e| namespaces.contains(&e.key().namespace))
            .flat_map(|e| e.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        self.rebuild_hosts(hosts.into_iter())
    }

    /// Push the currently effective override for a host into the graph
    fn apply_effective(&self, fqdn: &str) -> Vec<ShardKey> {
        let effect = self.effective_override(fqdn);
        match self.graph.apply_host_override(fqdn, effect) {
            Some(shard) => vec![shard],
            // No child yet: the override is stored and lands when the
            // host's first routing rule arrives
            None => vec![],
        }
    }

    async fn write_crd_status(&self, kind: CrdKind, key: &ObjectKey, outcome: &Admission) {
        let status = match outcome {
            Admission::Accepted => CrdStatus::accepted(),
            Admission::Rejected(err) => CrdStatus::rejected(err.clone()),
        };
        let unchanged = self
            .crd_statuses
            .get(&(kind, key.clone()))
            .is_some_and(|last| last.same_outcome(&status));
        if unchanged {
            return;
        }
        // Best-effort: a failed write leaves the last recorded status in
        // place so the next validation retries it
        match self.status.report_crd(kind, key, &status).await {
            Ok(()) => {
                self.crd_statuses.insert((kind, key.clone()), status);
            }
            Err(err) => {
                warn!(?kind, crd = %key, error = %err, "failed to write CRD status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::*;
    use super::*;
    use crate::cache::{CacheEntry, ObjectKind};
    use crate::config::ControllerConfig;
    use crate::crd::{CrdPhase, HostOverrideSpec};
    use crate::status::MockStatusSink;
    use std::sync::Mutex;

    /// Captured CRD status writes: (kind, key, phase, error)
    type StatusLog = Arc<Mutex<Vec<(CrdKind, ObjectKey, CrdPhase, Option<String>)>>>;

    fn recording_status() -> (Arc<MockStatusSink>, StatusLog) {
        let log: StatusLog = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockStatusSink::new();
        let sink = Arc::clone(&log);
        mock.expect_report_crd().returning(move |kind, key, status| {
            sink.lock().unwrap().push((kind, key.clone(), status.status, status.error.clone()));
            Ok(())
        });
        mock.expect_report_ingress().returning(|_, _, _| Ok(()));
        (Arc::new(mock), log)
    }

    fn ingestor() -> (Ingestor, StatusLog, Arc<ObjectCache>) {
        let config = ControllerConfig::for_tests("c");
        let graph = Arc::new(VsGraph::new());
        let cache = Arc::new(ObjectCache::new());
        let (status, log) = recording_status();
        let ingestor = Ingestor::new(&config, graph, Arc::clone(&cache), status);
        (ingestor, log, cache)
    }

    async fn seed_route(ingestor: &Ingestor, host: &str) -> Vec<ShardKey> {
        ingestor
            .handle(ObjectEvent::ServiceApplied(Box::new(service_with("backend", 80))))
            .await;
        ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1"],
                8080,
            ))))
            .await;
        ingestor
            .handle(ObjectEvent::IngressApplied(Box::new(ingress_with(
                host, "/", "backend", 80, None,
            ))))
            .await
    }

    #[tokio::test]
    async fn ingress_with_resolved_backend_builds_an_active_child() {
        let (ingestor, _, _) = ingestor();
        let shards = seed_route(&ingestor, "foo.com").await;
        assert_eq!(shards.len(), 1);

        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        let child = &parent.children["foo.com"];
        assert_eq!(child.state, ChildState::Active);
        assert_eq!(child.pools.len(), 1);
        assert_eq!(child.pools[0].servers.len(), 1);
        assert_eq!(child.pools[0].servers[0].ip, "10.0.0.1");
        assert_eq!(child.pools[0].servers[0].port, 8080);
    }

    #[tokio::test]
    async fn unresolved_backend_leaves_the_child_building() {
        let (ingestor, _, _) = ingestor();
        // Ingress arrives before its service: order across kinds is never
        // assumed
        let shards = ingestor
            .handle(ObjectEvent::IngressApplied(Box::new(ingress_with(
                "foo.com", "/", "backend", 80, None,
            ))))
            .await;

        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(parent.children["foo.com"].state, ChildState::Building);

        // Backend lands later and the child goes Active
        let shards = ingestor
            .handle(ObjectEvent::ServiceApplied(Box::new(service_with("backend", 80))))
            .await;
        assert!(shards.is_empty(), "service alone does not resolve endpoints");
        let shards = ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1"],
                8080,
            ))))
            .await;
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(parent.children["foo.com"].state, ChildState::Active);
    }

    #[tokio::test]
    async fn identical_rebuild_enqueues_nothing() {
        let (ingestor, _, _) = ingestor();
        seed_route(&ingestor, "foo.com").await;

        let shards = ingestor
            .handle(ObjectEvent::IngressApplied(Box::new(ingress_with(
                "foo.com", "/", "backend", 80, None,
            ))))
            .await;
        assert!(shards.is_empty());
    }

    #[tokio::test]
    async fn endpoint_scale_grows_the_pool_in_place() {
        let (ingestor, _, _) = ingestor();
        let shards = seed_route(&ingestor, "foo.com").await;
        let before = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        let pool_name = before.children["foo.com"].pools[0].name.clone();

        let shards = ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1", "10.0.0.2"],
                8080,
            ))))
            .await;
        let after = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        let pool = &after.children["foo.com"].pools[0];
        assert_eq!(pool.servers.len(), 2);
        // Scaling endpoints never renames the pool or moves the parent
        assert_eq!(pool.name, pool_name);
        assert_eq!(after.name, before.name);
    }

    #[tokio::test]
    async fn ingress_delete_detaches_the_child() {
        let (ingestor, _, _) = ingestor();
        let shards = seed_route(&ingestor, "foo.com").await;

        let touched = ingestor
            .handle(ObjectEvent::IngressDeleted(ObjectKey::new("default", "test-ingress")))
            .await;
        assert_eq!(touched, shards);
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert!(parent.is_empty());
        assert!(ingestor.ingresses_for_host("foo.com").is_empty());
    }

    #[tokio::test]
    async fn secret_delete_downgrades_the_host_without_removing_routes() {
        let (ingestor, _, _) = ingestor();
        ingestor
            .handle(ObjectEvent::ServiceApplied(Box::new(service_with("backend", 80))))
            .await;
        ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1"],
                8080,
            ))))
            .await;
        ingestor
            .handle(ObjectEvent::SecretApplied(Box::new(secret_with("foo-tls"))))
            .await;
        let shards = ingestor
            .handle(ObjectEvent::IngressApplied(Box::new(ingress_with(
                "foo.com",
                "/",
                "backend",
                80,
                Some("foo-tls"),
            ))))
            .await;

        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(parent.children["foo.com"].certs.len(), 1);
        assert!(parent.redirect_hosts.contains("foo.com"));

        let shards = ingestor
            .handle(ObjectEvent::SecretDeleted(ObjectKey::new("default", "foo-tls")))
            .await;
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        let child = &parent.children["foo.com"];
        // Route survives, now insecure; the redirect rule is gone
        assert!(child.certs.is_empty());
        assert_eq!(child.pools.len(), 1);
        assert!(!parent.redirect_hosts.contains("foo.com"));
    }

    fn host_override_named(name: &str, fqdn: &str, waf: &str) -> HostOverride {
        let mut crd = HostOverride::new(
            name,
            HostOverrideSpec {
                fqdn: fqdn.to_string(),
                aliases: vec![],
                enable_virtual_host: None,
                tls: None,
                waf_policy: Some(waf.to_string()),
                application_profile: None,
                analytics_profile: None,
                error_page_profile: None,
                datascripts: vec![],
                http_policy_sets: vec![],
                listeners: vec![],
            },
        );
        crd.metadata.namespace = Some("default".to_string());
        crd
    }

    #[tokio::test]
    async fn rejected_override_never_touches_the_graph() {
        let (ingestor, log, cache) = ingestor();
        let shards = seed_route(&ingestor, "foo.com").await;

        let crd = host_override_named("foo-rules", "foo.com", "no-such-waf");
        let touched = ingestor
            .handle(ObjectEvent::HostOverrideApplied(Box::new(crd.clone())))
            .await;
        assert!(touched.is_empty());

        let writes = log.lock().unwrap().clone();
        assert_eq!(writes.len(), 1);
        let (kind, key, phase, error) = &writes[0];
        assert_eq!(*kind, CrdKind::HostOverride);
        assert_eq!(key.name, "foo-rules");
        assert_eq!(*phase, CrdPhase::Rejected);
        assert!(error.as_deref().unwrap().contains("no-such-waf"));

        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(parent.children["foo.com"].overrides.waf_policy, None);

        // Fixing the reference and re-submitting transitions to Accepted and
        // the override lands in the graph
        cache.put(ObjectKind::WafPolicy, "admin", "no-such-waf", CacheEntry::default());
        let touched = ingestor
            .handle(ObjectEvent::HostOverrideApplied(Box::new(crd)))
            .await;
        assert_eq!(touched, shards);

        let writes = log.lock().unwrap().clone();
        assert_eq!(writes.last().unwrap().2, CrdPhase::Accepted);
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(
            parent.children["foo.com"].overrides.waf_policy.as_deref(),
            Some("no-such-waf")
        );
    }

    #[tokio::test]
    async fn unchanged_admission_outcome_writes_status_once() {
        let (ingestor, log, _) = ingestor();
        seed_route(&ingestor, "foo.com").await;

        let crd = host_override_named("foo-rules", "foo.com", "missing-waf");
        ingestor
            .handle(ObjectEvent::HostOverrideApplied(Box::new(crd.clone())))
            .await;
        ingestor
            .handle(ObjectEvent::HostOverrideApplied(Box::new(crd)))
            .await;
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_an_accepted_override_reverts_the_child() {
        let (ingestor, _, cache) = ingestor();
        let shards = seed_route(&ingestor, "foo.com").await;

        cache.put(ObjectKind::WafPolicy, "admin", "strict-waf", CacheEntry::default());
        let crd = host_override_named("foo-rules", "foo.com", "strict-waf");
        ingestor
            .handle(ObjectEvent::HostOverrideApplied(Box::new(crd)))
            .await;
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert!(parent.children["foo.com"].overrides.waf_policy.is_some());

        ingestor
            .handle(ObjectEvent::HostOverrideDeleted(ObjectKey::new("default", "foo-rules")))
            .await;
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(parent.children["foo.com"].overrides.waf_policy, None);
    }

    #[tokio::test]
    async fn override_arriving_before_the_ingress_lands_on_first_build() {
        let (ingestor, _, cache) = ingestor();
        cache.put(ObjectKind::WafPolicy, "admin", "strict-waf", CacheEntry::default());

        let crd = host_override_named("foo-rules", "foo.com", "strict-waf");
        let touched = ingestor
            .handle(ObjectEvent::HostOverrideApplied(Box::new(crd)))
            .await;
        // No child yet: the override is stored, nothing to reconcile
        assert!(touched.is_empty());

        let shards = seed_route(&ingestor, "foo.com").await;
        let parent = ingestor.graph.parent_snapshot(&shards[0]).unwrap();
        assert_eq!(
            parent.children["foo.com"].overrides.waf_policy.as_deref(),
            Some("strict-waf")
        );
    }

    #[tokio::test]
    async fn two_hosts_under_one_shard_share_a_parent() {
        let (ingestor, _, _) = ingestor();
        ingestor
            .handle(ObjectEvent::ServiceApplied(Box::new(service_with("backend", 80))))
            .await;
        ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1"],
                8080,
            ))))
            .await;

        let mut a = ingress_with("foo.com", "/", "backend", 80, None);
        a.metadata.name = Some("ing-a".to_string());
        let mut b = ingress_with("bar.com", "/", "backend", 80, None);
        b.metadata.name = Some("ing-b".to_string());

        // SMALL shard size: one shared virtual service, both hosts collide
        let first = ingestor.handle(ObjectEvent::IngressApplied(Box::new(a))).await;
        let second = ingestor.handle(ObjectEvent::IngressApplied(Box::new(b))).await;
        assert_eq!(first, second);

        let parent = ingestor.graph.parent_snapshot(&first[0]).unwrap();
        assert_eq!(parent.children.len(), 2);
    }
}
