//! Mirror of remote controller object state
//!
//! Keyed by (tenant, name) per object kind, each entry holding the remote
//! UUID and a checksum of the last-known-applied content. Virtual-service
//! entries additionally carry back-reference sets of child object keys,
//! recomputed on every sync pass, so objects removed from the desired graph
//! but still present remotely are detected and scheduled for deletion.
//!
//! The cache is seeded at startup by a full inventory pull and thereafter
//! kept in sync exclusively by successful REST responses; it never reflects
//! speculative or in-flight state.

use std::collections::HashSet;

use dashmap::DashMap;

/// Kinds of remote controller objects Trellis mirrors
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Parent or child virtual service
    VirtualService,
    /// VIP object backing a virtual service
    VsVip,
    /// Backend pool
    Pool,
    /// Weighted pool collection
    PoolGroup,
    /// HTTP policy set
    HttpPolicySet,
    /// Certificate and key pair
    SslKeyCert,
    /// SSL profile
    SslProfile,
    /// PKI profile
    PkiProfile,
    /// WAF policy
    WafPolicy,
    /// Application profile
    ApplicationProfile,
    /// Analytics profile
    AnalyticsProfile,
    /// Error-page profile
    ErrorPageProfile,
    /// Health monitor
    HealthMonitor,
    /// Datascript
    Datascript,
    /// Auth profile for OAuth
    AuthProfile,
    /// SSO policy object
    SsoPolicy,
    /// Service-engine group
    ServiceEngineGroup,
    /// VIP network
    Network,
}

impl ObjectKind {
    /// REST path segment for this kind on the remote controller
    pub fn api_path(self) -> &'static str {
        match self {
            Self::VirtualService => "virtualservice",
            Self::VsVip => "vsvip",
            Self::Pool => "pool",
            Self::PoolGroup => "poolgroup",
            Self::HttpPolicySet => "httppolicyset",
            Self::SslKeyCert => "sslkeyandcertificate",
            Self::SslProfile => "sslprofile",
            Self::PkiProfile => "pkiprofile",
            Self::WafPolicy => "wafpolicy",
            Self::ApplicationProfile => "applicationprofile",
            Self::AnalyticsProfile => "analyticsprofile",
            Self::ErrorPageProfile => "errorpageprofile",
            Self::HealthMonitor => "healthmonitor",
            Self::Datascript => "vsdatascriptset",
            Self::AuthProfile => "authprofile",
            Self::SsoPolicy => "ssopolicy",
            Self::ServiceEngineGroup => "serviceenginegroup",
            Self::Network => "network",
        }
    }

    /// Kinds pulled during the startup inventory and full sync
    pub const INVENTORY: [ObjectKind; 18] = [
        Self::VirtualService,
        Self::VsVip,
        Self::Pool,
        Self::PoolGroup,
        Self::HttpPolicySet,
        Self::SslKeyCert,
        Self::SslProfile,
        Self::PkiProfile,
        Self::WafPolicy,
        Self::ApplicationProfile,
        Self::AnalyticsProfile,
        Self::ErrorPageProfile,
        Self::HealthMonitor,
        Self::Datascript,
        Self::AuthProfile,
        Self::SsoPolicy,
        Self::ServiceEngineGroup,
        Self::Network,
    ];
}

/// Tenant-scoped object key
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CacheKey {
    /// Remote tenant
    pub tenant: String,
    /// Remote object name
    pub name: String,
}

impl CacheKey {
    /// Build a key from tenant and name
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
        }
    }
}

/// Mirror of one remote object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheEntry {
    /// Remote UUID, assigned by the controller on create
    pub uuid: String,
    /// Checksum of the last-known-applied content
    pub checksum: u32,
}

/// Back-references from a virtual service to the objects it owns
///
/// Enables cascade-aware diffing: everything reachable from a parent's refs
/// that is absent from the desired graph gets deleted, children first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VsRefs {
    /// Pool names referenced by this VS tree
    pub pools: HashSet<String>,
    /// Pool-group names referenced by this VS tree
    pub pool_groups: HashSet<String>,
    /// HTTP policy set names referenced by this VS tree
    pub http_policies: HashSet<String>,
    /// Certificate names referenced by this VS tree
    pub ssl_certs: HashSet<String>,
    /// VIP object names referenced by this VS
    pub vsvips: HashSet<String>,
    /// Child virtual-service names under this parent
    pub children: HashSet<String>,
}

/// Tenant/name-keyed mirror of remote object state
///
/// Safe for concurrent readers; the worker-pool partitioning guarantees a
/// single logical writer per key. A `put` replaces the entire entry
/// atomically from the caller's perspective.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: DashMap<(ObjectKind, CacheKey), CacheEntry>,
    vs_refs: DashMap<CacheKey, VsRefs>,
    /// VIP addresses allocated by the controller, keyed by VsVip object
    vips: DashMap<CacheKey, String>,
}

impl ObjectCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch one entry
    pub fn get(&self, kind: ObjectKind, tenant: &str, name: &str) -> Option<CacheEntry> {
        self.objects
            .get(&(kind, CacheKey::new(tenant, name)))
            .map(|e| e.clone())
    }

    /// Insert or replace one entry
    pub fn put(&self, kind: ObjectKind, tenant: &str, name: &str, entry: CacheEntry) {
        self.objects.insert((kind, CacheKey::new(tenant, name)), entry);
    }

    /// Remove one entry (and its back-references for virtual services)
    pub fn delete(&self, kind: ObjectKind, tenant: &str, name: &str) {
        let key = CacheKey::new(tenant, name);
        match kind {
            ObjectKind::VirtualService => {
                self.vs_refs.remove(&key);
            }
            ObjectKind::VsVip => {
                self.vips.remove(&key);
            }
            _ => {}
        }
        self.objects.remove(&(kind, key));
    }

    /// Cheap existence + equality check used by the diff step
    pub fn checksum(&self, kind: ObjectKind, tenant: &str, name: &str) -> Option<u32> {
        self.objects
            .get(&(kind, CacheKey::new(tenant, name)))
            .map(|e| e.checksum)
    }

    /// True when an object of this kind and name exists in the mirror
    pub fn contains(&self, kind: ObjectKind, tenant: &str, name: &str) -> bool {
        self.objects.contains_key(&(kind, CacheKey::new(tenant, name)))
    }

    /// Back-references recorded for a virtual service
    pub fn refs(&self, tenant: &str, name: &str) -> Option<VsRefs> {
        self.vs_refs.get(&CacheKey::new(tenant, name)).map(|r| r.clone())
    }

    /// Replace the back-reference sets for a virtual service
    ///
    /// Recomputed on every sync pass from the desired graph, so the refs
    /// always describe the last converged tree.
    pub fn set_refs(&self, tenant: &str, name: &str, refs: VsRefs) {
        self.vs_refs.insert(CacheKey::new(tenant, name), refs);
    }

    /// VIP address allocated for a VsVip object, once known
    pub fn vip(&self, tenant: &str, vsvip_name: &str) -> Option<String> {
        self.vips.get(&CacheKey::new(tenant, vsvip_name)).map(|v| v.clone())
    }

    /// Record the VIP address the controller allocated for a VsVip object
    pub fn set_vip(&self, tenant: &str, vsvip_name: &str, vip: String) {
        self.vips.insert(CacheKey::new(tenant, vsvip_name), vip);
    }

    /// Replace the whole mirror from a remote inventory pull
    ///
    /// Back-reference sets are preserved for virtual services that survive
    /// the pull; the next reconciliation recomputes them anyway.
    pub fn seed<I>(&self, inventory: I)
    where
        I: IntoIterator<Item = (ObjectKind, CacheKey, CacheEntry)>,
    {
        self.objects.clear();
        for (kind, key, entry) in inventory {
            self.objects.insert((kind, key), entry);
        }
        self.vs_refs
            .retain(|key, _| self.objects.contains_key(&(ObjectKind::VirtualService, key.clone())));
    }

    /// True when a virtual service is recorded as some parent's child
    pub fn is_child_vs(&self, tenant: &str, name: &str) -> bool {
        self.vs_refs
            .iter()
            .any(|entry| entry.key().tenant == tenant && entry.value().children.contains(name))
    }

    /// Names of every mirrored object of one kind under a tenant
    pub fn names(&self, kind: ObjectKind, tenant: &str) -> Vec<String> {
        self.objects
            .iter()
            .filter(|e| e.key().0 == kind && e.key().1.tenant == tenant)
            .map(|e| e.key().1.name.clone())
            .collect()
    }

    /// Number of mirrored objects, across all kinds
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the mirror holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
