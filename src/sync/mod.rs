//! Sync engine: diff the graph against the cache, converge via REST
//!
//! `Reconciler::reconcile(shard)` is the unit of work. It snapshots the
//! shard's graph, computes an ordered operation list against the object
//! cache (creates and updates bottom-up, deletes children-first), issues the
//! operations through the [`rest::LbApi`] collaborator, applies successful
//! responses back into the cache, and classifies failures into fast-retry or
//! slow-retry lanes. Status write-back happens after a clean pass, so
//! Kubernetes objects never show a VIP that was not actually converged.

mod client;
pub mod rest;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

pub use client::RestClient;
pub use rest::{CreateResponse, LbApi, RemoteObject, RestOp, RestPatch};

use crate::cache::{CacheEntry, CacheKey, ObjectCache, ObjectKind, VsRefs};
use crate::error::RetryClass;
use crate::graph::{HttpPolicyNode, HttpRule, ParentVsNode, VsGraph, VsVipNode};
use crate::ingest::Ingestor;
use crate::naming::Namer;
use crate::queue::ShardQueue;
use crate::retry::RetryConfig;
use crate::shard::{ShardKey, ShardScheme};
use crate::status::StatusSink;
use crate::{Error, Result};

/// Shared handles every component works against
///
/// Constructed once at process start and passed by `Arc`; tests construct a
/// fresh context per test instead of relying on process-wide state.
pub struct Context {
    /// Object namer scoped to this cluster
    pub namer: Namer,
    /// Tenant all generated objects live under
    pub tenant: String,
    /// Active shard scheme
    pub scheme: ShardScheme,
    /// Desired-state graph forest
    pub graph: Arc<VsGraph>,
    /// Mirror of remote object state
    pub cache: Arc<ObjectCache>,
    /// Remote controller boundary
    pub api: Arc<dyn LbApi>,
    /// Kubernetes status write-back
    pub status: Arc<dyn StatusSink>,
    /// Ingestion layer, consulted for host → Ingress ownership
    pub ingestor: Arc<Ingestor>,
}

/// Result of one reconcile pass over a shard
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// REST operations issued (not skipped by checksum)
    pub issued: usize,
    /// Objects that failed, with their retry class
    pub failures: Vec<(String, RetryClass)>,
}

impl ReconcileReport {
    /// True when every operation succeeded
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The strongest retry demand among the failures
    fn retry_class(&self) -> Option<RetryClass> {
        if self.failures.iter().any(|(_, c)| *c == RetryClass::Fast) {
            Some(RetryClass::Fast)
        } else if self.failures.iter().any(|(_, c)| *c == RetryClass::Slow) {
            Some(RetryClass::Slow)
        } else {
            None
        }
    }
}

/// Per-shard diff-and-converge engine
pub struct Reconciler {
    ctx: Arc<Context>,
    /// Fast-lane attempt counts per shard, reset on a clean pass
    fast_attempts: DashMap<ShardKey, u32>,
    fast: RetryConfig,
    slow: RetryConfig,
}

impl Reconciler {
    /// Build a reconciler over the shared context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            fast_attempts: DashMap::new(),
            fast: RetryConfig::fast(),
            slow: RetryConfig::slow(),
        }
    }

    /// Reconcile one shard and schedule any retry on the queue
    ///
    /// This is the worker entry point: it never propagates errors, because
    /// a failed shard is retried, not crashed on.
    pub async fn run(&self, shard: ShardKey, queue: &Arc<ShardQueue>) {
        match self.reconcile(&shard).await {
            Ok(report) if report.is_clean() => {
                self.fast_attempts.remove(&shard);
                debug!(%shard, issued = report.issued, "reconcile clean");
            }
            Ok(report) => match report.retry_class() {
                Some(RetryClass::Fast) => {
                    let attempts = {
                        let mut entry = self.fast_attempts.entry(shard.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    if !self.fast.exhausted(attempts) {
                        warn!(%shard, attempts, "transient failures, fast retry");
                        queue.enqueue_after(shard, self.fast.delay_for(attempts));
                    } else {
                        // Exceeding the cap escalates to the slow lane
                        warn!(%shard, attempts, "fast retries exhausted, slow retry");
                        self.fast_attempts.remove(&shard);
                        queue.enqueue_after(shard, self.slow.delay_for(1));
                    }
                }
                _ => {
                    warn!(%shard, failures = report.failures.len(), "persistent failures, slow retry");
                    queue.enqueue_after(shard, self.slow.delay_for(1));
                }
            },
            Err(err) => {
                // Assertion-class failure: fatal to this pass only
                error!(%shard, error = %err, "reconcile aborted");
                queue.enqueue_after(shard, self.fast.delay_for(1));
            }
        }
    }

    /// Diff one shard against the cache and converge it
    ///
    /// Returns a report of issued operations and per-object failures; `Err`
    /// is reserved for invariant violations.
    pub async fn reconcile(&self, shard: &ShardKey) -> Result<ReconcileReport> {
        let tenant = self.ctx.tenant.clone();
        let parent_name = shard.as_str().to_string();
        let snapshot = self.ctx.graph.parent_snapshot(shard);

        let keep_parent = snapshot.as_ref().is_some_and(|p| !p.is_empty());
        let mut report = ReconcileReport::default();

        let (ops, desired_refs) = match snapshot.as_ref() {
            Some(parent) if keep_parent => self.plan_converge(parent)?,
            _ => (self.plan_teardown(&tenant, &parent_name)?, VsRefs::default()),
        };

        let mut failed_deletes: Vec<(ObjectKind, String)> = Vec::new();
        for op in ops {
            let (kind, _, name) = op.target();
            let name = name.to_string();
            let is_delete = matches!(op, RestOp::Delete { .. });
            match self.execute(&op).await {
                Ok(()) => report.issued += 1,
                Err(err) => {
                    let class = err.retry_class();
                    warn!(
                        %shard,
                        object = %name,
                        kind = kind.api_path(),
                        error = %err,
                        "rest operation failed"
                    );
                    if is_delete {
                        failed_deletes.push((kind, name.clone()));
                    }
                    // One object's failure does not block the rest of the
                    // shard; the shard as a whole is requeued afterwards
                    report.failures.push((name, class));
                }
            }
        }

        if keep_parent {
            // Record what this pass wanted, keeping names whose deletion
            // failed so they stay visible to the next diff
            let mut refs = desired_refs;
            for (kind, name) in failed_deletes {
                match kind {
                    ObjectKind::VirtualService => refs.children.insert(name),
                    ObjectKind::HttpPolicySet => refs.http_policies.insert(name),
                    ObjectKind::PoolGroup => refs.pool_groups.insert(name),
                    ObjectKind::Pool => refs.pools.insert(name),
                    ObjectKind::SslKeyCert => refs.ssl_certs.insert(name),
                    ObjectKind::VsVip => refs.vsvips.insert(name),
                    _ => false,
                };
            }
            self.ctx.cache.set_refs(&tenant, &parent_name, refs);
        } else {
            self.ctx.graph.drop_parent_if_empty(shard);
        }

        if report.is_clean() {
            if let Some(parent) = snapshot.as_ref().filter(|_| keep_parent) {
                self.report_statuses(parent).await;
            }
        }
        Ok(report)
    }

    /// Ordered operations converging a live parent tree
    ///
    /// Creates and updates run bottom-up (pools → pool groups → policies →
    /// certificates → child VS → VIP → parent VS); deletions of objects that
    /// fell out of the tree run children-first afterwards.
    fn plan_converge(&self, parent: &ParentVsNode) -> Result<(Vec<RestOp>, VsRefs)> {
        let tenant = &self.ctx.tenant;
        let cache = &self.ctx.cache;
        let mut ops = Vec::new();
        let mut refs = VsRefs::default();

        let redirect_policy = self.redirect_policy(parent);

        // Bottom-up creates and updates, skipping checksum-identical objects
        for child in parent.children.values() {
            for pool in &child.pools {
                refs.pools.insert(pool.name.clone());
                self.upsert(&mut ops, ObjectKind::Pool, &pool.name, rest::pool_body(pool));
            }
            for group in &child.pool_groups {
                refs.pool_groups.insert(group.name.clone());
                self.upsert(&mut ops, ObjectKind::PoolGroup, &group.name, rest::pool_group_body(group));
            }
            for policy in &child.http_policies {
                refs.http_policies.insert(policy.name.clone());
                self.upsert(&mut ops, ObjectKind::HttpPolicySet, &policy.name, rest::http_policy_body(policy));
            }
            for cert in &child.certs {
                refs.ssl_certs.insert(cert.name.clone());
                self.upsert(&mut ops, ObjectKind::SslKeyCert, &cert.name, rest::tls_cert_body(cert));
            }
        }
        if let Some(policy) = &redirect_policy {
            refs.http_policies.insert(policy.name.clone());
            self.upsert(&mut ops, ObjectKind::HttpPolicySet, &policy.name, rest::http_policy_body(policy));
        }
        for child in parent.children.values() {
            refs.children.insert(child.name.clone());
            self.upsert(
                &mut ops,
                ObjectKind::VirtualService,
                &child.name,
                rest::child_vs_body(child, parent),
            );
        }

        let vsvip = VsVipNode {
            name: parent.vip_ref.clone(),
            tenant: tenant.clone(),
            network: parent.vip_network.clone(),
            fqdns: parent.fqdns(),
        };
        refs.vsvips.insert(vsvip.name.clone());
        self.upsert(&mut ops, ObjectKind::VsVip, &vsvip.name, rest::vsvip_body(&vsvip));
        self.upsert(
            &mut ops,
            ObjectKind::VirtualService,
            &parent.name,
            rest::parent_vs_body(parent, redirect_policy.as_ref().map(|p| p.name.as_str())),
        );

        // Children-first deletes for everything the last pass owned that
        // this tree no longer wants
        let old_refs = cache.refs(tenant, &parent.name).unwrap_or_default();
        let stale_children: Vec<String> = old_refs
            .children
            .difference(&refs.children)
            .cloned()
            .collect();
        if !stale_children.is_empty() {
            // Unlink from the parent before deleting, so the controller
            // never sees a reference to a vanished child
            if let Some(entry) = cache.get(ObjectKind::VirtualService, tenant, &parent.name) {
                let remaining: Vec<String> = refs.children.iter().cloned().collect();
                ops.push(RestOp::Patch {
                    kind: ObjectKind::VirtualService,
                    tenant: tenant.clone(),
                    name: parent.name.clone(),
                    uuid: entry.uuid,
                    patch: RestPatch::VsChildren(remaining),
                });
            }
            for name in &stale_children {
                self.delete(&mut ops, ObjectKind::VirtualService, name);
            }
        }
        for (kind, old, new) in [
            (ObjectKind::HttpPolicySet, &old_refs.http_policies, &refs.http_policies),
            (ObjectKind::PoolGroup, &old_refs.pool_groups, &refs.pool_groups),
            (ObjectKind::Pool, &old_refs.pools, &refs.pools),
            (ObjectKind::SslKeyCert, &old_refs.ssl_certs, &refs.ssl_certs),
        ] {
            for name in old.difference(new) {
                self.delete(&mut ops, kind, name);
            }
        }

        Ok((ops, refs))
    }

    /// Ordered operations removing a parent tree that lost its last child
    ///
    /// Cascade order: child virtual services, then policies, pool groups,
    /// pools, and certificates, then the parent itself, then its VIP.
    fn plan_teardown(&self, tenant: &str, parent_name: &str) -> Result<Vec<RestOp>> {
        let cache = &self.ctx.cache;
        let mut ops = Vec::new();

        let Some(parent_entry) = cache.get(ObjectKind::VirtualService, tenant, parent_name) else {
            // Never converged, nothing to remove
            return Ok(ops);
        };
        let refs = cache.refs(tenant, parent_name).unwrap_or_default();

        for name in &refs.children {
            self.delete(&mut ops, ObjectKind::VirtualService, name);
        }
        for (kind, names) in [
            (ObjectKind::HttpPolicySet, &refs.http_policies),
            (ObjectKind::PoolGroup, &refs.pool_groups),
            (ObjectKind::Pool, &refs.pools),
            (ObjectKind::SslKeyCert, &refs.ssl_certs),
        ] {
            for name in names {
                self.delete(&mut ops, kind, name);
            }
        }
        ops.push(RestOp::Delete {
            kind: ObjectKind::VirtualService,
            tenant: tenant.to_string(),
            name: parent_name.to_string(),
            uuid: parent_entry.uuid,
        });
        for name in &refs.vsvips {
            self.delete(&mut ops, ObjectKind::VsVip, name);
        }

        // The plan must remove every cached child before the parent; any
        // other shape is a bug in this planner, not an input condition
        let children_deleted: HashSet<&str> = ops
            .iter()
            .filter_map(|op| match op {
                RestOp::Delete { kind: ObjectKind::VirtualService, name, .. } if name != parent_name => {
                    Some(name.as_str())
                }
                _ => None,
            })
            .collect();
        for child in &refs.children {
            if !children_deleted.contains(child.as_str()) {
                return Err(Error::invariant(format!(
                    "teardown of {parent_name} would orphan child {child}"
                )));
            }
        }

        Ok(ops)
    }

    /// The synthesized HTTP→HTTPS redirect policy for a parent, if any host
    /// needs one
    fn redirect_policy(&self, parent: &ParentVsNode) -> Option<HttpPolicyNode> {
        if parent.redirect_hosts.is_empty() {
            return None;
        }
        Some(HttpPolicyNode {
            name: format!("{}-redirect", parent.name),
            tenant: self.ctx.tenant.clone(),
            rules: parent
                .redirect_hosts
                .iter()
                .map(|host| HttpRule::Redirect {
                    host: host.clone(),
                    port: 443,
                })
                .collect(),
        })
    }

    /// Emit a create or update for one object unless its checksum matches
    fn upsert(&self, ops: &mut Vec<RestOp>, kind: ObjectKind, name: &str, mut body: serde_json::Value) {
        let checksum = rest::body_checksum(&body);
        // Stamp the checksum so inventory pulls can rebuild the cache
        body["cloud_config_cksum"] = serde_json::json!(checksum.to_string());

        let tenant = self.ctx.tenant.clone();
        match self.ctx.cache.get(kind, &tenant, name) {
            None => ops.push(RestOp::Create {
                kind,
                tenant,
                name: name.to_string(),
                body,
                checksum,
            }),
            Some(entry) if entry.checksum != checksum => ops.push(RestOp::Update {
                kind,
                tenant,
                name: name.to_string(),
                uuid: entry.uuid,
                body,
                checksum,
            }),
            Some(_) => {}
        }
    }

    /// Emit a delete for one cached object
    fn delete(&self, ops: &mut Vec<RestOp>, kind: ObjectKind, name: &str) {
        let tenant = self.ctx.tenant.clone();
        if let Some(entry) = self.ctx.cache.get(kind, &tenant, name) {
            ops.push(RestOp::Delete {
                kind,
                tenant,
                name: name.to_string(),
                uuid: entry.uuid,
            });
        }
    }

    /// Issue one operation and fold the response into the cache
    async fn execute(&self, op: &RestOp) -> Result<()> {
        let api = &self.ctx.api;
        let cache = &self.ctx.cache;
        match op {
            RestOp::Create { kind, tenant, name, body, checksum } => {
                let response = api.create(*kind, tenant, body).await?;
                cache.put(*kind, tenant, name, CacheEntry { uuid: response.uuid, checksum: *checksum });
                if *kind == ObjectKind::VsVip {
                    if let Some(vip) = response.vip {
                        cache.set_vip(tenant, name, vip);
                    }
                }
                Ok(())
            }
            RestOp::Update { kind, tenant, name, uuid, body, checksum } => {
                api.update(*kind, tenant, uuid, body).await?;
                cache.put(*kind, tenant, name, CacheEntry { uuid: uuid.clone(), checksum: *checksum });
                Ok(())
            }
            RestOp::Patch { kind, tenant, uuid, patch, .. } => api.patch(*kind, tenant, uuid, patch).await,
            RestOp::Delete { kind, tenant, name, uuid } => {
                match api.delete(*kind, tenant, uuid).await {
                    Ok(()) => {}
                    // Object already absent: the desired end state holds
                    Err(err) if err.is_not_found() => {
                        debug!(name, "delete target already absent");
                    }
                    Err(err) => return Err(err),
                }
                cache.delete(*kind, tenant, name);
                Ok(())
            }
        }
    }

    /// Project converged VIPs onto the Ingress objects behind each host
    async fn report_statuses(&self, parent: &ParentVsNode) {
        let Some(vip) = self.ctx.cache.vip(&self.ctx.tenant, &parent.vip_ref) else {
            return;
        };
        for child in parent.children.values() {
            for ingress in self.ctx.ingestor.ingresses_for_host(&child.host) {
                if let Err(err) = self
                    .ctx
                    .status
                    .report_ingress(&ingress, &child.host, Some(&vip))
                    .await
                {
                    // Retried on the next pass of this shard
                    warn!(ingress = %ingress, error = %err, "ingress status write failed");
                }
            }
        }
    }
}

/// Periodic full sync healing cache drift
///
/// Re-derives the cache from a remote inventory pull and enqueues every
/// known shard. Supports an out-of-band "run now" trigger (dropped rather
/// than queued when one is already pending) and a distinct shutdown signal.
pub struct FullSync {
    ctx: Arc<Context>,
    queue: Arc<ShardQueue>,
    period: Duration,
    run_now: Arc<Notify>,
}

impl FullSync {
    /// Build a full-sync task over the shared context
    pub fn new(ctx: Arc<Context>, queue: Arc<ShardQueue>, period: Duration) -> Self {
        Self {
            ctx,
            queue,
            period,
            run_now: Arc::new(Notify::new()),
        }
    }

    /// Handle for requesting an immediate sync
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.run_now)
    }

    /// Pull the remote inventory and rebuild the cache
    ///
    /// Also called once at startup to seed the cache before any
    /// reconciliation runs.
    pub async fn seed(&self) -> Result<()> {
        let tenant = &self.ctx.tenant;
        let mut inventory: Vec<(ObjectKind, CacheKey, CacheEntry)> = Vec::new();
        let mut vips: Vec<(String, String)> = Vec::new();
        let mut child_parents: Vec<(String, String)> = Vec::new();

        for kind in ObjectKind::INVENTORY {
            for object in self.ctx.api.list_by_tenant(kind, tenant).await? {
                if kind == ObjectKind::VsVip {
                    if let Some(vip) = &object.vip {
                        vips.push((object.name.clone(), vip.clone()));
                    }
                }
                if kind == ObjectKind::VirtualService {
                    if let Some(parent) = &object.parent {
                        child_parents.push((parent.clone(), object.name.clone()));
                    }
                }
                inventory.push((
                    kind,
                    CacheKey::new(tenant.clone(), object.name),
                    CacheEntry { uuid: object.uuid, checksum: object.checksum },
                ));
            }
        }
        let count = inventory.len();
        self.ctx.cache.seed(inventory);
        for (name, vip) in vips {
            self.ctx.cache.set_vip(tenant, &name, vip);
        }
        // Rebuild parent → child linkage so teardown after a restart still
        // cascades children-first
        let mut by_parent: std::collections::HashMap<String, VsRefs> = Default::default();
        for (parent, child) in child_parents {
            by_parent.entry(parent).or_default().children.insert(child);
        }
        for (parent, mut refs) in by_parent {
            if let Some(existing) = self.ctx.cache.refs(tenant, &parent) {
                refs.pools = existing.pools;
                refs.pool_groups = existing.pool_groups;
                refs.http_policies = existing.http_policies;
                refs.ssl_certs = existing.ssl_certs;
                refs.vsvips = existing.vsvips;
            }
            self.ctx.cache.set_refs(tenant, &parent, refs);
        }
        info!(objects = count, "cache seeded from controller inventory");
        Ok(())
    }

    /// Shards to reconcile after a sync: everything in the graph, plus any
    /// remote parent this cluster owns that the graph no longer knows
    fn shards_to_enqueue(&self) -> Vec<ShardKey> {
        let tenant = &self.ctx.tenant;
        let mut shards: HashSet<ShardKey> = self.ctx.graph.shards().into_iter().collect();
        for name in self.ctx.cache.names(ObjectKind::VirtualService, tenant) {
            if !self.ctx.namer.owns(&name) || !self.looks_like_parent(&name) {
                continue;
            }
            // Child virtual services are reconciled via their parent
            if self.ctx.cache.is_child_vs(tenant, &name) {
                continue;
            }
            shards.insert(ShardKey(name));
        }
        shards.into_iter().collect()
    }

    /// Parent names follow the shard-key grammar
    fn looks_like_parent(&self, name: &str) -> bool {
        name.contains("Shared-L7") || name.ends_with("-L7") || name.ends_with("-L7-dedicated")
    }

    /// Run until shutdown, syncing every period or on demand
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the startup seed
        // (already run by the caller) is not repeated
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.run_now.notified() => {
                    info!("full sync triggered out-of-band");
                }
                _ = shutdown.changed() => {
                    info!("full sync task stopping");
                    return;
                }
            }
            match self.seed().await {
                Ok(()) => {
                    for shard in self.shards_to_enqueue() {
                        self.queue.enqueue(shard);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "full sync failed, keeping previous cache");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::config::ControllerConfig;
    use crate::crd::CrdStatus;
    use crate::ingest::test_fixtures::*;
    use crate::ingest::{Ingestor, ObjectEvent, ObjectKey};
    use crate::status::CrdKind;

    /// In-memory remote controller recording every operation in order
    #[derive(Default)]
    struct FakeLbApi {
        log: Mutex<Vec<String>>,
        objects: Mutex<HashMap<(&'static str, String), Value>>,
        /// Object name → HTTP status to fail with (0 means transport error)
        fail: Mutex<HashMap<String, u16>>,
        /// UUIDs whose delete returns 404
        vanished: Mutex<Vec<String>>,
        next_uuid: AtomicUsize,
    }

    impl FakeLbApi {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn fail_object(&self, name: &str, status: u16) {
            self.fail.lock().unwrap().insert(name.to_string(), status);
        }

        fn clear_failures(&self) {
            self.fail.lock().unwrap().clear();
        }

        fn object(&self, kind: ObjectKind, name: &str) -> Option<Value> {
            self.objects
                .lock()
                .unwrap()
                .get(&(kind.api_path(), name.to_string()))
                .cloned()
        }

        fn object_count(&self) -> usize {
            self.objects.lock().unwrap().len()
        }

        fn check_failure(&self, name: &str) -> Result<()> {
            match self.fail.lock().unwrap().get(name) {
                Some(0) => Err(Error::transient("connection reset")),
                Some(status) => Err(Error::api(*status, "injected failure")),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl LbApi for FakeLbApi {
        async fn create(&self, kind: ObjectKind, _tenant: &str, body: &Value) -> Result<CreateResponse> {
            let name = body["name"].as_str().unwrap_or_default().to_string();
            self.log.lock().unwrap().push(format!("POST {} {}", kind.api_path(), name));
            self.check_failure(&name)?;
            let uuid = format!("uuid-{}", self.next_uuid.fetch_add(1, Ordering::SeqCst));
            let mut stored = body.clone();
            stored["uuid"] = serde_json::json!(uuid);
            self.objects.lock().unwrap().insert((kind.api_path(), name), stored);
            Ok(CreateResponse {
                uuid,
                vip: (kind == ObjectKind::VsVip).then(|| "10.10.10.1".to_string()),
            })
        }

        async fn update(&self, kind: ObjectKind, _tenant: &str, uuid: &str, body: &Value) -> Result<()> {
            let name = body["name"].as_str().unwrap_or_default().to_string();
            self.log.lock().unwrap().push(format!("PUT {} {}", kind.api_path(), name));
            self.check_failure(&name)?;
            let mut stored = body.clone();
            stored["uuid"] = serde_json::json!(uuid);
            self.objects.lock().unwrap().insert((kind.api_path(), name), stored);
            Ok(())
        }

        async fn patch(&self, kind: ObjectKind, _tenant: &str, uuid: &str, _patch: &RestPatch) -> Result<()> {
            self.log.lock().unwrap().push(format!("PATCH {} {}", kind.api_path(), uuid));
            Ok(())
        }

        async fn delete(&self, kind: ObjectKind, _tenant: &str, uuid: &str) -> Result<()> {
            self.log.lock().unwrap().push(format!("DELETE {} {}", kind.api_path(), uuid));
            if self.vanished.lock().unwrap().contains(&uuid.to_string()) {
                return Err(Error::api(404, "object not found"));
            }
            self.objects
                .lock()
                .unwrap()
                .retain(|_, v| v["uuid"].as_str() != Some(uuid));
            Ok(())
        }

        async fn list_by_tenant(&self, kind: ObjectKind, _tenant: &str) -> Result<Vec<RemoteObject>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|((path, _), _)| *path == kind.api_path())
                .map(|((_, name), body)| RemoteObject {
                    name: name.clone(),
                    uuid: body["uuid"].as_str().unwrap_or_default().to_string(),
                    checksum: body["cloud_config_cksum"]
                        .as_str()
                        .and_then(|c| c.parse().ok())
                        .unwrap_or(0),
                    vip: (kind == ObjectKind::VsVip).then(|| "10.10.10.1".to_string()),
                    parent: body["vh_parent_vs_ref"]
                        .as_str()
                        .and_then(|r| r.split("name=").nth(1))
                        .map(String::from),
                })
                .collect())
        }
    }

    /// Status sink recording ingress writes
    #[derive(Default)]
    struct RecordingStatus {
        ingress: Mutex<Vec<(ObjectKey, String, Option<String>)>>,
    }

    #[async_trait]
    impl StatusSink for RecordingStatus {
        async fn report_ingress<'a>(
            &self,
            ingress: &ObjectKey,
            hostname: &str,
            vip: Option<&'a str>,
        ) -> Result<()> {
            self.ingress.lock().unwrap().push((
                ingress.clone(),
                hostname.to_string(),
                vip.map(String::from),
            ));
            Ok(())
        }

        async fn report_crd(&self, _: CrdKind, _: &ObjectKey, _: &CrdStatus) -> Result<()> {
            Ok(())
        }
    }

    struct TestBed {
        reconciler: Reconciler,
        ingestor: Arc<Ingestor>,
        api: Arc<FakeLbApi>,
        status: Arc<RecordingStatus>,
        ctx: Arc<Context>,
    }

    fn testbed() -> TestBed {
        let config = ControllerConfig::for_tests("c");
        let graph = Arc::new(VsGraph::new());
        let cache = Arc::new(ObjectCache::new());
        let api = Arc::new(FakeLbApi::default());
        let status = Arc::new(RecordingStatus::default());
        let status_sink: Arc<dyn StatusSink> = status.clone();
        let ingestor = Arc::new(Ingestor::new(
            &config,
            Arc::clone(&graph),
            Arc::clone(&cache),
            Arc::clone(&status_sink),
        ));
        let ctx = Arc::new(Context {
            namer: config.namer(),
            tenant: config.tenant.clone(),
            scheme: config.shard_scheme(),
            graph,
            cache,
            api: api.clone(),
            status: status_sink,
            ingestor: Arc::clone(&ingestor),
        });
        TestBed {
            reconciler: Reconciler::new(Arc::clone(&ctx)),
            ingestor,
            api,
            status,
            ctx,
        }
    }

    async fn seed_route(bed: &TestBed, host: &str) -> ShardKey {
        bed.ingestor
            .handle(ObjectEvent::ServiceApplied(Box::new(service_with("backend", 80))))
            .await;
        bed.ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1"],
                8080,
            ))))
            .await;
        let shards = bed
            .ingestor
            .handle(ObjectEvent::IngressApplied(Box::new(ingress_with(
                host, "/", "backend", 80, None,
            ))))
            .await;
        shards.into_iter().next().expect("ingress must touch a shard")
    }

    fn op_kinds(log: &[String]) -> Vec<String> {
        log.iter()
            .map(|entry| {
                let mut parts = entry.splitn(3, ' ');
                format!("{} {}", parts.next().unwrap(), parts.next().unwrap())
            })
            .collect()
    }

    #[tokio::test]
    async fn first_reconcile_creates_the_tree_bottom_up() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;

        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(report.is_clean());

        assert_eq!(
            op_kinds(&bed.api.log()),
            vec![
                "POST pool",
                "POST poolgroup",
                "POST httppolicyset",
                "POST virtualservice", // child
                "POST vsvip",
                "POST virtualservice", // parent
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_twice_issues_nothing_the_second_time() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;

        let first = bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(first.issued > 0);

        let second = bed.reconciler.reconcile(&shard).await.unwrap();
        assert_eq!(second.issued, 0, "diff against the updated cache must be empty");
    }

    #[tokio::test]
    async fn converged_host_reports_its_vip_once_per_ingress() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;
        bed.reconciler.reconcile(&shard).await.unwrap();

        let writes = bed.status.ingress.lock().unwrap().clone();
        assert_eq!(writes.len(), 1);
        let (ingress, host, vip) = &writes[0];
        assert_eq!(ingress, &ObjectKey::new("default", "test-ingress"));
        assert_eq!(host, "foo.com");
        assert_eq!(vip.as_deref(), Some("10.10.10.1"));

        // And the pool behind it has exactly the one resolved endpoint
        let parent = bed.ctx.graph.parent_snapshot(&shard).unwrap();
        let pool_name = &parent.children["foo.com"].pools[0].name;
        let body = bed.api.object(ObjectKind::Pool, pool_name).unwrap();
        assert_eq!(body["servers"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn endpoint_scale_updates_only_the_pool() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;
        bed.reconciler.reconcile(&shard).await.unwrap();

        bed.ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1", "10.0.0.2"],
                8080,
            ))))
            .await;
        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        // The pool is re-PUT in full; nothing else changed, so nothing else
        // is sent
        assert_eq!(report.issued, 1);
        assert_eq!(bed.api.log().last().unwrap().split(' ').nth(1), Some("pool"));

        let parent = bed.ctx.graph.parent_snapshot(&shard).unwrap();
        let pool_name = &parent.children["foo.com"].pools[0].name;
        let body = bed.api.object(ObjectKind::Pool, pool_name).unwrap();
        assert_eq!(body["servers"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn removing_the_last_child_cascades_every_object_away() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;
        bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(bed.api.object_count() > 0);

        bed.ingestor
            .handle(ObjectEvent::IngressDeleted(ObjectKey::new("default", "test-ingress")))
            .await;
        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(report.is_clean());

        // No orphaned pool survives its owning child's removal
        assert_eq!(bed.api.object_count(), 0);
        assert!(bed.ctx.cache.is_empty());
        assert!(bed.ctx.graph.parent_snapshot(&shard).is_none());

        // Deletes ran children-first: child VS before parent VS, leaves in
        // between
        let log = bed.api.log();
        let deletes: Vec<&String> = log.iter().filter(|l| l.starts_with("DELETE")).collect();
        assert!(deletes.first().unwrap().contains("virtualservice"));
        assert!(deletes.last().unwrap().contains("vsvip"));
    }

    #[tokio::test]
    async fn not_found_on_delete_counts_as_success() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;
        bed.reconciler.reconcile(&shard).await.unwrap();

        // Every delete target has already vanished out-of-band
        {
            let objects = bed.api.objects.lock().unwrap();
            let mut vanished = bed.api.vanished.lock().unwrap();
            for body in objects.values() {
                vanished.push(body["uuid"].as_str().unwrap().to_string());
            }
        }

        bed.ingestor
            .handle(ObjectEvent::IngressDeleted(ObjectKey::new("default", "test-ingress")))
            .await;
        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(report.is_clean(), "absent is the desired end state");
        assert!(bed.ctx.cache.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_classifies_fast_and_spares_other_objects() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;

        let parent = bed.ctx.graph.parent_snapshot(&shard).unwrap();
        let pool_name = parent.children["foo.com"].pools[0].name.clone();
        bed.api.fail_object(&pool_name, 503);

        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].1, RetryClass::Fast);
        // The rest of the shard still converged
        assert!(report.issued >= 4);
        // Unconverged shards never surface a VIP
        assert!(bed.status.ingress.lock().unwrap().is_empty());

        // The failure heals on retry
        bed.api.clear_failures();
        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(bed.status.ingress.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_classifies_slow() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;

        let parent = bed.ctx.graph.parent_snapshot(&shard).unwrap();
        let pool_name = parent.children["foo.com"].pools[0].name.clone();
        bed.api.fail_object(&pool_name, 400);

        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert_eq!(report.failures[0].1, RetryClass::Slow);
    }

    #[tokio::test]
    async fn secret_rotation_swaps_cert_and_redirect() {
        let bed = testbed();
        bed.ingestor
            .handle(ObjectEvent::ServiceApplied(Box::new(service_with("backend", 80))))
            .await;
        bed.ingestor
            .handle(ObjectEvent::EndpointsApplied(Box::new(endpoints_with(
                "backend",
                &["10.0.0.1"],
                8080,
            ))))
            .await;
        bed.ingestor
            .handle(ObjectEvent::SecretApplied(Box::new(secret_with("foo-tls"))))
            .await;
        let shard = bed
            .ingestor
            .handle(ObjectEvent::IngressApplied(Box::new(ingress_with(
                "foo.com",
                "/",
                "backend",
                80,
                Some("foo-tls"),
            ))))
            .await
            .into_iter()
            .next()
            .unwrap();

        bed.reconciler.reconcile(&shard).await.unwrap();
        let cert_name = bed.ctx.namer.cert_name("default", "foo-tls");
        let redirect_name = format!("{}-redirect", shard.as_str());
        assert!(bed.api.object(ObjectKind::SslKeyCert, &cert_name).is_some());
        assert!(bed.api.object(ObjectKind::HttpPolicySet, &redirect_name).is_some());

        // Secret deleted: cert and redirect go away, the route stays
        bed.ingestor
            .handle(ObjectEvent::SecretDeleted(ObjectKey::new("default", "foo-tls")))
            .await;
        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert!(report.is_clean());
        assert!(bed.api.object(ObjectKind::SslKeyCert, &cert_name).is_none());
        assert!(bed.api.object(ObjectKind::HttpPolicySet, &redirect_name).is_none());

        let parent = bed.ctx.graph.parent_snapshot(&shard).unwrap();
        let child_name = &parent.children["foo.com"].name;
        let child_body = bed.api.object(ObjectKind::VirtualService, child_name).unwrap();
        assert_eq!(
            child_body["ssl_key_and_certificate_refs"].as_array().unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn full_sync_seed_rebuilds_the_cache() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;
        bed.reconciler.reconcile(&shard).await.unwrap();
        let converged_len = bed.ctx.cache.len();

        // A fresh process: empty cache, same remote state
        let queue = ShardQueue::new(1);
        let full_sync = FullSync::new(Arc::clone(&bed.ctx), queue, Duration::from_secs(3600));
        bed.ctx.cache.seed(vec![]);
        assert!(bed.ctx.cache.is_empty());

        full_sync.seed().await.unwrap();
        assert_eq!(bed.ctx.cache.len(), converged_len);

        // Checksums round-tripped through cloud_config_cksum, so the next
        // reconcile finds nothing to do
        let report = bed.reconciler.reconcile(&shard).await.unwrap();
        assert_eq!(report.issued, 0);
    }

    #[tokio::test]
    async fn full_sync_enqueues_stale_remote_parents() {
        let bed = testbed();
        let shard = seed_route(&bed, "foo.com").await;
        bed.reconciler.reconcile(&shard).await.unwrap();

        // Simulate a restart that lost the routing source: graph empty,
        // remote objects linger
        bed.ingestor
            .handle(ObjectEvent::IngressDeleted(ObjectKey::new("default", "test-ingress")))
            .await;
        bed.ctx.graph.drop_parent_if_empty(&shard);

        let queue = ShardQueue::new(1);
        let full_sync = FullSync::new(Arc::clone(&bed.ctx), Arc::clone(&queue), Duration::from_secs(3600));
        full_sync.seed().await.unwrap();
        let shards = full_sync.shards_to_enqueue();
        assert!(shards.contains(&shard), "stale remote parent must be reconciled away");
    }
}
