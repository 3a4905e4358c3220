//! In-memory forest of desired virtual-service state
//!
//! One graph per shard key, each holding a parent virtual-service node and
//! its child virtual hosts. Mutation methods are synchronous, leave the
//! graph structurally valid, and never perform I/O: the graph only ever
//! mutates in-memory state, and the caller enqueues the affected shard for
//! reconciliation afterwards.
//!
//! DashMap gives concurrent access without a global lock; the worker-pool
//! partitioning (one worker owns all mutations for a shard) is what makes
//! read-modify-write sequences on one shard safe.

mod nodes;

use dashmap::DashMap;
use tracing::debug;

pub use nodes::{
    ChildKind, ChildState, ChildVsNode, HostOverrideEffect, HttpPolicyNode, HttpRule,
    MatchCriteria, ParentVsNode, PoolGroupMember, PoolGroupNode, PoolNode, Server, SsoEffect,
    TlsCertNode, VsVipNode, DEFAULT_LISTENERS,
};

use crate::shard::ShardKey;

/// The forest of desired virtual-service graphs, one per shard key
#[derive(Debug, Default)]
pub struct VsGraph {
    /// Parent nodes keyed by shard
    parents: DashMap<ShardKey, ParentVsNode>,
    /// Which shard serves each hostname
    host_index: DashMap<String, ShardKey>,
}

impl VsGraph {
    /// Create an empty graph forest
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update the child for `child.host` under the given shard
    ///
    /// The parent node is created on first use via `make_parent`. An
    /// existing child's policy overrides are preserved across routing-rule
    /// rebuilds, since overrides are owned by the CRD admission path, not by
    /// the routing path. Returns the child's lifecycle state.
    pub fn upsert_child(
        &self,
        shard: &ShardKey,
        mut child: ChildVsNode,
        make_parent: impl FnOnce() -> ParentVsNode,
    ) -> ChildState {
        let mut parent = self
            .parents
            .entry(shard.clone())
            .or_insert_with(make_parent);

        let host = child.host.clone();
        if let Some(existing) = parent.children.get(&host) {
            child.overrides = existing.overrides.clone();
        }
        let state = child.state;
        Self::sync_redirect(&mut parent, &child);
        parent.children.insert(host.clone(), child);
        drop(parent);

        self.host_index.insert(host, shard.clone());
        state
    }

    /// Detach and discard the child for `host` under the given shard
    ///
    /// Returns true when the parent is now empty (a deletion candidate; the
    /// decision to delete is made by the sync engine against the cache, not
    /// here).
    pub fn remove_child(&self, shard: &ShardKey, host: &str) -> bool {
        let now_empty = match self.parents.get_mut(shard) {
            Some(mut parent) => {
                parent.children.remove(host);
                parent.redirect_hosts.remove(host);
                parent.is_empty()
            }
            None => false,
        };
        self.host_index.remove(host);
        debug!(%shard, host, now_empty, "removed child from graph");
        now_empty
    }

    /// Apply an Accepted policy override to the child serving `host`
    ///
    /// Never fails: invalid references are rejected earlier by admission.
    /// A default (empty) effect clears a previously applied override.
    /// Returns the owning shard so the caller can enqueue it.
    pub fn apply_host_override(&self, host: &str, effect: HostOverrideEffect) -> Option<ShardKey> {
        let shard = self.host_index.get(host).map(|s| s.clone())?;
        let mut parent = self.parents.get_mut(&shard)?;

        if !effect.listeners.is_empty() {
            parent.listeners = effect.listeners.clone();
        } else {
            parent.listeners = DEFAULT_LISTENERS.to_vec();
        }
        let child = parent.children.get_mut(host)?;
        child.overrides = effect;
        let child = child.clone();
        Self::sync_redirect(&mut parent, &child);
        Some(shard)
    }

    /// A point-in-time copy of the parent and its children for one shard
    ///
    /// The sync engine diffs against this copy so no graph lock is held
    /// across REST calls.
    pub fn parent_snapshot(&self, shard: &ShardKey) -> Option<ParentVsNode> {
        self.parents.get(shard).map(|p| p.clone())
    }

    /// The shard serving a hostname, if any
    pub fn shard_of(&self, host: &str) -> Option<ShardKey> {
        self.host_index.get(host).map(|s| s.clone())
    }

    /// Roll-up checksum of the child currently serving a host
    ///
    /// Lets ingestion skip enqueueing a shard when a rebuild produced an
    /// identical child.
    pub fn child_checksum(&self, shard: &ShardKey, host: &str) -> Option<u32> {
        use crate::naming::Checksum;
        self.parents
            .get(shard)
            .and_then(|parent| parent.children.get(host).map(|c| c.checksum()))
    }

    /// All shard keys currently present in the forest
    pub fn shards(&self) -> Vec<ShardKey> {
        self.parents.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop an empty parent from the graph
    ///
    /// Called by the sync engine after the remote parent has been deleted.
    /// A parent that regained children since the snapshot is left alone.
    pub fn drop_parent_if_empty(&self, shard: &ShardKey) {
        self.parents
            .remove_if(shard, |_, parent| parent.is_empty());
    }

    /// Keep the parent's HTTP→HTTPS redirect set consistent with one child
    ///
    /// Secure, enabled hosts get a redirect rule on the parent; a host that
    /// lost its certificate (secret deleted) or was disabled loses the rule
    /// but keeps its child node.
    fn sync_redirect(parent: &mut ParentVsNode, child: &ChildVsNode) {
        if child.is_secure() && child.enabled() {
            parent.redirect_hosts.insert(child.host.clone());
        } else {
            parent.redirect_hosts.remove(&child.host);
        }
    }
}
