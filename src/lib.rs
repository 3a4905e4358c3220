//! Trellis - Kubernetes-to-load-balancer reconciliation controller
//!
//! Trellis watches Kubernetes routing objects (Ingress, Service, Endpoints,
//! Secrets) plus a set of policy CRDs and converges them onto virtual-service
//! configuration held by an external load-balancing controller, reachable
//! only through a REST API.
//!
//! # Architecture
//!
//! Kubernetes event → ingestion (graph mutation, possibly gated by CRD
//! admission) → shard enqueue → sync engine diff against the object cache →
//! REST operations → cache update → status write-back.
//!
//! Hostnames are deterministically sharded onto a bounded set of shared
//! parent virtual services; each shard is reconciled by exactly one worker,
//! which is what makes the graph and cache safe without a global lock.
//!
//! # Modules
//!
//! - [`crd`] - Policy Custom Resource Definitions (HostOverride, PathOverride, SsoPolicy, InfraSetting)
//! - [`graph`] - In-memory forest of desired virtual-service state
//! - [`ingest`] - Kubernetes object snapshots → graph mutations
//! - [`shard`] - Deterministic hostname/namespace → shard assignment
//! - [`cache`] - Mirror of remote controller object state with checksums
//! - [`admission`] - CRD reference validation (Accepted/Rejected)
//! - [`sync`] - Diff-and-converge engine issuing REST operations
//! - [`queue`] - De-duplicating shard work queue and worker pool
//! - [`status`] - Ingress VIP and CRD status write-back
//! - [`naming`] - Deterministic object naming and content checksums
//! - [`retry`] - Fast/slow backoff profiles
//! - [`config`] - Controller configuration
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod admission;
pub mod cache;
pub mod config;
pub mod crd;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod naming;
pub mod queue;
pub mod retry;
pub mod shard;
pub mod status;
pub mod sync;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Tenant used when the configuration names none
pub const DEFAULT_TENANT: &str = "admin";

/// Default number of reconciliation workers
///
/// Shard keys are hash-partitioned across workers, so this also bounds how
/// many shards can be in flight at once.
pub const DEFAULT_WORKERS: usize = 8;

/// Default period between full-sync inventory pulls, in seconds
pub const DEFAULT_FULL_SYNC_SECS: u64 = 1800;
