//! Status write-back to Kubernetes objects
//!
//! Projects successful convergence (or persistent failure) back onto the
//! objects users look at: Ingress `status.loadBalancer.ingress[]` entries
//! and CRD Accepted/Rejected statuses. Writes are best-effort and
//! idempotent; a failed write is logged and retried on the next
//! reconciliation pass of the owning shard, never blocking reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::{CrdStatus, HostOverride, InfraSetting, PathOverride, SsoPolicy};
use crate::ingest::ObjectKey;
use crate::{Error, Result};

/// Which policy CRD a status write targets
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum CrdKind {
    /// HostOverride
    HostOverride,
    /// PathOverride
    PathOverride,
    /// SsoPolicy
    SsoPolicy,
    /// InfraSetting
    InfraSetting,
}

/// Sink for status writes
///
/// Mockable so reconciliation tests can assert exactly which statuses were
/// written without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Record the VIP serving `hostname` on an Ingress, or clear the entry
    /// when `vip` is None
    ///
    /// Writing the same status twice is a no-op observable as success.
    async fn report_ingress<'a>(
        &self,
        ingress: &ObjectKey,
        hostname: &str,
        vip: Option<&'a str>,
    ) -> Result<()>;

    /// Write a CRD's admission status
    async fn report_crd(&self, kind: CrdKind, key: &ObjectKey, status: &CrdStatus) -> Result<()>;
}

/// StatusSink writing through the Kubernetes API
pub struct KubeStatusSink {
    client: Client,
    field_manager: String,
}

impl KubeStatusSink {
    /// A sink writing with the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: "trellis-controller".to_string(),
        }
    }

    fn params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager)
    }

    async fn patch_crd_status<K>(&self, key: &ObjectKey, status: &CrdStatus) -> Result<()>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&key.name, &self.params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn report_ingress<'a>(
        &self,
        ingress: &ObjectKey,
        hostname: &str,
        vip: Option<&'a str>,
    ) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &ingress.namespace);
        let current = api.get_status(&ingress.name).await?;

        let mut entries: Vec<IngressLoadBalancerIngress> = current
            .status
            .and_then(|s| s.load_balancer)
            .and_then(|lb| lb.ingress)
            .unwrap_or_default();

        let before = entries.clone();
        entries.retain(|e| e.hostname.as_deref() != Some(hostname));
        if let Some(vip) = vip {
            entries.push(IngressLoadBalancerIngress {
                hostname: Some(hostname.to_string()),
                ip: Some(vip.to_string()),
                ports: None,
            });
        }
        entries.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        if entries == before {
            debug!(ingress = %ingress, hostname, "ingress status unchanged, skipping write");
            return Ok(());
        }

        let patch = serde_json::json!({
            "status": { "loadBalancer": { "ingress": entries } }
        });
        api.patch_status(&ingress.name, &self.params(), &Patch::Merge(&patch))
            .await?;
        info!(ingress = %ingress, hostname, vip = vip.unwrap_or("<cleared>"), "updated ingress status");
        Ok(())
    }

    async fn report_crd(&self, kind: CrdKind, key: &ObjectKey, status: &CrdStatus) -> Result<()> {
        match kind {
            CrdKind::HostOverride => self.patch_crd_status::<HostOverride>(key, status).await?,
            CrdKind::PathOverride => self.patch_crd_status::<PathOverride>(key, status).await?,
            CrdKind::SsoPolicy => self.patch_crd_status::<SsoPolicy>(key, status).await?,
            CrdKind::InfraSetting => {
                // Cluster-scoped: no namespace on the API handle
                let api: Api<InfraSetting> = Api::all(self.client.clone());
                let patch = serde_json::json!({ "status": status });
                api.patch_status(&key.name, &self.params(), &Patch::Merge(&patch))
                    .await
                    .map_err(Error::Kube)?;
            }
        }
        info!(?kind, crd = %key, status = %status.status, "updated CRD status");
        Ok(())
    }
}
