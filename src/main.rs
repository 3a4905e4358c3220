//! Trellis controller - Kubernetes-to-load-balancer reconciliation

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, CustomResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::cache::ObjectCache;
use trellis::config::ControllerConfig;
use trellis::crd::{HostOverride, InfraSetting, PathOverride, SsoPolicy};
use trellis::graph::VsGraph;
use trellis::ingest::{Ingestor, ObjectEvent, ObjectKey};
use trellis::queue::ShardQueue;
use trellis::retry::{retry_with_backoff, RetryConfig};
use trellis::status::{KubeStatusSink, StatusSink};
use trellis::sync::{Context, FullSync, Reconciler, RestClient};

/// Trellis - reconciles Kubernetes routing objects onto an external
/// load-balancing controller
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: Option<ControllerConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            serde_yaml::to_string(&HostOverride::crd())?,
            serde_yaml::to_string(&PathOverride::crd())?,
            serde_yaml::to_string(&SsoPolicy::crd())?,
            serde_yaml::to_string(&InfraSetting::crd())?,
        ] {
            println!("---\n{crd}");
        }
        return Ok(());
    }

    let config = cli
        .config
        .ok_or_else(|| anyhow::anyhow!("controller configuration is required"))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    run_controller(config).await
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    info!(cluster = %config.cluster_name, "trellis controller starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let api = Arc::new(
        RestClient::new(
            &config.controller_url,
            &config.controller_username,
            &config.controller_password,
        )
        .map_err(|e| anyhow::anyhow!("failed to build controller client: {e}"))?,
    );

    let graph = Arc::new(VsGraph::new());
    let cache = Arc::new(ObjectCache::new());
    let status: Arc<dyn StatusSink> = Arc::new(KubeStatusSink::new(client.clone()));
    let ingestor = Arc::new(Ingestor::new(
        &config,
        Arc::clone(&graph),
        Arc::clone(&cache),
        Arc::clone(&status),
    ));
    let ctx = Arc::new(Context {
        namer: config.namer(),
        tenant: config.tenant.clone(),
        scheme: config.shard_scheme(),
        graph,
        cache,
        api,
        status,
        ingestor: Arc::clone(&ingestor),
    });

    let queue = ShardQueue::new(config.workers);
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&ctx)));
    let full_sync = Arc::new(FullSync::new(
        Arc::clone(&ctx),
        Arc::clone(&queue),
        Duration::from_secs(config.full_sync_secs),
    ));

    // The cache must mirror the remote inventory before any reconciliation;
    // without it every diff would try to re-create the world
    retry_with_backoff(&RetryConfig::slow(), "startup_inventory", || {
        let full_sync = Arc::clone(&full_sync);
        async move { full_sync.seed().await }
    })
    .await
    .map_err(|e| anyhow::anyhow!("startup inventory pull failed: {e}"))?;

    let worker_handles = {
        let reconciler = Arc::clone(&reconciler);
        let queue_for_workers = Arc::clone(&queue);
        queue.start(move |shard| {
            let reconciler = Arc::clone(&reconciler);
            let queue = Arc::clone(&queue_for_workers);
            async move {
                reconciler.run(shard, &queue).await;
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let full_sync_handle = {
        let full_sync = Arc::clone(&full_sync);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { full_sync.run(shutdown_rx).await })
    };

    // SIGHUP requests an immediate full sync; Notify holds at most one
    // pending permit, so repeat signals collapse instead of queueing
    let trigger = full_sync.trigger();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            warn!("failed to install SIGHUP handler, on-demand full sync disabled");
            return;
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, requesting full sync");
            trigger.notify_one();
        }
    });

    let watcher_handles = spawn_watchers(&client, &ingestor, &queue);

    info!(workers = config.workers, "trellis controller running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    // Stop new enqueues, let in-flight reconciles finish, stop the loops
    let _ = shutdown_tx.send(true);
    for handle in watcher_handles {
        handle.abort();
    }
    queue.shutdown();
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = full_sync_handle.await;

    info!("trellis controller stopped");
    Ok(())
}

/// Start one watcher per consumed Kubernetes kind
///
/// Each watcher maps notifications to [`ObjectEvent`]s, hands them to the
/// ingestor, and enqueues the shards the ingestor reports as touched.
fn spawn_watchers(
    client: &Client,
    ingestor: &Arc<Ingestor>,
    queue: &Arc<ShardQueue>,
) -> Vec<tokio::task::JoinHandle<()>> {
    use k8s_openapi::api::core::v1::{Endpoints, Secret, Service};
    use k8s_openapi::api::networking::v1::Ingress;

    vec![
        spawn_watcher(Api::<Ingress>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::IngressDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::IngressApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<Service>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::ServiceDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::ServiceApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<Endpoints>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::EndpointsDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::EndpointsApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<Secret>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::SecretDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::SecretApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<HostOverride>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::HostOverrideDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::HostOverrideApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<PathOverride>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::PathOverrideDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::PathOverrideApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<SsoPolicy>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::SsoPolicyDeleted(ObjectKey::of(&obj))
            } else {
                ObjectEvent::SsoPolicyApplied(Box::new(obj))
            }
        }),
        spawn_watcher(Api::<InfraSetting>::all(client.clone()), ingestor, queue, |obj, deleted| {
            if deleted {
                ObjectEvent::InfraSettingDeleted(ObjectKey::of(&obj).name)
            } else {
                ObjectEvent::InfraSettingApplied(Box::new(obj))
            }
        }),
    ]
}

fn spawn_watcher<K>(
    api: Api<K>,
    ingestor: &Arc<Ingestor>,
    queue: &Arc<ShardQueue>,
    to_event: impl Fn(K, bool) -> ObjectEvent + Send + 'static,
) -> tokio::task::JoinHandle<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default,
{
    let ingestor = Arc::clone(ingestor);
    let queue = Arc::clone(queue);
    tokio::spawn(async move {
        let mut stream = watcher(api, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    for shard in ingestor.handle(to_event(obj, false)).await {
                        queue.enqueue(shard);
                    }
                }
                Ok(watcher::Event::Delete(obj)) => {
                    for shard in ingestor.handle(to_event(obj, true)).await {
                        queue.enqueue(shard);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "watch stream error, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}
