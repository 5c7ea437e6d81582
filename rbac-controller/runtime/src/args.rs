use crate::{
    controller::{Controller, Leadership},
    health::Health,
    k8s::{Namespace, NamespaceRbacConfig, Resource, ResourceExt},
    lease,
    metrics::ReconcileMetrics,
    queue::WorkQueue,
    rbac::{KubeStore, Manager, ManagerMetrics},
    reconcile::{ConfigReconciler, NamespaceReconciler},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::{info_span, Instrument};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(
    name = "rbac",
    about = "Generates RBAC objects for namespaces selected by NamespaceRBACConfigs"
)]
pub struct Args {
    #[clap(long, default_value = "rbac=info,warn", env = "RBAC_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace in which the leader-election lease is held.
    #[clap(long, default_value = "namespace-rbac-operator-system")]
    controller_namespace: String,

    #[clap(long, default_value = "namespace-rbac-operator-write")]
    lease_name: String,

    /// The deployment that owns the lease.
    #[clap(long, default_value = "namespace-rbac-operator")]
    deployment_name: String,

    #[clap(long, default_value = "2")]
    config_workers: usize,

    #[clap(long, default_value = "4")]
    namespace_workers: usize,

    /// Bounds every API call made while reconciling.
    #[clap(long, default_value = "5000")]
    api_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            controller_namespace,
            lease_name,
            deployment_name,
            config_workers,
            namespace_workers,
            api_timeout_ms,
        } = self;

        let mut prom = <Registry>::default();
        let operator = prom.sub_registry_with_prefix("rbac_operator");
        let manager_metrics = ManagerMetrics::register(operator);
        let reconcile_metrics = ReconcileMetrics::register(operator);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("Failed to fetch `HOSTNAME` environment variable")?;
        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &lease_name,
            &deployment_name,
            &hostname,
        )
        .await?;
        let leadership = Leadership::new(claims, hostname, lease::LEASE_DURATION);

        let store = KubeStore::new(runtime.client(), Duration::from_millis(api_timeout_ms));
        let manager = Manager::new(store, manager_metrics);
        let health = Arc::new(Health::default());
        let config_queue = WorkQueue::default();
        let namespace_queue = WorkQueue::default();

        // Spawn resource watches.

        let configs = runtime.watch_all::<NamespaceRbacConfig>(watcher::Config::default());
        tokio::spawn(
            enqueue(configs, config_queue.clone()).instrument(info_span!("namespacerbacconfigs")),
        );

        let namespaces = runtime.watch_all::<Namespace>(watcher::Config::default());
        tokio::spawn(
            enqueue(namespaces, namespace_queue.clone()).instrument(info_span!("namespaces")),
        );

        // Spawn the reconcilers.

        let config_controller = Controller::new(
            "namespacerbacconfig",
            ConfigReconciler::new(manager.clone(), health.clone(), reconcile_metrics.clone()),
            config_queue.clone(),
            config_workers,
            leadership.clone(),
        );
        tokio::spawn(
            config_controller
                .run(runtime.shutdown_handle())
                .instrument(info_span!("namespacerbacconfig")),
        );

        let namespace_controller = Controller::new(
            "namespace",
            NamespaceReconciler::new(
                manager,
                config_queue,
                health.clone(),
                reconcile_metrics.clone(),
            ),
            namespace_queue,
            namespace_workers,
            leadership,
        );
        tokio::spawn(
            namespace_controller
                .run(runtime.shutdown_handle())
                .instrument(info_span!("namespace")),
        );

        health.set_ready(true);
        tokio::spawn(
            report_health(health, reconcile_metrics, runtime.shutdown_handle())
                .instrument(info_span!("health")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Queues the name of every object that changes.
async fn enqueue<K: Resource>(
    events: impl Stream<Item = watcher::Event<K>>,
    queue: WorkQueue,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            watcher::Event::Apply(obj)
            | watcher::Event::InitApply(obj)
            | watcher::Event::Delete(obj) => queue.add(obj.name_any()),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }
}

async fn report_health(health: Arc<Health>, metrics: ReconcileMetrics, shutdown: drain::Watch) {
    let mut interval = time::interval(HEALTH_INTERVAL);
    let signaled = shutdown.signaled();
    tokio::pin!(signaled);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                metrics.set_health("controller", health.is_healthy());
                metrics.set_health("readiness", health.is_ready());
            }
            release = &mut signaled => {
                health.set_ready(false);
                drop(release);
                return;
            }
        }
    }
}
