use super::NAMESPACE_CONTROLLER;
use crate::{
    controller::{Action, Reconcile},
    core::NamespaceMatcher,
    health::Health,
    k8s::{Namespace, NamespaceRbacConfig, ResourceExt},
    metrics::ReconcileMetrics,
    queue::WorkQueue,
    rbac::{Manager, Store},
};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::time;

/// Applies or removes every config's objects when a namespace changes.
///
/// When a namespace starts or stops matching a config, the config is queued
/// so that its status reflects the new set of namespaces.
pub struct NamespaceReconciler<S> {
    manager: Manager<S>,
    configs: WorkQueue,
    health: Arc<Health>,
    metrics: ReconcileMetrics,
}

// === impl NamespaceReconciler ===

impl<S: Store> NamespaceReconciler<S> {
    pub fn new(
        manager: Manager<S>,
        configs: WorkQueue,
        health: Arc<Health>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            manager,
            configs,
            health,
            metrics,
        }
    }

    /// Returns the number of configs whose store writes failed.
    async fn reconcile_namespace(&self, name: &str) -> Result<usize> {
        let store = self.manager.store();
        let ns = store.get::<Namespace>(None, name).await?;
        let configs = store
            .list::<NamespaceRbacConfig>(&Default::default())
            .await?;

        let ns = match ns {
            Some(ns) if ns.metadata.deletion_timestamp.is_none() => ns,
            _ => {
                tracing::debug!("Namespace deleted");
                return Ok(self.remove(name, &configs).await);
            }
        };

        let mut failed = 0;
        for config in configs.iter().filter(|c| !c.is_deleting()) {
            let config_name = config.name_any();
            let matcher = match NamespaceMatcher::compile(&config.spec.namespace_selector) {
                Ok(matcher) => matcher,
                Err(error) => {
                    tracing::debug!(config = %config_name, %error, "Skipping invalid config");
                    continue;
                }
            };

            let start = time::Instant::now();
            let selected = matcher.matches(&ns);
            let res = if selected {
                self.manager.apply_for_namespace(&ns, config).await.map(drop)
            } else {
                self.manager.cleanup_for_namespace(name, config).await
            };
            self.metrics.record(
                &config_name,
                NAMESPACE_CONTROLLER,
                start.elapsed(),
                res.as_ref().err().map(|e| e.error_type()),
            );
            if let Err(error) = res {
                tracing::warn!(config = %config_name, %error, "Failed to reconcile namespace");
                if !error.is_template() {
                    failed += 1;
                }
            }

            let applied = config.applied_namespaces().iter().any(|n| n == name);
            if selected != applied {
                tracing::debug!(config = %config_name, selected, "Membership changed");
                self.configs.add(config_name);
            }
        }

        Ok(failed)
    }

    async fn remove(&self, name: &str, configs: &[NamespaceRbacConfig]) -> usize {
        let mut failed = 0;
        for config in configs {
            let config_name = config.name_any();
            if let Err(error) = self.manager.cleanup_for_namespace(name, config).await {
                tracing::warn!(config = %config_name, %error, "Failed to clean up namespace");
                failed += 1;
            }
            if config.applied_namespaces().iter().any(|n| n == name) {
                self.configs.add(config_name);
            }
        }
        failed
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for NamespaceReconciler<S> {
    #[tracing::instrument(skip(self), fields(namespace = %name))]
    async fn reconcile(&self, name: &str) -> Result<Action> {
        let failed = match self.reconcile_namespace(name).await {
            Ok(failed) => failed,
            Err(error) => {
                self.health.set_healthy(false);
                return Err(error);
            }
        };

        if failed > 0 {
            self.health.set_healthy(false);
            bail!("failed to reconcile {failed} configs");
        }
        self.health.record_reconcile();
        Ok(Action::Done)
    }
}
