use super::{now, CONFIG_CONTROLLER};
use crate::{
    controller::{Action, Reconcile},
    core::NamespaceMatcher,
    health::Health,
    k8s::{
        config::{
            CONDITION_DEGRADED, CONDITION_PROGRESSING, CONDITION_READY, REASON_RECONCILE_ERROR,
            REASON_RECONCILE_SUCCESS, REASON_RECONCILING, REASON_VALIDATION_ERROR,
        },
        CreatedResources, Namespace, NamespaceRbacConfig, NamespaceRbacConfigStatus, ResourceExt,
    },
    metrics::ReconcileMetrics,
    rbac::{self, store, Manager, Store},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time;

/// Reconciles a `NamespaceRBACConfig` against every namespace it selects.
pub struct ConfigReconciler<S> {
    manager: Manager<S>,
    health: Arc<Health>,
    metrics: ReconcileMetrics,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Manager(#[from] rbac::Error),

    #[error("failed to update NamespaceRBACConfig: {0}")]
    Store(#[from] store::Error),
}

/// How a failed pass is reported in the config's status.
struct Failure {
    reason: &'static str,
    ready: &'static str,
    progressing: &'static str,
}

const VALIDATION_FAILURE: Failure = Failure {
    reason: REASON_VALIDATION_ERROR,
    ready: "Configuration validation failed",
    progressing: "Validation failed",
};

const RECONCILE_FAILURE: Failure = Failure {
    reason: REASON_RECONCILE_ERROR,
    ready: "RBAC reconciliation failed",
    progressing: "Reconciliation failed",
};

// === impl ConfigReconciler ===

impl<S: Store> ConfigReconciler<S> {
    pub fn new(manager: Manager<S>, health: Arc<Health>, metrics: ReconcileMetrics) -> Self {
        Self {
            manager,
            health,
            metrics,
        }
    }

    async fn reconcile_config(&self, name: &str) -> Result<Action, Error> {
        let store = self.manager.store();
        let mut config = match store.get::<NamespaceRbacConfig>(None, name).await? {
            Some(config) => config,
            None => {
                tracing::debug!("NamespaceRBACConfig not found");
                self.metrics.remove_config(name);
                return Ok(Action::Done);
            }
        };

        if config.is_deleting() {
            return self.finalize(config).await;
        }

        if !config.has_finalizer() {
            config.add_finalizer();
            return match store.replace(&config).await {
                Ok(_) => {
                    tracing::debug!("Added finalizer");
                    Ok(Action::Requeue)
                }
                Err(store::Error::NotFound) => Ok(Action::Done),
                Err(error) => Err(error.into()),
            };
        }

        let mut status = config.status.clone().unwrap_or_default();
        status.set_condition(
            CONDITION_PROGRESSING,
            true,
            REASON_RECONCILING,
            "Reconciling NamespaceRBACConfig",
            now(),
        );

        if let Err(message) = self.validate(&config) {
            tracing::info!(%message, "Invalid NamespaceRBACConfig");
            set_failed(&mut status, &VALIDATION_FAILURE, &message);
            self.write_status(&mut config, status).await?;
            return Err(Error::Validation(message));
        }

        let previous = config.applied_namespaces().to_vec();
        let (applied, created) = match self.apply(&config).await {
            Ok(applied) => applied,
            Err(error) => {
                tracing::warn!(%error, "Failed to apply NamespaceRBACConfig");
                set_failed(&mut status, &RECONCILE_FAILURE, &error.to_string());
                let error = Error::from(error);
                return match self.write_status(&mut config, status).await {
                    // An unwritten failure status must be retried.
                    Err(status_error) if !error.is_retryable() => Err(status_error),
                    _ => Err(error),
                };
            }
        };

        for ns in previous.iter().filter(|ns| !applied.contains(ns)) {
            tracing::info!(namespace = %ns, "Namespace no longer selected");
            if let Err(error) = self.manager.cleanup_for_namespace(ns, &config).await {
                tracing::warn!(namespace = %ns, %error, "Failed to clean up namespace");
            }
        }

        let count = applied.len();
        status.applied_namespaces = applied;
        status.created_resources = Some(created);
        status.observed_generation = config.metadata.generation.unwrap_or_default();
        status.set_condition(
            CONDITION_READY,
            true,
            REASON_RECONCILE_SUCCESS,
            "Successfully reconciled RBAC",
            now(),
        );
        status.set_condition(
            CONDITION_PROGRESSING,
            false,
            REASON_RECONCILE_SUCCESS,
            "Reconciliation completed",
            now(),
        );
        status.set_condition(
            CONDITION_DEGRADED,
            false,
            REASON_RECONCILE_SUCCESS,
            "No issues detected",
            now(),
        );
        self.write_status(&mut config, status).await?;

        self.metrics.set_managed_namespaces(name, count);
        self.health.record_reconcile();
        tracing::info!(namespaces = count, "Reconciled");
        Ok(Action::Done)
    }

    /// Cleans up every namespace the config was applied to, deletes any
    /// cluster-scoped objects still labelled for it, and releases the
    /// finalizer.
    async fn finalize(&self, mut config: NamespaceRbacConfig) -> Result<Action, Error> {
        let name = config.name_any();
        self.metrics.remove_config(&name);
        if !config.has_finalizer() {
            return Ok(Action::Done);
        }

        for ns in config.applied_namespaces() {
            if let Err(error) = self.manager.cleanup_for_namespace(ns, &config).await {
                tracing::warn!(namespace = %ns, %error, "Failed to clean up namespace");
            }
        }
        // A failed pass leaves the applied list empty but may have written
        // cluster-scoped objects.
        if let Err(error) = self.manager.cleanup_orphans(&config).await {
            tracing::warn!(%error, "Failed to clean up orphaned cluster resources");
        }

        config.remove_finalizer();
        match self.manager.store().replace(&config).await {
            Ok(_) | Err(store::Error::NotFound) => {
                tracing::info!("Finalized");
                Ok(Action::Done)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Checks what the API server's schema cannot: the name regex compiles,
    /// something is templated, and every template parses.
    fn validate(&self, config: &NamespaceRbacConfig) -> Result<(), String> {
        NamespaceMatcher::compile(&config.spec.namespace_selector)
            .map_err(|error| format!("invalid namespace selector nameRegex: {error}"))?;

        let templates = &config.spec.rbac_templates;
        if templates.is_empty() {
            return Err("at least one RBAC template must be specified".to_string());
        }

        let engine = self.manager.engine();
        let check = |what: &str, text: &str| {
            engine
                .validate_template(text)
                .map_err(|error| format!("invalid {what} template {text:?}: {error}"))
        };
        let check_map = |what: &str, map: Option<&BTreeMap<String, String>>| {
            map.into_iter()
                .flat_map(|m| m.values())
                .try_for_each(|v| check(what, v))
        };

        for tpl in templates.roles.iter().chain(&templates.cluster_roles) {
            check("name", &tpl.name)?;
            check_map("label", tpl.labels.as_ref())?;
            check_map("annotation", tpl.annotations.as_ref())?;
        }
        for tpl in templates
            .role_bindings
            .iter()
            .chain(&templates.cluster_role_bindings)
        {
            check("name", &tpl.name)?;
            check("roleRef name", &tpl.role_ref.name)?;
            check_map("label", tpl.labels.as_ref())?;
            check_map("annotation", tpl.annotations.as_ref())?;
            for subject in &tpl.subjects {
                check("subject name", &subject.name)?;
                if let Some(ns) = subject.namespace.as_deref() {
                    check("subject namespace", ns)?;
                }
            }
        }
        Ok(())
    }

    /// Applies the config to every selected namespace, returning the sorted
    /// namespace names and everything that was written.
    async fn apply(
        &self,
        config: &NamespaceRbacConfig,
    ) -> Result<(Vec<String>, CreatedResources), rbac::Error> {
        let matcher = NamespaceMatcher::compile(&config.spec.namespace_selector)?;
        let namespaces = self
            .manager
            .store()
            .list::<Namespace>(&Default::default())
            .await
            .map_err(|source| rbac::Error::Store {
                kind: "namespace",
                name: String::new(),
                source,
            })?;

        let mut applied = Vec::new();
        let mut created = CreatedResources::default();
        for ns in namespaces
            .iter()
            .filter(|ns| ns.metadata.deletion_timestamp.is_none() && matcher.matches(ns))
        {
            let resources = self.manager.apply_for_namespace(ns, config).await?;
            applied.push(ns.name_any());
            created.roles.extend(resources.roles);
            created.cluster_roles.extend(resources.cluster_roles);
            created.role_bindings.extend(resources.role_bindings);
            created
                .cluster_role_bindings
                .extend(resources.cluster_role_bindings);
        }

        applied.sort();
        dedup(&mut created.roles);
        dedup(&mut created.cluster_roles);
        dedup(&mut created.role_bindings);
        dedup(&mut created.cluster_role_bindings);
        Ok((applied, created))
    }

    async fn count_configs(&self) {
        match self
            .manager
            .store()
            .list::<NamespaceRbacConfig>(&Default::default())
            .await
        {
            Ok(configs) => self.metrics.set_namespace_configs(configs.len()),
            Err(error) => tracing::debug!(%error, "Failed to count NamespaceRBACConfigs"),
        }
    }

    async fn write_status(
        &self,
        config: &mut NamespaceRbacConfig,
        status: NamespaceRbacConfigStatus,
    ) -> Result<(), Error> {
        config.status = Some(status);
        match self.manager.store().update_status(config).await {
            Ok(()) => Ok(()),
            Err(store::Error::NotFound) => {
                tracing::debug!("NamespaceRBACConfig deleted before its status was written");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for ConfigReconciler<S> {
    #[tracing::instrument(skip(self), fields(config = %name))]
    async fn reconcile(&self, name: &str) -> anyhow::Result<Action> {
        let start = time::Instant::now();
        let res = self.reconcile_config(name).await;
        self.metrics.record(
            name,
            CONFIG_CONTROLLER,
            start.elapsed(),
            res.as_ref().err().map(Error::error_type),
        );
        self.count_configs().await;

        match res {
            Ok(action) => Ok(action),
            Err(error) if !error.is_retryable() => {
                tracing::info!(%error, "Not retrying until the config or a namespace changes");
                Ok(Action::Done)
            }
            Err(error) => {
                self.health.set_healthy(false);
                Err(error.into())
            }
        }
    }
}

// === impl Error ===

impl Error {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Manager(error) => !error.is_template(),
            Self::Store(_) => true,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Manager(error) => error.error_type(),
            Self::Store(error) => error.error_type(),
        }
    }
}

fn set_failed(status: &mut NamespaceRbacConfigStatus, failure: &Failure, message: &str) {
    status.set_condition(CONDITION_DEGRADED, true, failure.reason, message, now());
    status.set_condition(CONDITION_READY, false, failure.reason, failure.ready, now());
    status.set_condition(
        CONDITION_PROGRESSING,
        false,
        failure.reason,
        failure.progressing,
        now(),
    );
}

fn dedup<T: Ord>(items: &mut Vec<T>) {
    items.sort();
    items.dedup();
}
