#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod store;

pub use self::store::MemoryStore;
use maplit::{btreemap, convert_args};
use prometheus_client::registry::Registry;
use rbac_controller_k8s_api::{
    self as k8s, BindingTemplate, MergeStrategy, Namespace, NamespaceRbacConfig,
    NamespaceRbacConfigSpec, NamespaceSelector, ObjectMeta, PolicyRule, RbacTemplates, RoleRef,
    RoleTemplate, Subject,
};
use rbac_controller_k8s_rbac::{Manager, ManagerMetrics};
use rbac_controller_runtime::{
    Action, ConfigReconciler, Health, NamespaceReconciler, Reconcile, ReconcileMetrics, WorkQueue,
};
use std::{collections::BTreeMap, sync::Arc};

/// Wires both reconcilers to a shared [`MemoryStore`].
pub struct Harness {
    pub store: MemoryStore,
    pub manager: Manager<MemoryStore>,
    pub health: Arc<Health>,
    /// Configs queued by the namespace reconciler.
    pub config_queue: WorkQueue,
    configs: ConfigReconciler<MemoryStore>,
    namespaces: NamespaceReconciler<MemoryStore>,
    prom: Registry,
    _tracing: tracing::subscriber::DefaultGuard,
}

// === impl Harness ===

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        let _tracing = init_tracing();
        let store = MemoryStore::default();
        let mut prom = Registry::default();
        let operator = prom.sub_registry_with_prefix("rbac_operator");
        let manager = Manager::new(store.clone(), ManagerMetrics::register(operator));
        let metrics = ReconcileMetrics::register(operator);
        let health = Arc::new(Health::default());
        let config_queue = WorkQueue::default();

        Self {
            configs: ConfigReconciler::new(manager.clone(), health.clone(), metrics.clone()),
            namespaces: NamespaceReconciler::new(
                manager.clone(),
                config_queue.clone(),
                health.clone(),
                metrics,
            ),
            store,
            manager,
            health,
            config_queue,
            prom,
            _tracing,
        }
    }

    pub async fn reconcile_config(&self, name: &str) -> anyhow::Result<Action> {
        self.configs.reconcile(name).await
    }

    /// Reconciles a config until it no longer asks to be requeued.
    pub async fn converge_config(&self, name: &str) -> anyhow::Result<()> {
        for _ in 0..5 {
            if self.reconcile_config(name).await? != Action::Requeue {
                return Ok(());
            }
        }
        anyhow::bail!("{name} did not converge")
    }

    pub async fn reconcile_namespace(&self, name: &str) -> anyhow::Result<Action> {
        self.namespaces.reconcile(name).await
    }

    pub fn config(&self, name: &str) -> NamespaceRbacConfig {
        self.store
            .fetch(None, name)
            .unwrap_or_else(|| panic!("config {name} must exist"))
    }

    /// Renders every registered metric in the text exposition format.
    pub fn metrics(&self) -> String {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.prom)
            .expect("metrics must encode");
        buf
    }
}

pub fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "rbac=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}

pub fn mk_namespace(
    name: impl ToString,
    labels: impl IntoIterator<Item = (&'static str, &'static str)>,
) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{}", name.to_string())),
            labels: Some(
                labels
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn mk_config(
    name: impl ToString,
    selector: NamespaceSelector,
    templates: RbacTemplates,
) -> NamespaceRbacConfig {
    let mut config = NamespaceRbacConfig::new(
        &name.to_string(),
        NamespaceRbacConfigSpec {
            namespace_selector: selector,
            rbac_templates: templates,
            config: None,
        },
    );
    config.metadata.generation = Some(1);
    config
}

pub fn with_merge_strategy(
    mut config: NamespaceRbacConfig,
    strategy: MergeStrategy,
) -> NamespaceRbacConfig {
    config
        .spec
        .config
        .get_or_insert_with(Default::default)
        .merge_strategy = Some(strategy);
    config
}

pub fn with_orphan_cleanup(
    mut config: NamespaceRbacConfig,
    grace_period_seconds: Option<i32>,
) -> NamespaceRbacConfig {
    config
        .spec
        .config
        .get_or_insert_with(Default::default)
        .cleanup = Some(k8s::CleanupConfig {
        delete_orphaned_cluster_resources: Some(true),
        grace_period_seconds,
    });
    config
}

pub fn select_labels(labels: BTreeMap<String, String>) -> NamespaceSelector {
    NamespaceSelector {
        labels: Some(labels),
        ..Default::default()
    }
}

pub fn rule(verbs: &[&str], resources: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![String::new()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

pub fn role_template(name: &str, rules: Vec<PolicyRule>) -> RoleTemplate {
    RoleTemplate {
        name: name.to_string(),
        rules,
        labels: None,
        annotations: None,
    }
}

pub fn binding_template(
    name: &str,
    role_kind: &str,
    role: &str,
    subjects: Vec<Subject>,
) -> BindingTemplate {
    BindingTemplate {
        name: name.to_string(),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: role_kind.to_string(),
            name: role.to_string(),
        },
        subjects,
        labels: None,
        annotations: None,
    }
}

pub fn group(name: &str) -> Subject {
    Subject {
        kind: "Group".to_string(),
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        name: name.to_string(),
        namespace: None,
    }
}

pub fn service_account(name: &str, namespace: &str) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        api_group: None,
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
    }
}

/// The labels used by most scenarios to select tenant namespaces.
pub fn tenant_labels() -> BTreeMap<String, String> {
    convert_args!(btreemap!("tenant" => "true"))
}
