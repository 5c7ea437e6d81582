use crate::{manager::Operation, permission::ResourceKind};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use rbac_controller_k8s_api::MergeStrategy;
use tokio::time;

#[derive(Clone, Debug)]
pub struct ManagerMetrics {
    resource_operations: Family<OperationLabels, Counter>,
    template_errors: Family<TemplateLabels, Counter>,
    template_durations: Family<TemplateLabels, Histogram>,
    conflict_resolutions: Family<ConflictLabels, Counter>,
    cleanup_operations: Family<CleanupLabels, Counter>,
    managed_resources: Family<ManagedLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OperationLabels {
    config: String,
    resource_type: &'static str,
    operation: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TemplateLabels {
    config: String,
    template_type: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConflictLabels {
    config: String,
    strategy: &'static str,
    resource_type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CleanupLabels {
    resource_type: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ManagedLabels {
    config: String,
    resource_type: &'static str,
    namespace: String,
}

fn result(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "error"
    }
}

// === impl ManagerMetrics ===

impl ManagerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let resource_operations = Family::default();
        prom.register(
            "resource_operations",
            "Count of RBAC resource writes by type, operation and result",
            resource_operations.clone(),
        );

        let template_errors = Family::default();
        prom.register(
            "template_processing_errors",
            "Count of template processing failures",
            template_errors.clone(),
        );

        let template_durations = Family::<TemplateLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0])
        });
        prom.register_with_unit(
            "template_processing_duration",
            "Histogram of time spent processing templates",
            Unit::Seconds,
            template_durations.clone(),
        );

        let conflict_resolutions = Family::default();
        prom.register(
            "conflict_resolution",
            "Count of existing objects resolved by merge strategy",
            conflict_resolutions.clone(),
        );

        let cleanup_operations = Family::default();
        prom.register(
            "cleanup_operations",
            "Count of orphaned cluster-scoped resource deletions",
            cleanup_operations.clone(),
        );

        let managed_resources = Family::default();
        prom.register(
            "managed_resources",
            "Managed RBAC objects by config, type and namespace",
            managed_resources.clone(),
        );

        Self {
            resource_operations,
            template_errors,
            template_durations,
            conflict_resolutions,
            cleanup_operations,
            managed_resources,
        }
    }

    pub(crate) fn record_operation(
        &self,
        config: &str,
        kind: ResourceKind,
        operation: Operation,
        ok: bool,
    ) {
        self.resource_operations
            .get_or_create(&OperationLabels {
                config: config.to_string(),
                resource_type: kind.as_str(),
                operation: operation.as_str(),
                result: result(ok),
            })
            .inc();
    }

    pub(crate) fn record_template(
        &self,
        config: &str,
        template_type: String,
        elapsed: time::Duration,
        ok: bool,
    ) {
        let labels = TemplateLabels {
            config: config.to_string(),
            template_type,
        };
        self.template_durations
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
        if !ok {
            self.template_errors.get_or_create(&labels).inc();
        }
    }

    pub(crate) fn record_conflict_resolution(
        &self,
        config: &str,
        strategy: MergeStrategy,
        kind: ResourceKind,
    ) {
        self.conflict_resolutions
            .get_or_create(&ConflictLabels {
                config: config.to_string(),
                strategy: strategy.as_str(),
                resource_type: kind.as_str(),
            })
            .inc();
    }

    /// Marks an object as managed by `config`. Cluster-scoped objects have an
    /// empty namespace.
    pub(crate) fn set_managed(&self, config: &str, kind: ResourceKind, namespace: Option<&str>) {
        self.managed_resources
            .get_or_create(&ManagedLabels {
                config: config.to_string(),
                resource_type: kind.as_str(),
                namespace: namespace.unwrap_or_default().to_string(),
            })
            .set(1);
    }

    pub(crate) fn record_cleanup(&self, kind: ResourceKind, ok: bool) {
        self.cleanup_operations
            .get_or_create(&CleanupLabels {
                resource_type: kind.as_str(),
                result: result(ok),
            })
            .inc();
    }
}
