use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciliations: Family<ResultLabels, Counter>,
    durations: Family<ReconcileLabels, Histogram>,
    errors: Family<ErrorLabels, Counter>,
    last_success: Family<ReconcileLabels, Gauge>,
    managed_namespaces: Family<ConfigLabels, Gauge>,
    namespace_configs: Gauge,
    health: Family<ComponentLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    config: String,
    controller: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    config: String,
    controller: &'static str,
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorLabels {
    config: String,
    controller: &'static str,
    error_type: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConfigLabels {
    config: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ComponentLabels {
    component: &'static str,
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciliations = Family::default();
        prom.register(
            "reconciliation",
            "Count of reconciliations by result",
            reconciliations.clone(),
        );

        let durations = Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0])
        });
        prom.register_with_unit(
            "reconciliation_duration",
            "Histogram of reconciliation latency",
            Unit::Seconds,
            durations.clone(),
        );

        let errors = Family::default();
        prom.register(
            "reconciliation_errors",
            "Count of failed reconciliations by error type",
            errors.clone(),
        );

        let last_success = Family::default();
        prom.register(
            "last_successful_reconcile_timestamp",
            "Unix timestamp of the last successful reconciliation",
            last_success.clone(),
        );

        let managed_namespaces = Family::default();
        prom.register(
            "managed_namespaces",
            "Number of namespaces a config is applied to",
            managed_namespaces.clone(),
        );

        let namespace_configs = Gauge::default();
        prom.register(
            "namespace_configs",
            "Number of NamespaceRBACConfig resources",
            namespace_configs.clone(),
        );

        let health = Family::default();
        prom.register(
            "health_status",
            "Health of controller components (1 healthy, 0 unhealthy)",
            health.clone(),
        );

        Self {
            reconciliations,
            durations,
            errors,
            last_success,
            managed_namespaces,
            namespace_configs,
            health,
        }
    }

    /// Records the outcome of one reconciliation. `error_type` is `None` on
    /// success.
    pub fn record(
        &self,
        config: &str,
        controller: &'static str,
        elapsed: time::Duration,
        error_type: Option<&'static str>,
    ) {
        let labels = ReconcileLabels {
            config: config.to_string(),
            controller,
        };
        self.durations
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
        self.reconciliations
            .get_or_create(&ResultLabels {
                config: config.to_string(),
                controller,
                result: if error_type.is_some() { "error" } else { "success" },
            })
            .inc();

        match error_type {
            Some(error_type) => {
                self.errors
                    .get_or_create(&ErrorLabels {
                        config: config.to_string(),
                        controller,
                        error_type,
                    })
                    .inc();
            }
            None => {
                self.last_success
                    .get_or_create(&labels)
                    .set(chrono::Utc::now().timestamp());
            }
        }
    }

    pub fn set_managed_namespaces(&self, config: &str, count: usize) {
        self.managed_namespaces
            .get_or_create(&ConfigLabels {
                config: config.to_string(),
            })
            .set(count as i64);
    }

    pub fn set_namespace_configs(&self, count: usize) {
        self.namespace_configs.set(count as i64);
    }

    pub fn remove_config(&self, config: &str) {
        self.managed_namespaces.remove(&ConfigLabels {
            config: config.to_string(),
        });
    }

    pub fn set_health(&self, component: &'static str, healthy: bool) {
        self.health
            .get_or_create(&ComponentLabels { component })
            .set(healthy as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_families() {
        let mut prom = Registry::default();
        let metrics = ReconcileMetrics::register(prom.sub_registry_with_prefix("rbac_operator"));
        metrics.record("cfg", "NamespaceRBACConfig", time::Duration::from_millis(3), None);
        metrics.record(
            "cfg",
            "NamespaceRBACConfig",
            time::Duration::from_millis(3),
            Some("template"),
        );
        metrics.set_managed_namespaces("cfg", 2);
        metrics.set_namespace_configs(3);
        metrics.set_health("reconciler", true);

        let mut out = String::new();
        encode(&mut out, &prom).unwrap();
        for line in [
            r#"rbac_operator_reconciliation_total{config="cfg",controller="NamespaceRBACConfig",result="success"} 1"#,
            r#"rbac_operator_reconciliation_total{config="cfg",controller="NamespaceRBACConfig",result="error"} 1"#,
            r#"rbac_operator_reconciliation_errors_total{config="cfg",controller="NamespaceRBACConfig",error_type="template"} 1"#,
            r#"rbac_operator_reconciliation_duration_seconds_count{config="cfg",controller="NamespaceRBACConfig"} 2"#,
            r#"rbac_operator_managed_namespaces{config="cfg"} 2"#,
            "rbac_operator_namespace_configs 3",
            r#"rbac_operator_health_status{component="reconciler"} 1"#,
        ] {
            assert!(out.contains(line), "missing {line} in:\n{out}");
        }
        assert!(out.contains("rbac_operator_last_successful_reconcile_timestamp{"));
    }
}
