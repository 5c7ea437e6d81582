use crate::{labels::Map, selector::NamespaceSelector};
use k8s_openapi::{
    api::rbac::v1::{PolicyRule, RoleRef, Subject},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Blocks removal of a `NamespaceRBACConfig` until its cleanup has run.
pub const FINALIZER: &str = "namespacerbacconfig.rbac.operator.io/finalizer";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";

pub const REASON_RECONCILING: &str = "Reconciling";
pub const REASON_RECONCILE_SUCCESS: &str = "ReconcileSuccess";
pub const REASON_RECONCILE_ERROR: &str = "ReconcileError";
pub const REASON_VALIDATION_ERROR: &str = "ValidationError";

/// Describes RBAC resources to generate in every namespace matched by a
/// selector.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "rbac.operator.io",
    version = "v1",
    kind = "NamespaceRBACConfig",
    root = "NamespaceRbacConfig",
    status = "NamespaceRbacConfigStatus",
    shortname = "nrc",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRbacConfigSpec {
    pub namespace_selector: NamespaceSelector,
    pub rbac_templates: RbacTemplates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RbacTemplates {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_roles: Vec<RoleTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_bindings: Vec<BindingTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_role_bindings: Vec<BindingTemplate>,
}

/// A template for a `Role` or a `ClusterRole`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplate {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Map>,
}

/// A template for a `RoleBinding` or a `ClusterRoleBinding`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingTemplate {
    pub name: String,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub subjects: Vec<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Map>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub naming: Option<NamingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_variables: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamingConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub suffix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub separator: String,
}

/// How to resolve a name collision between a generated object and one that
/// already exists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Combine rules and subjects with the existing object's.
    #[default]
    Merge,
    /// Overwrite the existing object.
    Replace,
    /// Leave the existing object untouched.
    Ignore,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_orphaned_cluster_resources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_period_seconds: Option<i32>,
}

// Status fields are always serialized so that a merge patch clears values
// that are no longer set.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRbacConfigStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub applied_namespaces: Vec<String>,
    #[serde(default)]
    pub created_resources: Option<CreatedResources>,
    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResources {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_bindings: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_role_bindings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct ResourceReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

// === impl NamespaceRbacConfig ===

impl NamespaceRbacConfig {
    pub fn merge_strategy(&self) -> MergeStrategy {
        self.options()
            .and_then(|c| c.merge_strategy)
            .unwrap_or_default()
    }

    pub fn naming(&self) -> Option<&NamingConfig> {
        self.options().and_then(|c| c.naming.as_ref())
    }

    pub fn template_variables(&self) -> Option<&Map> {
        self.options().and_then(|c| c.template_variables.as_ref())
    }

    pub fn deletes_orphaned_cluster_resources(&self) -> bool {
        self.cleanup()
            .and_then(|c| c.delete_orphaned_cluster_resources)
            .unwrap_or(false)
    }

    /// Returns the grace period to use when deleting orphaned objects.
    ///
    /// Negative values are ignored.
    pub fn grace_period_seconds(&self) -> Option<u32> {
        self.cleanup()
            .and_then(|c| c.grace_period_seconds)
            .and_then(|s| u32::try_from(s).ok())
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.finalizers_mut().push(FINALIZER.to_string());
        }
    }

    pub fn remove_finalizer(&mut self) {
        self.finalizers_mut().retain(|f| f != FINALIZER);
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn applied_namespaces(&self) -> &[String] {
        self.status
            .as_ref()
            .map(|s| s.applied_namespaces.as_slice())
            .unwrap_or_default()
    }

    fn options(&self) -> Option<&ConfigOptions> {
        self.spec.config.as_ref()
    }

    fn cleanup(&self) -> Option<&CleanupConfig> {
        self.options().and_then(|c| c.cleanup.as_ref())
    }
}

// === impl RbacTemplates ===

impl RbacTemplates {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
            && self.cluster_roles.is_empty()
            && self.role_bindings.is_empty()
            && self.cluster_role_bindings.is_empty()
    }
}

// === impl MergeStrategy ===

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl NamespaceRbacConfigStatus ===

impl NamespaceRbacConfigStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Sets a condition, keeping its last transition time unless the status
    /// value changes.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: impl Into<String>,
        now: Time,
    ) {
        let status = if status { "True" } else { "False" };
        let mut condition = Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: now,
            observed_generation: None,
        };

        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time.clone();
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }
}
