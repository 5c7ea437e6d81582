#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod labels;
pub mod selector;

pub use self::{
    config::{
        BindingTemplate, CleanupConfig, ConfigOptions, CreatedResources, MergeStrategy,
        NamespaceRbacConfig, NamespaceRbacConfigSpec, NamespaceRbacConfigStatus, NamingConfig,
        RbacTemplates, ResourceReference, RoleTemplate,
    },
    selector::NamespaceSelector,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::Namespace,
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, OwnerReference, Time},
};
pub use kube::{Resource, ResourceExt};
