//! Reconcilers driven by the controller work queues.

mod config;
mod namespace;

pub use self::{config::ConfigReconciler, namespace::NamespaceReconciler};
use crate::k8s::Time;

/// Labels reconciliation metrics for the config controller.
pub const CONFIG_CONTROLLER: &str = "NamespaceRBACConfig";

/// Labels reconciliation metrics for the namespace controller.
pub const NAMESPACE_CONTROLLER: &str = "Namespace";

fn now() -> Time {
    Time(chrono::Utc::now())
}
