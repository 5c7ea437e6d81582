#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use rbac_controller_core as core;
pub use rbac_controller_k8s_api as k8s;
pub use rbac_controller_k8s_rbac as rbac;

mod args;
pub mod controller;
pub mod health;
mod lease;
pub mod metrics;
pub mod queue;
pub mod reconcile;

pub use self::{
    args::Args,
    controller::{Action, Controller, Leadership, Reconcile},
    health::Health,
    metrics::ReconcileMetrics,
    queue::WorkQueue,
    reconcile::{ConfigReconciler, NamespaceReconciler},
};
