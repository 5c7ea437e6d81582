#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use rbac_controller_core as core;
pub use rbac_controller_k8s_api as k8s;

mod manager;
mod metrics;
mod permission;
pub mod store;

pub use self::{
    manager::{Error, Manager, Operation},
    metrics::ManagerMetrics,
    permission::{merge_rules, merge_subjects, Permission, ResourceKind},
    store::{KubeStore, Object, Store},
};
