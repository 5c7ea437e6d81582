//! The seam between the controller and the cluster's object store.

use crate::k8s::{
    labels::Map, ClusterRole, ClusterRoleBinding, Namespace, NamespaceRbacConfig, Resource,
    ResourceExt, Role, RoleBinding,
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, future::Future};
use tokio::time;

/// A resource type the controller reads or writes.
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const NAMESPACED: bool;

    /// Builds an API handle for the type. Namespaced types use the cluster-wide
    /// endpoint when `namespace` is `None`; cluster-scoped types ignore it.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

/// Reads and writes cluster objects with optimistic concurrency: `replace`
/// fails with [`Error::Conflict`] when the object's resource version is stale.
#[async_trait::async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    /// Lists objects of every namespace that carry all of `labels`.
    async fn list<K: Object>(&self, labels: &Map) -> Result<Vec<K>>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    async fn replace<K: Object>(&self, obj: &K) -> Result<K>;

    /// Writes the object's status subresource.
    async fn update_status<K: Object>(&self, obj: &K) -> Result<()>;

    async fn delete<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()>;
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("request timed out after {0:?}")]
    Timeout(time::Duration),

    #[error(transparent)]
    Api(kube::Error),

    #[error("failed to encode object: {0}")]
    Codec(#[from] serde_json::Error),
}

/// A [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    timeout: time::Duration,
}

macro_rules! namespaced {
    ($($ty:ty),+) => {
        $(
            impl Object for $ty {
                const NAMESPACED: bool = true;

                fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )+
    };
}

macro_rules! cluster {
    ($($ty:ty),+) => {
        $(
            impl Object for $ty {
                const NAMESPACED: bool = false;

                fn api(client: Client, _: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )+
    };
}

namespaced!(Role, RoleBinding);
cluster!(
    ClusterRole,
    ClusterRoleBinding,
    Namespace,
    NamespaceRbacConfig
);

/// Formats labels as an equality-based label selector.
pub fn label_selector(labels: &Map) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// === impl Error ===

impl Error {
    /// Indicates that the write lost an optimistic-concurrency race and may be
    /// retried against a fresh read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Classifies the error for the `error_type` metric label.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict(_) | Self::AlreadyExists(_) => "conflict",
            Self::Timeout(_) => "timeout",
            Self::Api(kube::Error::Api(rsp)) if rsp.code == 401 => "unauthorized",
            Self::Api(kube::Error::Api(rsp)) if rsp.code == 403 => "forbidden",
            Self::Api(kube::Error::Api(_)) | Self::Codec(_) => "unknown",
            Self::Api(_) => "network",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(rsp) if rsp.code == 404 => Self::NotFound,
            kube::Error::Api(rsp) if rsp.code == 409 && rsp.reason == "AlreadyExists" => {
                Self::AlreadyExists(rsp.message)
            }
            kube::Error::Api(rsp) if rsp.code == 409 => Self::Conflict(rsp.message),
            error => Self::Api(error),
        }
    }
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client, timeout: time::Duration) -> Self {
        Self { client, timeout }
    }

    async fn call<T>(
        &self,
        call: impl Future<Output = kube::Result<T>> + Send,
    ) -> Result<T> {
        time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let api = K::api(self.client.clone(), namespace);
        self.call(api.get_opt(name)).await
    }

    async fn list<K: Object>(&self, labels: &Map) -> Result<Vec<K>> {
        let api = K::api(self.client.clone(), None);
        let params = ListParams::default().labels(&label_selector(labels));
        let list = self.call(api.list(&params)).await?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        self.call(api.create(&PostParams::default(), obj)).await
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K> {
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        let name = obj.name_any();
        self.call(api.replace(&name, &PostParams::default(), obj))
            .await
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<()> {
        let api = K::api(self.client.clone(), obj.namespace().as_deref());
        let name = obj.name_any();
        let mut value = serde_json::to_value(obj)?;
        let status = value
            .get_mut("status")
            .map(serde_json::Value::take)
            .unwrap_or_default();
        let patch = Patch::Merge(serde_json::json!({ "status": status }));
        self.call(api.patch_status(&name, &PatchParams::default(), &patch))
            .await?;
        Ok(())
    }

    async fn delete<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let api = K::api(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds,
            ..Default::default()
        };
        self.call(api.delete(name, &params)).await?;
        Ok(())
    }
}
