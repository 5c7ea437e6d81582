use crate::k8s::{labels, ObjectMeta, Resource};
use anyhow::Result;
use k8s_openapi::api::{apps::v1::Deployment, coordination::v1 as coordv1};
use kube::api::{Api, Patch, PatchParams};
use std::sync::Arc;
use tokio::{sync::watch, time};

pub const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "namespace-rbac-operator";

/// Creates the leader-election lease if needed and starts contending for it.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    lease_name: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<kubert::lease::Claim>>> {
    // The lease is garbage collected with the controller's deployment, when
    // there is one.
    let deployment = Api::<Deployment>::namespaced(runtime.client(), ns)
        .get_opt(deployment_name)
        .await?;
    let owner = deployment.and_then(|d| d.controller_owner_ref(&()));

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(lease_name.to_string()),
            namespace: Some(ns.to_string()),
            // A resource version of "0" only creates the Lease if it does not
            // already exist.
            resource_version: Some("0".to_string()),
            owner_references: owner.map(|o| vec![o]),
            labels: Some(
                [(
                    labels::OWNER_LABEL.to_string(),
                    labels::OWNER_VALUE.to_string(),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => tracing::debug!("Lease already exists"),
        Err(error) => return Err(error.into()),
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, lease_name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}
