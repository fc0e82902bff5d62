use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames,
};
use kube::api::ListParams;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use super::identity::{FetchedOwner, OwnerKind, OwnerLookup, OwnerRef};
use super::{Error, Result};

/// Cluster reads backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects with the in-cluster service account or the local kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.map_err(Error::Client)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn fetch<K>(&self, name: &str, namespace: &str) -> Result<FetchedOwner>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let object = api.get(name).await?;
        Ok(FetchedOwner {
            name: object.name_any(),
            owner: object.owner_references().first().map(|owner| OwnerRef {
                kind: OwnerKind::parse(&owner.kind),
                name: owner.name.clone(),
            }),
        })
    }

    /// Fetches a secret, `None` if it does not exist.
    pub async fn secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

impl OwnerLookup for KubeCluster {
    async fn get_owner(
        &self,
        kind: &OwnerKind,
        name: &str,
        namespace: &str,
    ) -> Result<FetchedOwner> {
        match kind {
            OwnerKind::Deployment => self.fetch::<Deployment>(name, namespace).await,
            OwnerKind::DaemonSet => self.fetch::<DaemonSet>(name, namespace).await,
            OwnerKind::StatefulSet => self.fetch::<StatefulSet>(name, namespace).await,
            OwnerKind::Job => self.fetch::<Job>(name, namespace).await,
            OwnerKind::CronJob => self.fetch::<CronJob>(name, namespace).await,
            OwnerKind::ReplicaSet => self.fetch::<ReplicaSet>(name, namespace).await,
            other => Err(Error::Other(format!(
                "no lookup for owner kind `{}`",
                other.as_str()
            ))),
        }
    }

    async fn custom_resource_kinds(&self) -> Result<Vec<String>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = api.list(&ListParams::default()).await?;
        Ok(crds
            .items
            .into_iter()
            .map(crd_kind)
            .collect())
    }
}

/// Kind served by the CRD, as accepted by the API server.
///
/// Falls back to the requested kind while the CRD is not yet established.
fn crd_kind(crd: CustomResourceDefinition) -> String {
    let accepted: Option<CustomResourceDefinitionNames> = crd
        .status
        .and_then(|status| status.accepted_names.into());
    match accepted {
        Some(names) if !names.kind.is_empty() => names.kind,
        _ => crd.spec.names.kind,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
        CustomResourceDefinitionSpec, CustomResourceDefinitionStatus,
    };

    use super::*;

    fn names(kind: &str) -> CustomResourceDefinitionNames {
        CustomResourceDefinitionNames {
            kind: kind.to_owned(),
            plural: kind.to_lowercase(),
            ..CustomResourceDefinitionNames::default()
        }
    }

    fn crd(requested: &str, accepted: Option<&str>) -> CustomResourceDefinition {
        CustomResourceDefinition {
            spec: CustomResourceDefinitionSpec {
                names: names(requested),
                ..CustomResourceDefinitionSpec::default()
            },
            status: accepted.map(|kind| CustomResourceDefinitionStatus {
                accepted_names: names(kind).into(),
                ..CustomResourceDefinitionStatus::default()
            }),
            ..CustomResourceDefinition::default()
        }
    }

    #[test]
    fn accepted_kind_is_preferred() {
        assert_eq!(crd_kind(crd("Rollout", Some("Rollout2"))), "Rollout2");
        assert_eq!(crd_kind(crd("Rollout", None)), "Rollout");
        assert_eq!(crd_kind(crd("Rollout", Some(""))), "Rollout");
    }
}
