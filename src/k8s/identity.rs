//! Resource identity of a container: the namespace, the top-most controller
//! owning its pod and the image it runs. Persisted artifacts are named after
//! it, so every replica of a workload maps to the same name.

use std::future::Future;

use super::Result;

pub const UNKNOWN_KIND: &str = "unknownType";
pub const UNKNOWN_NAME: &str = "unknownName";

/// Owner chains longer than this are treated as broken.
const MAX_OWNER_DEPTH: usize = 8;

/// Kinds of objects that can own a pod, directly or transitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    Job,
    CronJob,
    ReplicaSet,
    Pod,
    Node,
    /// Any other kind, resolved against the cluster's custom resource
    /// definitions.
    Custom(String),
}

impl OwnerKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "Deployment" => OwnerKind::Deployment,
            "DaemonSet" => OwnerKind::DaemonSet,
            "StatefulSet" => OwnerKind::StatefulSet,
            "Job" => OwnerKind::Job,
            "CronJob" => OwnerKind::CronJob,
            "ReplicaSet" => OwnerKind::ReplicaSet,
            "Pod" => OwnerKind::Pod,
            "Node" => OwnerKind::Node,
            other => OwnerKind::Custom(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            OwnerKind::Deployment => "Deployment",
            OwnerKind::DaemonSet => "DaemonSet",
            OwnerKind::StatefulSet => "StatefulSet",
            OwnerKind::Job => "Job",
            OwnerKind::CronJob => "CronJob",
            OwnerKind::ReplicaSet => "ReplicaSet",
            OwnerKind::Pod => "Pod",
            OwnerKind::Node => "Node",
            OwnerKind::Custom(kind) => kind,
        }
    }
}

/// Reference from an object to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: OwnerKind,
    pub name: String,
}

/// An owner object as returned by the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedOwner {
    pub name: String,
    /// First owner reference of the fetched object, if any.
    pub owner: Option<OwnerRef>,
}

/// Cluster reads needed to walk an owner chain.
pub trait OwnerLookup: Send + Sync + 'static {
    /// Fetches a namespaced object of a built-in kind.
    fn get_owner(
        &self,
        kind: &OwnerKind,
        name: &str,
        namespace: &str,
    ) -> impl Future<Output = Result<FetchedOwner>> + Send;

    /// Kinds served by the cluster's custom resource definitions.
    fn custom_resource_kinds(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Top of an owner chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedOwner {
    Resolved { kind: String, name: String },
    Unknown,
}

impl ResolvedOwner {
    fn resolved(kind: &OwnerKind, name: impl Into<String>) -> Self {
        ResolvedOwner::Resolved {
            kind: kind.as_str().to_owned(),
            name: name.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            ResolvedOwner::Resolved { kind, .. } => kind,
            ResolvedOwner::Unknown => UNKNOWN_KIND,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ResolvedOwner::Resolved { name, .. } => name,
            ResolvedOwner::Unknown => UNKNOWN_NAME,
        }
    }
}

/// Walks the owner chain starting at `start` up to its top-most owner.
///
/// Jobs and ReplicaSets are followed to their own owner when they have one.
/// Any failed lookup yields [`ResolvedOwner::Unknown`].
pub async fn resolve_owner(
    lookup: &impl OwnerLookup,
    start: OwnerRef,
    namespace: &str,
) -> ResolvedOwner {
    let mut current = start;
    for _ in 0..MAX_OWNER_DEPTH {
        match &current.kind {
            OwnerKind::Pod | OwnerKind::Node => {
                return ResolvedOwner::resolved(&current.kind, current.name);
            }
            OwnerKind::Custom(kind) => {
                return match lookup.custom_resource_kinds().await {
                    Ok(kinds) if kinds.iter().any(|k| k == kind) => {
                        ResolvedOwner::resolved(&current.kind, current.name)
                    }
                    Ok(_) => {
                        log::warn!("unknown owner kind `{kind}` of `{}`", current.name);
                        ResolvedOwner::Unknown
                    }
                    Err(err) => {
                        log::warn!("failed to list custom resource definitions: {err}");
                        ResolvedOwner::Unknown
                    }
                };
            }
            kind => {
                let fetched = match lookup.get_owner(kind, &current.name, namespace).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        log::warn!(
                            "failed to get {} `{}/{}`: {err}",
                            kind.as_str(),
                            namespace,
                            current.name
                        );
                        return ResolvedOwner::Unknown;
                    }
                };
                let follows_owner = matches!(kind, OwnerKind::Job | OwnerKind::ReplicaSet);
                match fetched.owner {
                    Some(owner) if follows_owner => current = owner,
                    _ => return ResolvedOwner::resolved(kind, fetched.name),
                }
            }
        }
    }

    log::warn!("owner chain of `{namespace}/{}` is too deep", current.name);
    ResolvedOwner::Unknown
}

/// Namespace, top-most owner and image of a container.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub ancestor_kind: String,
    pub ancestor_name: String,
    pub image: String,
}

impl ResourceIdentity {
    /// Resolves the identity of a container of the given pod.
    pub async fn resolve(
        lookup: &impl OwnerLookup,
        namespace: &str,
        pod_name: &str,
        pod_owner: Option<OwnerRef>,
        image: &str,
    ) -> Self {
        let owner = match pod_owner {
            Some(owner) => resolve_owner(lookup, owner, namespace).await,
            None => ResolvedOwner::resolved(&OwnerKind::Pod, pod_name),
        };
        log::debug!(
            "resolved identity namespace-{namespace}/{}-{}/imagename-{image}",
            owner.kind(),
            owner.name()
        );

        Self {
            namespace: namespace.to_owned(),
            ancestor_kind: owner.kind().to_owned(),
            ancestor_name: owner.name().to_owned(),
            image: image.to_owned(),
        }
    }

    /// Stable artifact name, e.g.
    /// `namespace-default.deployment-nginx.imagename-nginx:1.25`.
    pub fn resource_name(&self) -> String {
        format!(
            "namespace-{}.{}-{}.imagename-{}",
            self.namespace,
            self.ancestor_kind.to_lowercase(),
            self.ancestor_name,
            self.image
        )
    }
}
