//! Kubernetes integration: owner-chain resolution, registry credentials and
//! the watch on pods scheduled to this node.
mod cluster;
pub mod credentials;
pub mod identity;
pub mod watch;

pub use cluster::KubeCluster;
pub use identity::{OwnerKind, OwnerLookup, OwnerRef, ResourceIdentity};
pub use watch::{ContainerStart, PodKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create kubernetes client: {0}")]
    Client(#[source] kube::Error),
    #[error("kubernetes request failed: {0}")]
    Api(#[from] kube::Error),
    #[error("pod watch failed: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
