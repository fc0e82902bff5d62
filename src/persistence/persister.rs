use super::{ContainerArtifact, Result};

/// Stores the artifacts derived for a container, one write per service.
pub trait ArtifactPersister: Send + Sync + 'static {
    fn persist_artifact(
        &self,
        artifact: &ContainerArtifact,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
