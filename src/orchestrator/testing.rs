//! In-memory collaborators for orchestrator tests.

use std::sync::{Arc, Mutex};

use crate::k8s::identity::FetchedOwner;
use crate::k8s::{self, OwnerKind, OwnerLookup};
use crate::persistence::{self, ArtifactPersister, ContainerArtifact};
use crate::services::{
    self, RegistryCredential, Sbom, SbomService, VulnerabilityReport, VulnerabilityService,
};

pub struct NoOwners;

impl OwnerLookup for NoOwners {
    async fn get_owner(
        &self,
        kind: &OwnerKind,
        name: &str,
        _namespace: &str,
    ) -> k8s::Result<FetchedOwner> {
        Err(k8s::Error::Other(format!("{} `{name}` not found", kind.as_str())))
    }

    async fn custom_resource_kinds(&self) -> k8s::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

pub struct FakeSbom(pub services::Result<Sbom>);

impl SbomService for FakeSbom {
    async fn generate(&self, _image: &str, _: &[RegistryCredential]) -> services::Result<Sbom> {
        self.0.clone()
    }
}

pub struct FakeScanner(pub VulnerabilityReport);

impl VulnerabilityService for FakeScanner {
    async fn scan(
        &self,
        _image: &str,
        _: &[RegistryCredential],
    ) -> services::Result<VulnerabilityReport> {
        Ok(self.0.clone())
    }
}

#[derive(Clone, Default)]
pub struct RecordingPersister {
    pub artifacts: Arc<Mutex<Vec<ContainerArtifact>>>,
    pub fail: bool,
}

impl ArtifactPersister for RecordingPersister {
    async fn persist_artifact(&self, artifact: &ContainerArtifact) -> persistence::Result<()> {
        if self.fail {
            return Err(persistence::Error::Other("database unavailable".to_owned()));
        }
        self.artifacts.lock().unwrap().push(artifact.clone());
        Ok(())
    }
}

pub type TestOrchestrator = super::Orchestrator<NoOwners, FakeSbom, FakeScanner, RecordingPersister>;
