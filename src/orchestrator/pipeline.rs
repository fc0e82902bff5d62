//! Post-deadline work: one task per enabled service and container, consumed
//! in FIFO order by a single worker.

use tokio::sync::mpsc;

use super::state::{ContainerState, PhaseError};
use crate::container::ContainerID;
use crate::persistence::{self, ContainerArtifact};
use crate::profile::SyscallProfile;
use crate::services::{self, SbomService, Service, VulnerabilityService};

/// Maximum number of queued post-deadline tasks.
pub const QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDeadlineTask {
    pub container_id: ContainerID,
    pub service: Service,
}

/// Receiving end of the post-deadline queue.
#[derive(Debug)]
pub struct PostDeadlineQueue {
    rx: mpsc::Receiver<PostDeadlineTask>,
}

impl PostDeadlineQueue {
    pub(super) fn channel() -> (mpsc::Sender<PostDeadlineTask>, Self) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<PostDeadlineTask> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PostDeadlineTask> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("required phase failed: {0}")]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Service(#[from] services::Error),
    #[error(transparent)]
    Persistence(#[from] persistence::Error),
}

/// Derives the artifact of one service from the container's completed
/// phases.
pub async fn derive_artifact<S, V>(
    sbom_service: &S,
    vulnerability_service: &V,
    state: &ContainerState,
    service: Service,
) -> Result<ContainerArtifact, Error>
where
    S: SbomService,
    V: VulnerabilityService,
{
    let aggregation = state.aggregation.wait().await?;
    let mut artifact = ContainerArtifact {
        resource_name: state.resource_name.clone(),
        service,
        vulnerabilities: None,
        syscall_profile: None,
    };

    match service {
        Service::ContainerProfiling => {
            artifact.syscall_profile = Some(SyscallProfile::allow_only(aggregation.syscall_list()));
        }
        Service::RelevantCves => {
            let sbom = state.sbom.wait().await?;
            let in_use = sbom_service.filter(&sbom, &aggregation.files)?;
            let report = state.vulnerabilities.wait().await?;
            let relevant = vulnerability_service.filter(&report, &in_use)?;
            log::info!(
                "{} of {} vulnerabilities of `{}` are relevant",
                relevant.vulnerabilities.len(),
                report.vulnerabilities.len(),
                state.resource_name
            );
            artifact.vulnerabilities = Some(relevant);
        }
    }

    Ok(artifact)
}
