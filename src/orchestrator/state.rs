use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::aggregator::AggregationReport;
use crate::container::ContainerID;
use crate::k8s::{PodKey, ResourceIdentity};
use crate::services::{RegistryCredential, Sbom, VulnerabilityReport};

/// Lifecycle of an observed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Starting,
    Watching,
    StoppedByTimer,
    StoppedByOverflow,
    PipelineRunning,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PhaseError(String);

impl PhaseError {
    pub fn new(reason: impl Display) -> Self {
        Self(reason.to_string())
    }
}

pub type PhaseResult<T> = std::result::Result<Arc<T>, PhaseError>;

/// Single-assignment result of an asynchronous phase that any number of
/// readers can wait for.
#[derive(Debug)]
pub struct Completion<T> {
    tx: watch::Sender<Option<PhaseResult<T>>>,
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

impl<T> Completion<T> {
    /// Stores the result. Later calls are ignored.
    pub fn complete<E: Display>(&self, result: std::result::Result<T, E>) {
        let result = result.map(Arc::new).map_err(PhaseError::new);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    pub async fn wait(&self) -> PhaseResult<T> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot
                .clone()
                .unwrap_or_else(|| Err(PhaseError::new("phase has no result"))),
            Err(_) => Err(PhaseError::new("phase was abandoned")),
        }
    }

    pub fn status(&self) -> CompletionStatus {
        match &*self.tx.borrow() {
            None => CompletionStatus::Pending,
            Some(Ok(_)) => CompletionStatus::Succeeded,
            Some(Err(err)) => CompletionStatus::Failed {
                reason: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CompletionStatus {
    Pending,
    Succeeded,
    Failed { reason: String },
}

/// Everything known about one observed container.
#[derive(Debug)]
pub struct ContainerState {
    pub container_id: ContainerID,
    pub container_name: String,
    pub pod: PodKey,
    pub image: String,
    pub image_digest: String,
    pub identity: ResourceIdentity,
    pub resource_name: String,
    pub credentials: Vec<RegistryCredential>,
    pub observed_at: DateTime<Utc>,
    pub deadline: tokio::time::Instant,
    pub sbom: Completion<Sbom>,
    pub vulnerabilities: Completion<VulnerabilityReport>,
    pub aggregation: Completion<AggregationReport>,
    phase: Mutex<Phase>,
    pending_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
}

impl ContainerState {
    pub fn new(
        start: crate::k8s::ContainerStart,
        identity: ResourceIdentity,
        deadline: tokio::time::Instant,
    ) -> Self {
        Self {
            resource_name: identity.resource_name(),
            container_id: start.container_id,
            container_name: start.container_name,
            pod: start.pod,
            image: start.image,
            image_digest: start.image_digest,
            identity,
            credentials: start.credentials,
            observed_at: Utc::now(),
            deadline,
            sbom: Completion::default(),
            vulnerabilities: Completion::default(),
            aggregation: Completion::default(),
            phase: Mutex::new(Phase::Starting),
            pending_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_phase(&self, phase: Phase) {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != phase {
            log::debug!(
                "container `{}`: {:?} -> {:?}",
                self.container_id,
                *current,
                phase
            );
            *current = phase;
        }
    }

    pub fn expect_tasks(&self, count: usize) {
        self.pending_tasks.store(count, Ordering::SeqCst);
    }

    /// Records a finished post-deadline task and returns `true` for the last
    /// one.
    pub fn task_done(&self, failed: bool) -> bool {
        if failed {
            self.failed_tasks.fetch_add(1, Ordering::SeqCst);
        }
        self.pending_tasks.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn failed_tasks(&self) -> usize {
        self.failed_tasks.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            container_id: self.container_id.clone(),
            container_name: self.container_name.clone(),
            pod: self.pod.clone(),
            image: self.image.clone(),
            resource_name: self.resource_name.clone(),
            phase: self.phase(),
            observed_at: self.observed_at,
            sbom: self.sbom.status(),
            vulnerabilities: self.vulnerabilities.status(),
            aggregation: self.aggregation.status(),
        }
    }
}

/// Point-in-time view of an active container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    pub container_id: ContainerID,
    pub container_name: String,
    pub pod: PodKey,
    pub image: String,
    pub resource_name: String,
    pub phase: Phase,
    pub observed_at: DateTime<Utc>,
    pub sbom: CompletionStatus,
    pub vulnerabilities: CompletionStatus,
    pub aggregation: CompletionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Outcome {
    Completed { failed_tasks: usize },
    Aborted { reason: String },
}

/// A container whose observation has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub container_id: ContainerID,
    pub pod: PodKey,
    pub resource_name: String,
    pub outcome: Outcome,
    pub observed_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Bounded history of finished containers, oldest dropped first.
#[derive(Debug)]
pub struct Retention {
    capacity: usize,
    records: Mutex<VecDeque<ContainerRecord>>,
}

impl Retention {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, record: ContainerRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}
