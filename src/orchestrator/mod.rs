//! Lifecycle of observed containers.
//!
//! For every container started on the node the orchestrator resolves its
//! resource identity, kicks off SBOM generation and vulnerability lookup,
//! and aggregates the container's trace events until either the
//! observation window elapses or the tracer reports dropped events:
//!
//! - on the deadline the aggregation is stopped and one post-deadline task
//!   per enabled service is queued;
//! - on overflow the observation is abandoned and nothing is queued.
//!
//! Post-deadline tasks are consumed by [`Orchestrator::run_post_deadline`].
//! A container leaves the active set once its last task is done, and is
//! remembered until its pod is deleted so that it is not observed twice.
mod pipeline;
mod state;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::accumulator::Accumulator;
use crate::aggregator::Aggregator;
use crate::container::ContainerID;
use crate::k8s::{ContainerStart, OwnerLookup, PodKey, ResourceIdentity};
use crate::persistence::ArtifactPersister;
use crate::services::{EnabledServices, SbomService, Service, VulnerabilityService};

pub use pipeline::{PostDeadlineQueue, PostDeadlineTask, QUEUE_DEPTH};
pub use state::{CompletionStatus, ContainerRecord, ContainerSummary, Outcome, Phase};

use state::{ContainerState, Retention};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub window: Duration,
    pub services: EnabledServices,
    pub retained_containers: usize,
}

/// External collaborators of the orchestrator.
pub struct Collaborators<O, S, V, P> {
    pub owners: O,
    pub sbom: S,
    pub vulnerabilities: V,
    pub persister: P,
}

struct Inner<O, S, V, P> {
    accumulator: Arc<Accumulator>,
    owners: O,
    sbom: S,
    vulnerabilities: V,
    persister: P,
    settings: Settings,
    active: DashMap<ContainerID, Arc<ContainerState>>,
    finished: DashMap<ContainerID, PodKey>,
    retained: Retention,
    queue: mpsc::Sender<PostDeadlineTask>,
}

enum Stop {
    Deadline,
    Aborted(String),
}

pub struct Orchestrator<O, S, V, P> {
    inner: Arc<Inner<O, S, V, P>>,
}

impl<O, S, V, P> Clone for Orchestrator<O, S, V, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O, S, V, P> Orchestrator<O, S, V, P>
where
    O: OwnerLookup,
    S: SbomService,
    V: VulnerabilityService,
    P: ArtifactPersister,
{
    /// Creates the orchestrator and the receiving end of its post-deadline
    /// queue.
    pub fn new(
        accumulator: Arc<Accumulator>,
        collaborators: Collaborators<O, S, V, P>,
        settings: Settings,
    ) -> (Self, PostDeadlineQueue) {
        let (queue, receiver) = PostDeadlineQueue::channel();
        let inner = Inner {
            accumulator,
            owners: collaborators.owners,
            sbom: collaborators.sbom,
            vulnerabilities: collaborators.vulnerabilities,
            persister: collaborators.persister,
            settings,
            active: DashMap::new(),
            finished: DashMap::new(),
            retained: Retention::new(settings.retained_containers),
            queue,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn accumulator(&self) -> &Arc<Accumulator> {
        &self.inner.accumulator
    }

    pub fn services(&self) -> EnabledServices {
        self.inner.settings.services
    }

    /// Whether the container is being observed or was already observed.
    pub fn is_tracked(&self, container_id: &ContainerID) -> bool {
        self.inner.active.contains_key(container_id) || self.inner.finished.contains_key(container_id)
    }

    /// Starts observing a container. Returns `false` if it is already
    /// tracked.
    pub async fn on_container_started(&self, start: ContainerStart) -> bool {
        if self.is_tracked(&start.container_id) {
            return false;
        }

        let identity = ResourceIdentity::resolve(
            &self.inner.owners,
            &start.pod.namespace,
            &start.pod.name,
            start.pod_owner.clone(),
            &start.image,
        )
        .await;
        let deadline = tokio::time::Instant::now() + self.inner.settings.window;
        let state = Arc::new(ContainerState::new(start, identity, deadline));

        match self.inner.active.entry(state.container_id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&state));
            }
        }
        log::info!(
            "Start sniffing container `{}` of pod `{}` as `{}` for {:?}",
            state.container_id,
            state.pod,
            state.resource_name,
            self.inner.settings.window
        );

        if self.inner.settings.services.relevant_cves {
            self.spawn_scans(&state);
        }
        let aggregator = Aggregator::spawn(
            Arc::clone(&self.inner.accumulator),
            state.container_id.clone(),
        );
        state.set_phase(Phase::Watching);
        tokio::spawn(self.clone().observe(state, aggregator));

        true
    }

    fn spawn_scans(&self, state: &Arc<ContainerState>) {
        let orchestrator = self.clone();
        let sbom_state = Arc::clone(state);
        tokio::spawn(async move {
            let result = orchestrator
                .inner
                .sbom
                .generate(&sbom_state.image, &sbom_state.credentials)
                .await;
            if let Err(err) = &result {
                log::error!("failed to generate SBOM of `{}`: {err}", sbom_state.image);
            }
            sbom_state.sbom.complete(result);
        });

        let orchestrator = self.clone();
        let scan_state = Arc::clone(state);
        tokio::spawn(async move {
            let result = orchestrator
                .inner
                .vulnerabilities
                .scan(&scan_state.image, &scan_state.credentials)
                .await;
            if let Err(err) = &result {
                log::error!("failed to scan `{}`: {err}", scan_state.image);
            }
            scan_state.vulnerabilities.complete(result);
        });
    }

    /// Races the observation deadline against the aggregator ending early.
    async fn observe(self, state: Arc<ContainerState>, mut aggregator: Aggregator) {
        let stop = tokio::select! {
            biased;
            _ = tokio::time::sleep_until(state.deadline) => Stop::Deadline,
            result = aggregator.finished() => match result {
                Err(err) => Stop::Aborted(err.to_string()),
                Ok(_) => Stop::Aborted("aggregation ended before the deadline".to_owned()),
            },
        };

        match stop {
            Stop::Deadline => {
                state.set_phase(Phase::StoppedByTimer);
                let report = aggregator.stop().await;
                match &report {
                    Ok(report) => log::info!(
                        "Stop sniffing container `{}`: {} events, {} syscalls, {} files",
                        state.container_id,
                        report.events,
                        report.syscalls.len(),
                        report.files.len()
                    ),
                    Err(err) => log::error!(
                        "Stop sniffing container `{}` with failed aggregation: {err}",
                        state.container_id
                    ),
                }
                state.aggregation.complete(report);
                self.enqueue(&state).await;
            }
            Stop::Aborted(reason) => {
                state.set_phase(Phase::StoppedByOverflow);
                log::error!(
                    "Stop sniffing container `{}` early, events were missed: {reason}",
                    state.container_id
                );
                state.aggregation.complete(Err(reason.as_str()));
                self.finish(&state, Outcome::Aborted { reason });
            }
        }
    }

    async fn enqueue(&self, state: &Arc<ContainerState>) {
        let services: Vec<Service> = self.inner.settings.services.iter().collect();
        if services.is_empty() {
            self.finish(state, Outcome::Completed { failed_tasks: 0 });
            return;
        }

        state.expect_tasks(services.len());
        for service in services {
            let task = PostDeadlineTask {
                container_id: state.container_id.clone(),
                service,
            };
            if self.inner.queue.send(task).await.is_err() {
                log::error!(
                    "post-deadline queue closed, dropping {service} of `{}`",
                    state.container_id
                );
                if state.task_done(true) {
                    self.finish(state, Outcome::Completed {
                        failed_tasks: state.failed_tasks(),
                    });
                }
            }
        }
    }

    /// Consumes post-deadline tasks one at a time until the queue closes.
    ///
    /// A failing task is logged and does not affect the other tasks of the
    /// same container.
    pub async fn run_post_deadline(&self, mut queue: PostDeadlineQueue) {
        while let Some(task) = queue.recv().await {
            let Some(state) = self
                .inner
                .active
                .get(&task.container_id)
                .map(|entry| Arc::clone(entry.value()))
            else {
                log::warn!("no active container `{}` for {}", task.container_id, task.service);
                continue;
            };
            state.set_phase(Phase::PipelineRunning);

            let result = match pipeline::derive_artifact(
                &self.inner.sbom,
                &self.inner.vulnerabilities,
                &state,
                task.service,
            )
            .await
            {
                Ok(artifact) => self
                    .inner
                    .persister
                    .persist_artifact(&artifact)
                    .await
                    .map_err(pipeline::Error::from),
                Err(err) => Err(err),
            };
            let failed = match result {
                Ok(()) => {
                    log::info!("Stored {} of `{}`", task.service, state.resource_name);
                    false
                }
                Err(err) => {
                    log::error!(
                        "failed to process {} of container `{}`: {err}",
                        task.service,
                        state.container_id
                    );
                    true
                }
            };

            if state.task_done(failed) {
                self.finish(&state, Outcome::Completed {
                    failed_tasks: state.failed_tasks(),
                });
            }
        }
        log::info!("post-deadline queue closed");
    }

    fn finish(&self, state: &ContainerState, outcome: Outcome) {
        state.set_phase(Phase::Done);
        self.inner.active.remove(&state.container_id);
        self.inner
            .finished
            .insert(state.container_id.clone(), state.pod.clone());
        self.inner.retained.push(ContainerRecord {
            container_id: state.container_id.clone(),
            pod: state.pod.clone(),
            resource_name: state.resource_name.clone(),
            outcome,
            observed_at: state.observed_at,
            finished_at: Utc::now(),
        });
    }

    /// Forgets the finished containers of a deleted pod.
    pub fn forget_pod(&self, pod: &PodKey) {
        self.inner.finished.retain(|_, owner| owner != pod);
    }

    /// Forgets the finished containers of every pod not in `live`.
    pub fn retain_pods(&self, live: &HashSet<PodKey>) {
        self.inner.finished.retain(|_, owner| live.contains(owner));
    }

    pub fn active(&self) -> Vec<ContainerSummary> {
        let mut summaries: Vec<ContainerSummary> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        summaries
    }

    pub fn container(&self, container_id: &ContainerID) -> Option<ContainerSummary> {
        self.inner
            .active
            .get(container_id)
            .map(|entry| entry.value().summary())
    }

    pub fn retained(&self) -> Vec<ContainerRecord> {
        self.inner.retained.snapshot()
    }
}
