//! Watch on the pods scheduled to this node.
//!
//! Pods present when the watch starts are only inspected to find the
//! monitor's own containers; every other container seen running afterwards
//! is handed to the [`Orchestrator`] once.

use std::collections::HashSet;
use std::pin::pin;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::runtime::{WatchStreamExt, watcher};

use super::identity::{OwnerKind, OwnerLookup, OwnerRef};
use super::{KubeCluster, Result, credentials};
use crate::container::{self, ContainerID};
use crate::orchestrator::Orchestrator;
use crate::persistence::ArtifactPersister;
use crate::services::{RegistryCredential, SbomService, VulnerabilityService};

/// Namespace and name of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn of(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A running container as reported in a pod status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningContainer {
    pub container_id: ContainerID,
    pub name: String,
    pub image: String,
    pub image_digest: String,
}

/// Everything needed to start observing a container.
#[derive(Debug, Clone)]
pub struct ContainerStart {
    pub container_id: ContainerID,
    pub container_name: String,
    pub pod: PodKey,
    pub pod_owner: Option<OwnerRef>,
    pub image: String,
    pub image_digest: String,
    pub credentials: Vec<RegistryCredential>,
}

/// Containers of the pod that are in the running state.
pub fn running_containers(pod: &Pod) -> Vec<RunningContainer> {
    let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
    else {
        return Vec::new();
    };

    statuses
        .iter()
        .filter(|status| {
            status
                .state
                .as_ref()
                .is_some_and(|state| state.running.is_some())
        })
        .filter_map(|status| {
            let uri = status.container_id.as_deref()?;
            match ContainerID::from_runtime_uri(uri) {
                Ok(container_id) => Some(RunningContainer {
                    container_id,
                    name: status.name.clone(),
                    image: status.image.clone(),
                    image_digest: container::image_digest(&status.image_id).to_owned(),
                }),
                Err(err) => {
                    log::warn!("skipping container `{}`: {err}", status.name);
                    None
                }
            }
        })
        .collect()
}

/// First owner reference of the pod.
pub fn pod_owner(pod: &Pod) -> Option<OwnerRef> {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.first())
        .map(|owner| OwnerRef {
            kind: OwnerKind::parse(&owner.kind),
            name: owner.name.clone(),
        })
}

fn is_on_node(pod: &Pod, node_name: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .is_some_and(|name| name == node_name)
}

/// Pods listed by the current (re)list, collected until it completes.
#[derive(Debug, Default)]
struct Relist {
    /// Set once the first listing has completed.
    synced: bool,
    listed: Option<HashSet<PodKey>>,
}

pub struct PodWatch<O, S, V, P> {
    cluster: KubeCluster,
    node_name: String,
    self_pod_marker: String,
    fetch_credentials: bool,
    orchestrator: Orchestrator<O, S, V, P>,
    relist: Relist,
}

impl<O, S, V, P> PodWatch<O, S, V, P>
where
    O: OwnerLookup,
    S: SbomService,
    V: VulnerabilityService,
    P: ArtifactPersister,
{
    pub fn new(
        cluster: KubeCluster,
        node_name: impl Into<String>,
        self_pod_marker: impl Into<String>,
        orchestrator: Orchestrator<O, S, V, P>,
    ) -> Self {
        let fetch_credentials = orchestrator.services().relevant_cves;
        Self {
            cluster,
            node_name: node_name.into(),
            self_pod_marker: self_pod_marker.into(),
            fetch_credentials,
            orchestrator,
            relist: Relist::default(),
        }
    }

    /// Watches pods on this node until the stream ends.
    ///
    /// Watch errors are logged; the watcher retries with backoff.
    pub async fn run(mut self) -> Result<()> {
        let api: Api<Pod> = Api::all(self.cluster.client().clone());
        let config =
            watcher::Config::default().fields(&format!("spec.nodeName={}", self.node_name));

        log::info!("Watching pods on node `{}`", self.node_name);
        self.process(watcher(api, config).default_backoff()).await;

        Ok(())
    }

    /// Handles watch events until the stream ends.
    ///
    /// Pods of the first listing are only used to find the monitor's own
    /// containers. A later relist is treated like a series of updates, and
    /// finished containers of pods missing from it are forgotten.
    pub async fn process<St>(&mut self, events: St)
    where
        St: Stream<Item = std::result::Result<watcher::Event<Pod>, watcher::Error>>,
    {
        let mut events = pin!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(watcher::Event::Init) => self.relist.listed = Some(HashSet::new()),
                Ok(watcher::Event::InitApply(pod)) => {
                    self.identify_self(&pod);
                    if let Some(listed) = self.relist.listed.as_mut() {
                        listed.insert(PodKey::of(&pod));
                    }
                    if self.relist.synced {
                        self.on_pod_applied(&pod).await;
                    }
                }
                Ok(watcher::Event::InitDone) => {
                    if let Some(listed) = self.relist.listed.take() {
                        self.orchestrator.retain_pods(&listed);
                    }
                    self.relist.synced = true;
                }
                Ok(watcher::Event::Apply(pod)) => {
                    self.identify_self(&pod);
                    self.on_pod_applied(&pod).await;
                }
                Ok(watcher::Event::Delete(pod)) => {
                    self.orchestrator.forget_pod(&PodKey::of(&pod));
                }
                Err(err) => log::error!("pod watch error: {err}"),
            }
        }
    }

    fn is_self_pod(&self, pod: &Pod) -> bool {
        pod.metadata
            .name
            .as_deref()
            .is_some_and(|name| name.contains(&self.self_pod_marker))
    }

    fn identify_self(&self, pod: &Pod) {
        if !self.is_self_pod(pod) || !is_on_node(pod, &self.node_name) {
            return;
        }
        for container in running_containers(pod) {
            self.orchestrator
                .accumulator()
                .add_self_container(container.container_id);
        }
    }

    async fn on_pod_applied(&self, pod: &Pod) {
        if !is_on_node(pod, &self.node_name) || self.is_self_pod(pod) {
            return;
        }
        let key = PodKey::of(pod);
        for container in running_containers(pod) {
            if self
                .orchestrator
                .accumulator()
                .is_self_container(&container.container_id)
                || self.orchestrator.is_tracked(&container.container_id)
            {
                continue;
            }

            let credentials = if self.fetch_credentials {
                credentials::pod_credentials(&self.cluster, pod, &container.image).await
            } else {
                Vec::new()
            };
            self.orchestrator
                .on_container_started(ContainerStart {
                    container_id: container.container_id,
                    container_name: container.name,
                    pod: key.clone(),
                    pod_owner: pod_owner(pod),
                    image: container.image,
                    image_digest: container.image_digest,
                    credentials,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateWaiting, ContainerStatus, PodSpec,
        PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    use super::*;
    use crate::accumulator::Accumulator;
    use crate::orchestrator::testing::{
        FakeSbom, FakeScanner, NoOwners, RecordingPersister, TestOrchestrator,
    };
    use crate::orchestrator::{Collaborators, PostDeadlineQueue, Settings};
    use crate::services::{EnabledServices, Sbom, VulnerabilityReport};

    fn status(name: &str, id: Option<&str>, running: bool) -> ContainerStatus {
        let state = if running {
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..ContainerState::default()
            }
        } else {
            ContainerState {
                waiting: Some(ContainerStateWaiting::default()),
                ..ContainerState::default()
            }
        };
        ContainerStatus {
            name: name.to_owned(),
            container_id: id.map(str::to_owned),
            image: "nginx:1.25".to_owned(),
            image_id: "docker-pullable://nginx@sha256:abcd".to_owned(),
            state: Some(state),
            ..ContainerStatus::default()
        }
    }

    fn pod(statuses: Vec<ContainerStatus>) -> Pod {
        pod_named("web-7c9f-abcde", statuses)
    }

    fn pod_named(name: &str, statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_owned()),
                name: Some(name.to_owned()),
                owner_references: Some(vec![OwnerReference {
                    kind: "ReplicaSet".to_owned(),
                    name: "web-7c9f".to_owned(),
                    ..OwnerReference::default()
                }]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".to_owned()),
                ..PodSpec::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(statuses),
                ..PodStatus::default()
            }),
        }
    }

    #[test]
    fn only_running_containers_with_ids_are_reported() {
        let pod = pod(vec![
            status("web", Some("containerd://0123456789abcdef0123"), true),
            status("sidecar", Some("containerd://fedcba9876543210fedc"), false),
            status("init", None, true),
            status("broken", Some("no-scheme"), true),
        ]);

        let running = running_containers(&pod);
        assert_eq!(
            running,
            vec![RunningContainer {
                container_id: ContainerID::new("0123456789ab").unwrap(),
                name: "web".to_owned(),
                image: "nginx:1.25".to_owned(),
                image_digest: "nginx@sha256:abcd".to_owned(),
            }]
        );
    }

    #[test]
    fn pod_without_status_has_no_running_containers() {
        let mut pod = pod(Vec::new());
        pod.status = None;
        assert!(running_containers(&pod).is_empty());
    }

    #[test]
    fn owner_and_node_of_pod() {
        let pod = pod(Vec::new());
        assert_eq!(
            pod_owner(&pod),
            Some(OwnerRef {
                kind: OwnerKind::ReplicaSet,
                name: "web-7c9f".to_owned()
            })
        );
        assert!(is_on_node(&pod, "worker-1"));
        assert!(!is_on_node(&pod, "worker-2"));
        assert_eq!(PodKey::of(&pod).to_string(), "default/web-7c9f-abcde");
    }

    type TestWatch = PodWatch<NoOwners, FakeSbom, FakeScanner, RecordingPersister>;

    fn pod_watch() -> (TestWatch, TestOrchestrator, PostDeadlineQueue) {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let cluster = KubeCluster::new(kube::Client::try_from(config).unwrap());
        let (orchestrator, queue) = Orchestrator::new(
            Arc::new(Accumulator::new(10)),
            Collaborators {
                owners: NoOwners,
                sbom: FakeSbom(Ok(Sbom {
                    packages: Vec::new(),
                })),
                vulnerabilities: FakeScanner(VulnerabilityReport {
                    vulnerabilities: Vec::new(),
                }),
                persister: RecordingPersister::default(),
            },
            Settings {
                window: Duration::from_secs(300),
                services: EnabledServices {
                    relevant_cves: false,
                    container_profiling: false,
                },
                retained_containers: 8,
            },
        );
        let watch = PodWatch::new(cluster, "worker-1", "creo-sniffer", orchestrator.clone());
        (watch, orchestrator, queue)
    }

    fn events(
        events: Vec<watcher::Event<Pod>>,
    ) -> impl Stream<Item = std::result::Result<watcher::Event<Pod>, watcher::Error>> {
        futures::stream::iter(events.into_iter().map(Ok))
    }

    fn id(short: &str) -> ContainerID {
        ContainerID::new(short).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn relists_observe_new_containers_and_prune_vanished_pods() {
        let (mut watch, orchestrator, _queue) = pod_watch();
        let web = pod(vec![status("web", Some("containerd://0123456789abcdef0123"), true)]);
        let api = pod_named(
            "api-5d8b-fghij",
            vec![status("api", Some("containerd://aaaaaaaaaaaa0000"), true)],
        );

        watch
            .process(events(vec![
                watcher::Event::Init,
                watcher::Event::InitApply(web.clone()),
                watcher::Event::InitDone,
            ]))
            .await;
        assert!(!orchestrator.is_tracked(&id("0123456789ab")));

        watch.process(events(vec![watcher::Event::Apply(api)])).await;
        assert!(orchestrator.container(&id("aaaaaaaaaaaa")).is_some());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(orchestrator.active().is_empty());
        assert!(orchestrator.is_tracked(&id("aaaaaaaaaaaa")));

        watch
            .process(events(vec![
                watcher::Event::Init,
                watcher::Event::InitApply(web),
                watcher::Event::InitDone,
            ]))
            .await;
        assert!(!orchestrator.is_tracked(&id("aaaaaaaaaaaa")));
        assert!(orchestrator.container(&id("0123456789ab")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn every_container_of_the_own_pod_is_excluded() {
        let (mut watch, orchestrator, _queue) = pod_watch();
        let own = pod_named(
            "creo-sniffer-abcde",
            vec![
                status("sniffer", Some("containerd://bbbbbbbbbbbb0000"), true),
                status("tracer", Some("containerd://cccccccccccc0000"), true),
            ],
        );

        watch
            .process(events(vec![
                watcher::Event::Init,
                watcher::Event::InitDone,
                watcher::Event::Apply(own),
            ]))
            .await;

        for short in ["bbbbbbbbbbbb", "cccccccccccc"] {
            assert!(orchestrator.accumulator().is_self_container(&id(short)));
            assert!(!orchestrator.is_tracked(&id(short)));
        }
    }
}
