//! Creo Sniffer: a node-level container monitor that traces the syscalls of
//! every container started on its Kubernetes node.
//!
//! Trace lines from an external tracer are cached in one-second buckets and
//! streamed to per-container aggregators. After an observation window each
//! container is turned into persisted artifacts: a syscall allow-list and
//! the vulnerabilities of the image packages it actually used.
use std::sync::Arc;

use accumulator::Accumulator;
use api::{APIServer, ApiState};
use config::Config;
use error::ResultOkLogExt;
use k8s::KubeCluster;
use k8s::watch::PodWatch;
use orchestrator::{Collaborators, Orchestrator, Settings};
use persistence::MySqlArtifactPersister;
use services::command::{CommandSbomService, CommandVulnerabilityService};

pub mod accumulator;
pub mod aggregator;
pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod k8s;
pub mod orchestrator;
pub mod persistence;
pub mod profile;
pub mod services;
pub mod trace;

/// Runs the monitor until the tracer exits.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the database or the
/// Kubernetes API cannot be reached, or the tracer cannot be started. Since
/// the tracer is expected to run forever, its exit is reported as
/// [`error::Error::Tracer`].
pub async fn run() -> error::Result<()> {
    let config = Config::from_env()?;

    let accumulator = Arc::new(Accumulator::new(config.cache_size));
    if let Some(own) = config.self_container.clone() {
        accumulator.add_self_container(own);
    }

    let persister = MySqlArtifactPersister::connect(&config.database_url).await?;
    let cluster = KubeCluster::connect().await?;

    let (stdout, tracer) = config.tracer.spawn()?.into_parts();
    {
        let accumulator = Arc::clone(&accumulator);
        tokio::spawn(async move {
            if let Err(err) = accumulator.consume(stdout).await {
                log::error!("Failed to read tracer output: {err}");
            }
        });
    }

    let (orchestrator, queue) = Orchestrator::new(
        Arc::clone(&accumulator),
        Collaborators {
            owners: cluster.clone(),
            sbom: CommandSbomService::new(&config.sbom_command),
            vulnerabilities: CommandVulnerabilityService::new(&config.vuln_command),
            persister: persister.clone(),
        },
        Settings {
            window: config.window,
            services: config.services,
            retained_containers: config.retained_containers,
        },
    );
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_post_deadline(queue).await });
    }

    let api = APIServer::new(ApiState::new(
        Arc::new(orchestrator.clone()),
        Arc::clone(&accumulator),
        persister,
    ));
    let addr = config.api_listen_addr;
    tokio::spawn(async move { api.listen(addr).await.ok_log() });

    let watch = PodWatch::new(
        cluster,
        config.node_name.clone(),
        config.self_pod_marker.clone(),
        orchestrator,
    );
    tokio::spawn(async move { watch.run().await.ok_log() });

    Err(tracer.wait().await.into())
}
