use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::ToSocketAddrs;

use crate::accumulator::Accumulator;
use crate::container::ContainerID;
use crate::k8s::OwnerLookup;
use crate::orchestrator::{ContainerRecord, ContainerSummary, Orchestrator};
use crate::persistence::{ArtifactPersister, MySqlArtifactPersister};
use crate::services::{SbomService, VulnerabilityService};

/// Read access to the observed containers.
pub trait ContainerDirectory: Send + Sync + 'static {
    fn active(&self) -> Vec<ContainerSummary>;
    fn retained(&self) -> Vec<ContainerRecord>;
}

impl<O, S, V, P> ContainerDirectory for Orchestrator<O, S, V, P>
where
    O: OwnerLookup,
    S: SbomService,
    V: VulnerabilityService,
    P: ArtifactPersister,
{
    fn active(&self) -> Vec<ContainerSummary> {
        Orchestrator::active(self)
    }

    fn retained(&self) -> Vec<ContainerRecord> {
        Orchestrator::retained(self)
    }
}

#[derive(Clone)]
pub struct ApiState {
    containers: Arc<dyn ContainerDirectory>,
    accumulator: Arc<Accumulator>,
    artifacts: MySqlArtifactPersister,
}

impl ApiState {
    pub fn new(
        containers: Arc<dyn ContainerDirectory>,
        accumulator: Arc<Accumulator>,
        artifacts: MySqlArtifactPersister,
    ) -> Self {
        Self {
            containers,
            accumulator,
            artifacts,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ContainersBody {
    active: Vec<ContainerSummary>,
    retained: Vec<ContainerRecord>,
}

async fn list_containers(State(state): State<ApiState>) -> Json<ContainersBody> {
    Json(ContainersBody {
        active: state.containers.active(),
        retained: state.containers.retained(),
    })
}

async fn container_events(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let container_id = match ContainerID::new(&id) {
        Ok(container_id) => container_id,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    let events = state.accumulator.query_by_container(&container_id);

    (StatusCode::OK, Json(events)).into_response()
}

async fn resource_artifacts(
    State(state): State<ApiState>,
    Path(resource_name): Path<String>,
) -> Response {
    match state.artifacts.artifacts_of(&resource_name).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(err) => {
            log::error!("Failed to query artifacts of `{resource_name}`: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to query artifacts",
            )
                .into_response()
        }
    }
}

pub fn router(state: ApiState) -> axum::Router {
    axum::Router::new()
        .route("/containers", get(list_containers))
        .route("/containers/{id}/events", get(container_events))
        .route("/artifacts/{resource_name}", get(resource_artifacts))
        .with_state(state)
}

pub struct APIServer {
    router: axum::Router,
}

impl APIServer {
    pub fn new(state: ApiState) -> Self {
        Self {
            router: router(state),
        }
    }

    pub async fn listen(self, addr: impl ToSocketAddrs) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("Diagnostics API listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router.into_make_service()).await
    }
}
