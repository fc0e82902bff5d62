//! Post-processing services and the image scanners they depend on.
//!
//! Two services can be enabled independently:
//!
//! - [`Service::RelevantCves`] narrows the image SBOM down to the files a
//!   container actually used and keeps only the vulnerabilities of the
//!   remaining packages.
//! - [`Service::ContainerProfiling`] turns the observed syscalls into a
//!   seccomp allow-list.
//!
//! SBOM generation and vulnerability lookup are external. They are reached
//! through [`SbomService`] and [`VulnerabilityService`]; [`command`] provides
//! implementations backed by CLI scanners.
pub mod command;
mod models;

use std::collections::BTreeSet;
use std::future::Future;

pub use models::{Package, RegistryCredential, Sbom, Vulnerability, VulnerabilityReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Service {
    #[serde(rename = "relevantCVEs")]
    RelevantCves,
    #[serde(rename = "containerProfiling")]
    ContainerProfiling,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::RelevantCves => "relevantCVEs",
            Service::ContainerProfiling => "containerProfiling",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which services run after an observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledServices {
    pub relevant_cves: bool,
    pub container_profiling: bool,
}

impl EnabledServices {
    /// Enabled services in the order their post-deadline tasks are queued.
    pub fn iter(&self) -> impl Iterator<Item = Service> {
        [
            (self.container_profiling, Service::ContainerProfiling),
            (self.relevant_cves, Service::RelevantCves),
        ]
        .into_iter()
        .filter_map(|(enabled, service)| enabled.then_some(service))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("failed to run `{program}`: {reason}")]
    Command { program: String, reason: String },
    #[error("`{program}` exited unsuccessfully ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("failed to decode output of `{program}`: {reason}")]
    Decode { program: String, reason: String },
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Produces the software bill of materials of an image.
pub trait SbomService: Send + Sync + 'static {
    fn generate(
        &self,
        image: &str,
        credentials: &[RegistryCredential],
    ) -> impl Future<Output = Result<Sbom>> + Send;

    /// Keeps only the packages owning at least one of the in-use files.
    fn filter(&self, sbom: &Sbom, in_use: &BTreeSet<String>) -> Result<Sbom> {
        Ok(sbom.retain_files(in_use))
    }
}

/// Looks up the known vulnerabilities of an image.
pub trait VulnerabilityService: Send + Sync + 'static {
    fn scan(
        &self,
        image: &str,
        credentials: &[RegistryCredential],
    ) -> impl Future<Output = Result<VulnerabilityReport>> + Send;

    /// Keeps only the findings of packages present in the given SBOM.
    fn filter(&self, report: &VulnerabilityReport, sbom: &Sbom) -> Result<VulnerabilityReport> {
        Ok(report.relevant_to(sbom))
    }
}
