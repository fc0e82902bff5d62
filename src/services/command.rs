//! Scanner adapters that shell out to CLI tools.
//!
//! [`CommandSbomService`] expects a syft-compatible JSON document on stdout
//! and [`CommandVulnerabilityService`] a grype-compatible one. Registry
//! credentials are handed over through the `<PREFIX>_REGISTRY_AUTH_*`
//! environment variables both tools understand.

use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use super::{
    Error, Package, RegistryCredential, Result, Sbom, SbomService, Vulnerability,
    VulnerabilityReport, VulnerabilityService,
};

#[derive(Debug, Clone)]
struct Scanner {
    program: String,
    args: Vec<String>,
    env_prefix: &'static str,
}

impl Scanner {
    async fn run(&self, image: &str, credentials: &[RegistryCredential]) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command
            .arg(image)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(credential) = credentials.first() {
            let prefix = self.env_prefix;
            command
                .env(format!("{prefix}_REGISTRY_AUTH_AUTHORITY"), &credential.registry)
                .env(format!("{prefix}_REGISTRY_AUTH_USERNAME"), &credential.username)
                .env(format!("{prefix}_REGISTRY_AUTH_PASSWORD"), &credential.password);
            if !credential.auth.is_empty() {
                command.env(format!("{prefix}_REGISTRY_AUTH_TOKEN"), &credential.auth);
            }
        }

        log::debug!("Running `{}` for image `{}`", self.program, image);
        let output = command.output().await.map_err(|err| Error::Command {
            program: self.program.clone(),
            reason: err.to_string(),
        })?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(output.stdout)
    }

    fn decode<'a, T: Deserialize<'a>>(&self, raw: &'a [u8]) -> Result<T> {
        serde_json::from_slice(raw).map_err(|err| Error::Decode {
            program: self.program.clone(),
            reason: err.to_string(),
        })
    }
}

/// Generates SBOMs with a syft-compatible command.
#[derive(Debug, Clone)]
pub struct CommandSbomService {
    scanner: Scanner,
}

impl CommandSbomService {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            scanner: Scanner {
                program: program.into(),
                args: vec!["-o".to_owned(), "syft-json".to_owned(), "-q".to_owned()],
                env_prefix: "SYFT",
            },
        }
    }
}

impl SbomService for CommandSbomService {
    async fn generate(&self, image: &str, credentials: &[RegistryCredential]) -> Result<Sbom> {
        let raw = self.scanner.run(image, credentials).await?;
        let document: SyftDocument = self.scanner.decode(&raw)?;
        Ok(document.into())
    }
}

/// Scans images with a grype-compatible command.
#[derive(Debug, Clone)]
pub struct CommandVulnerabilityService {
    scanner: Scanner,
}

impl CommandVulnerabilityService {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            scanner: Scanner {
                program: program.into(),
                args: vec!["-o".to_owned(), "json".to_owned(), "-q".to_owned()],
                env_prefix: "GRYPE",
            },
        }
    }
}

impl VulnerabilityService for CommandVulnerabilityService {
    async fn scan(
        &self,
        image: &str,
        credentials: &[RegistryCredential],
    ) -> Result<VulnerabilityReport> {
        let raw = self.scanner.run(image, credentials).await?;
        let document: GrypeDocument = self.scanner.decode(&raw)?;
        Ok(document.into())
    }
}

#[derive(Debug, Deserialize)]
struct SyftDocument {
    #[serde(default)]
    artifacts: Vec<SyftArtifact>,
}

#[derive(Debug, Deserialize)]
struct SyftArtifact {
    name: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    locations: Vec<SyftLocation>,
}

#[derive(Debug, Deserialize)]
struct SyftLocation {
    path: String,
}

impl From<SyftDocument> for Sbom {
    fn from(value: SyftDocument) -> Self {
        let packages = value
            .artifacts
            .into_iter()
            .map(|artifact| Package {
                name: artifact.name,
                version: artifact.version,
                files: artifact
                    .locations
                    .into_iter()
                    .map(|location| location.path)
                    .collect(),
            })
            .collect();
        Sbom { packages }
    }
}

#[derive(Debug, Deserialize)]
struct GrypeDocument {
    #[serde(default)]
    matches: Vec<GrypeMatch>,
}

#[derive(Debug, Deserialize)]
struct GrypeMatch {
    vulnerability: GrypeVulnerability,
    artifact: GrypeArtifact,
}

#[derive(Debug, Deserialize)]
struct GrypeVulnerability {
    id: String,
    #[serde(default)]
    severity: String,
}

#[derive(Debug, Deserialize)]
struct GrypeArtifact {
    name: String,
    #[serde(default)]
    version: String,
}

impl From<GrypeDocument> for VulnerabilityReport {
    fn from(value: GrypeDocument) -> Self {
        let vulnerabilities = value
            .matches
            .into_iter()
            .map(|m| Vulnerability {
                id: m.vulnerability.id,
                severity: m.vulnerability.severity,
                package: m.artifact.name,
                version: m.artifact.version,
            })
            .collect();
        VulnerabilityReport { vulnerabilities }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_syft_document() {
        let raw = br#"{
            "artifacts": [
                {"name": "busybox", "version": "1.36.1",
                 "locations": [{"path": "/bin/busybox"}, {"path": "/bin/sh"}],
                 "type": "binary"}
            ],
            "source": {"type": "image"}
        }"#;
        let scanner = CommandSbomService::new("syft").scanner;
        let sbom: Sbom = scanner.decode::<SyftDocument>(raw).unwrap().into();
        assert_eq!(sbom.packages.len(), 1);
        assert_eq!(sbom.packages[0].files, vec!["/bin/busybox", "/bin/sh"]);
    }

    #[test]
    fn decodes_grype_document() {
        let raw = br#"{
            "matches": [
                {"vulnerability": {"id": "CVE-2023-0001", "severity": "Critical"},
                 "artifact": {"name": "busybox", "version": "1.36.1"}}
            ]
        }"#;
        let scanner = CommandVulnerabilityService::new("grype").scanner;
        let report: VulnerabilityReport = scanner.decode::<GrypeDocument>(raw).unwrap().into();
        assert_eq!(
            report.vulnerabilities,
            vec![Vulnerability {
                id: "CVE-2023-0001".to_owned(),
                severity: "Critical".to_owned(),
                package: "busybox".to_owned(),
                version: "1.36.1".to_owned(),
            }]
        );
    }

    #[test]
    fn invalid_output_is_a_decode_error() {
        let scanner = CommandSbomService::new("syft").scanner;
        let err = scanner.decode::<SyftDocument>(b"not json").unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[tokio::test]
    async fn failing_command_reports_status() {
        let service = CommandSbomService::new("false");
        let err = service.generate("alpine:3.19", &[]).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn missing_command_reports_spawn_error() {
        let service = CommandVulnerabilityService::new("/definitely/not/grype");
        let err = service.scan("alpine:3.19", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
