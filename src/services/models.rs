use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

/// Credentials for pulling an image from a private registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryCredential {
    pub registry: String,
    pub username: String,
    pub password: String,
    /// Base64 `user:password` as found in docker config files. Cleared when
    /// username and password are both present.
    pub auth: String,
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sbom {
    pub packages: Vec<Package>,
}

impl Sbom {
    pub fn retain_files(&self, in_use: &BTreeSet<String>) -> Sbom {
        let packages = self
            .packages
            .iter()
            .filter(|package| package.files.iter().any(|file| in_use.contains(file)))
            .cloned()
            .collect();
        Sbom { packages }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub severity: String,
    pub package: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    pub vulnerabilities: Vec<Vulnerability>,
}

impl VulnerabilityReport {
    pub fn relevant_to(&self, sbom: &Sbom) -> VulnerabilityReport {
        let present: HashSet<(&str, &str)> = sbom
            .packages
            .iter()
            .map(|package| (package.name.as_str(), package.version.as_str()))
            .collect();
        let vulnerabilities = self
            .vulnerabilities
            .iter()
            .filter(|vuln| present.contains(&(vuln.package.as_str(), vuln.version.as_str())))
            .cloned()
            .collect();
        VulnerabilityReport { vulnerabilities }
    }
}
