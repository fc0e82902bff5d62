//! Registry credentials from a pod's image pull secrets.
//!
//! Both the `.dockerconfigjson` layout (`{"auths": {...}}`) and the legacy
//! `.dockercfg` layout (registries at the top level) are understood. The
//! credential of the image's own registry is placed first.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, Secret};
use serde::Deserialize;

use super::KubeCluster;
use crate::services::RegistryCredential;

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_KEY: &str = ".dockercfg";
const DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    auth: String,
}

impl DockerAuth {
    fn into_credential(self, registry: String) -> RegistryCredential {
        let auth = if !self.username.is_empty() && !self.password.is_empty() {
            String::new()
        } else {
            self.auth
        };
        RegistryCredential {
            registry,
            username: self.username,
            password: self.password,
            auth,
        }
    }
}

/// Extracts the credentials stored in a docker config secret.
pub fn parse_secret(secret: &Secret) -> Vec<RegistryCredential> {
    let Some(data) = secret.data.as_ref() else {
        return Vec::new();
    };

    let auths = if let Some(raw) = data.get(DOCKER_CONFIG_JSON_KEY) {
        serde_json::from_slice::<DockerConfig>(&raw.0).map(|config| config.auths)
    } else if let Some(raw) = data.get(DOCKER_CFG_KEY) {
        serde_json::from_slice::<BTreeMap<String, DockerAuth>>(&raw.0)
    } else {
        return Vec::new();
    };

    match auths {
        Ok(auths) => auths
            .into_iter()
            .map(|(registry, auth)| auth.into_credential(registry))
            .collect(),
        Err(err) => {
            log::warn!(
                "ignoring malformed docker config in secret `{}`: {err}",
                secret.metadata.name.as_deref().unwrap_or_default()
            );
            Vec::new()
        }
    }
}

/// Registry host of an image reference, `docker.io` for short names.
pub fn image_registry(image: &str) -> &str {
    match image.split_once('/') {
        Some((host, _)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            host
        }
        _ => DEFAULT_REGISTRY,
    }
}

/// Moves the credential of `image`'s registry to the front.
pub fn prioritize(credentials: &mut [RegistryCredential], image: &str) {
    let registry = image_registry(image);
    let matches_registry = |credential: &RegistryCredential| {
        credential.registry.contains(registry)
            || (registry == DEFAULT_REGISTRY && credential.registry.contains("index.docker.io"))
    };
    if let Some(position) = credentials.iter().position(matches_registry) {
        credentials[..=position].rotate_right(1);
    }
}

/// Reads every image pull secret of the pod.
///
/// Secrets that are missing or unreadable are skipped.
pub async fn pod_credentials(
    cluster: &KubeCluster,
    pod: &Pod,
    image: &str,
) -> Vec<RegistryCredential> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let secret_names = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.image_pull_secrets.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|reference| {
            let name: Option<String> = reference.name.clone().into();
            name.filter(|name| !name.is_empty())
        });

    let mut credentials = Vec::new();
    for name in secret_names {
        match cluster.secret(&name, namespace).await {
            Ok(Some(secret)) => credentials.extend(parse_secret(&secret)),
            Ok(None) => log::warn!("image pull secret `{namespace}/{name}` does not exist"),
            Err(err) => log::warn!("failed to read image pull secret `{namespace}/{name}`: {err}"),
        }
    }
    prioritize(&mut credentials, image);

    credentials
}
