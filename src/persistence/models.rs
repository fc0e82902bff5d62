use sqlx::types::Json;

use crate::profile::SyscallProfile;
use crate::services::{Service, VulnerabilityReport};

/// Result of one post-deadline task.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ContainerArtifact {
    /// Name derived from the container's resource identity.
    pub resource_name: String,
    pub service: Service,
    pub vulnerabilities: Option<VulnerabilityReport>,
    pub syscall_profile: Option<SyscallProfile>,
}

/// A stored artifact as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct ArtifactRow {
    pub resource_name: String,
    pub service: String,
    pub vulnerabilities: Option<Json<VulnerabilityReport>>,
    pub syscall_profile: Option<Json<SyscallProfile>>,
    pub updated_at: u64,
}
