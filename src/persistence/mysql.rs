use sqlx::MySqlPool;
use sqlx::types::Json;

use super::{ArtifactPersister, ArtifactRow, ContainerArtifact, Error, Result};

#[derive(Debug, Clone)]
pub struct MySqlArtifactPersister {
    db: MySqlPool,
}

impl MySqlArtifactPersister {
    pub fn new(db: MySqlPool) -> Self {
        Self { db }
    }

    /// Connects to the database and applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionError`] if no connection can be established
    /// and [`Error::MigrationError`] if the schema cannot be migrated.
    pub async fn connect(url: &str) -> Result<Self> {
        let db = sqlx::mysql::MySqlPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(10))
            .max_connections(4)
            .connect(url)
            .await
            .map_err(Error::ConnectionError)?;
        sqlx::migrate!().run(&db).await.map_err(Error::MigrationError)?;

        Ok(Self::new(db))
    }

    /// Returns every stored artifact of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadError`] if the query fails.
    pub async fn artifacts_of(&self, resource_name: &str) -> Result<Vec<ArtifactRow>> {
        sqlx::query_as::<_, ArtifactRow>(
            r#"
SELECT resource_name, service, vulnerabilities, syscall_profile, updated_at
FROM container_artifacts
WHERE resource_name = ?
ORDER BY service
"#,
        )
        .bind(resource_name)
        .fetch_all(&self.db)
        .await
        .map_err(Error::ReadError)
    }
}

impl ArtifactPersister for MySqlArtifactPersister {
    /// Upserts the artifact of one service for one resource.
    ///
    /// A resource observed again (e.g. a new replica of the same deployment)
    /// overwrites the artifacts of the previous observation.
    ///
    /// # Errors
    ///
    /// Returns an `Error::InsertError` if the query fails.
    async fn persist_artifact(&self, artifact: &ContainerArtifact) -> Result<()> {
        const INSERT_QUERY: &str = r#"
INSERT INTO container_artifacts (
    resource_name, service, vulnerabilities, syscall_profile, updated_at
) VALUES (
    ?, ?, ?, ?, ?
)
ON DUPLICATE KEY UPDATE
    vulnerabilities = VALUES(vulnerabilities),
    syscall_profile = VALUES(syscall_profile),
    updated_at = VALUES(updated_at)
"#;
        let updated_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|err| Error::Other(err.to_string()))?
            .as_secs();

        sqlx::query(INSERT_QUERY)
            .bind(&artifact.resource_name)
            .bind(artifact.service.as_str())
            .bind(artifact.vulnerabilities.as_ref().map(Json))
            .bind(artifact.syscall_profile.as_ref().map(Json))
            .bind(updated_at)
            .execute(&self.db)
            .await
            .map_err(|source| Error::InsertError {
                resource_name: artifact.resource_name.clone(),
                source,
            })?;

        Ok(())
    }
}
