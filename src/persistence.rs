mod error;
mod models;
mod mysql;
mod persister;

pub use error::{Error, Result};
pub use models::{ArtifactRow, ContainerArtifact};
pub use mysql::MySqlArtifactPersister;
pub use persister::ArtifactPersister;
