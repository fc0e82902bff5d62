#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid container id: {0}")]
    InvalidContainerID(String),
    #[error("invalid runtime container uri: {0}")]
    InvalidRuntimeURI(String),
}
pub type Result<T> = std::result::Result<T, Error>;
