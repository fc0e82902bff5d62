use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

mod error;

pub use error::{Error, Result};

/// The maximum allowed length for a [`ContainerID`].
const CONTAINER_ID_MAX_LEN: usize = 255;

/// Number of characters the tracer keeps of a runtime container id.
pub const SHORT_ID_LEN: usize = 12;

/// A validated container identifier, in the short form emitted by the tracer.
///
/// # Examples
///
/// ```
/// # use creo_sniffer::container::ContainerID;
/// let id = ContainerID::new("0123456789ab").unwrap();
/// assert_eq!(id.as_ref(), "0123456789ab");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerID(Arc<str>);

impl ContainerID {
    /// Creates a new `ContainerID` from the given raw id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidContainerID`] if the input is empty, exceeds
    /// [`CONTAINER_ID_MAX_LEN`] or contains characters other than ASCII
    /// alphanumerics.
    pub fn new(src: impl AsRef<str>) -> Result<Self> {
        let src = src.as_ref();
        if src.is_empty()
            || src.len() > CONTAINER_ID_MAX_LEN
            || !src.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(Error::InvalidContainerID(src.to_owned()));
        }

        Ok(Self(src.into()))
    }

    /// Derives the short id from a pod status container id such as
    /// `containerd://<64 hex chars>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRuntimeURI`] if the scheme separator is missing
    /// or the id part is shorter than [`SHORT_ID_LEN`].
    ///
    /// # Examples
    ///
    /// ```
    /// # use creo_sniffer::container::ContainerID;
    /// let id = ContainerID::from_runtime_uri(
    ///     "containerd://4f1d2c3b5a6978877665544332211000ffeeddccbbaa99887766554433221100",
    /// )
    /// .unwrap();
    /// assert_eq!(id.as_ref(), "4f1d2c3b5a69");
    /// ```
    pub fn from_runtime_uri(uri: &str) -> Result<Self> {
        let (_, id) = uri
            .split_once("://")
            .ok_or_else(|| Error::InvalidRuntimeURI(uri.to_owned()))?;
        let short = id
            .get(..SHORT_ID_LEN)
            .ok_or_else(|| Error::InvalidRuntimeURI(uri.to_owned()))?;
        Self::new(short).map_err(|_| Error::InvalidRuntimeURI(uri.to_owned()))
    }

    pub fn to_arc(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }
}

impl AsRef<str> for ContainerID {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ContainerID {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ContainerID {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Strips the `<scheme>://` prefix of a pod status image id, if present.
pub fn image_digest(image_id: &str) -> &str {
    image_id
        .split_once("://")
        .map_or(image_id, |(_, digest)| digest)
}
