//! The local content store seen by the getter.
//!
//! The store maps normalized image names to target descriptors and can answer whether the content
//! below a descriptor is locally complete for a set of platforms. Persisting content is the job of
//! the [`TransferEngine`](crate::transfer::TransferEngine); the getter only reads.

use std::{io, sync::Arc};

use async_trait::async_trait;
use oci_spec::image::Descriptor;

use crate::platform::{Platform, PlatformSet};

/// A named image in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    /// The normalized reference the image is stored under.
    pub name: String,
    /// The root descriptor, usually an image index or a single manifest.
    pub target: Descriptor,
}

/// Errors from the store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("image {0:?} not found")]
    NotFound(String),
    #[error("invalid content {digest}: {reason}")]
    InvalidContent { digest: String, reason: String },
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(Arc::new(err))
    }
}

/// The outcome of an availability check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Availability {
    /// Every requested platform has all of its blobs.
    pub complete: bool,
    /// Referenced blobs that are absent from the store.
    pub missing: Vec<Descriptor>,
    /// Requested platforms without any complete manifest.
    pub unmatched: Vec<Platform>,
}

/// Lookup and availability queries against the local store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Looks up an image by its normalized name.
    ///
    /// Returns [`StoreError::NotFound`] if no image has that name.
    async fn get(&self, name: &str) -> Result<ImageRecord, StoreError>;

    /// Checks whether the content reachable from `target` is present for `platforms`.
    async fn check_availability(
        &self,
        target: &Descriptor,
        platforms: &PlatformSet,
    ) -> Result<Availability, StoreError>;
}
