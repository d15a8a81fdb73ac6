//! The transfer engine interface.
//!
//! A transfer moves image content from a [`Source`] into the local store: either a docker-archive
//! byte stream exported by a daemon, or a remote registry reference. The engine is responsible for
//! writing blobs and for making the resulting image resolvable by name afterwards.

use std::{fmt, io, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::{credentials::CredentialResolver, platform::PlatformSet, progress::ProgressSink};

/// How the transferred image is named in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    /// Name it after the pulled reference.
    Reference,
    /// The archive carries a name the caller already knows; register it under
    /// [`StoreTarget::name`] even if the archive's own tags say otherwise.
    Foreknown,
}

/// Where and how a transfer lands in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    /// The normalized name the image must be resolvable under afterwards.
    pub name: String,
    /// Platforms to fetch; empty means all of them.
    pub platforms: PlatformSet,
    /// Keep metadata for every platform in the index, even the ones not fetched.
    pub all_metadata: bool,
    pub naming: Naming,
}

/// A remote image to pull.
#[derive(Clone)]
pub struct RegistrySource {
    /// The normalized reference, e.g. `docker.io/library/nginx:latest`.
    pub reference: String,
    /// The registry host, used to resolve credentials.
    pub host: String,
    pub credentials: Arc<dyn CredentialResolver>,
}

impl fmt::Debug for RegistrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrySource")
            .field("reference", &self.reference)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// The content to transfer.
pub enum Source {
    /// An uncompressed docker-archive (tar) stream.
    Archive(Pin<Box<dyn AsyncRead + Send>>),
    Registry(RegistrySource),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Archive(_) => f.write_str("Archive(..)"),
            Source::Registry(source) => f.debug_tuple("Registry").field(source).finish(),
        }
    }
}

/// Errors from a transfer engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransferError {
    #[error("unsupported transfer: {0}")]
    Unsupported(String),
    #[error("failed to resolve credentials for {host}: {message}")]
    Credentials { host: String, message: String },
    #[error("{command} exited with {status}: {stderr}")]
    Process {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error(transparent)]
    Io(Arc<io::Error>),
    #[error("{0}")]
    Other(String),
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io(Arc::new(err))
    }
}

/// Moves image content into the local store.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Runs one transfer to completion.
    ///
    /// For [`Source::Archive`] the stream is read until end-of-stream or an error. Dropping the
    /// returned future abandons the transfer.
    async fn transfer(
        &self,
        source: Source,
        target: &StoreTarget,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransferError>;
}
