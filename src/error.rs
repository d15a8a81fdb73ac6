//! Error types for image retrieval.
//!
//! Every operation of the [`ImageGetter`](crate::ImageGetter) returns a [`Result<T>`], an alias
//! for `Result<T, Error>`. Each variant carries the reference and the operation that failed so a
//! report can be diagnosed without re-running anything.
//!
//! # Error Categories
//!
//! - **Input errors**: [`Parse`], [`Config`]
//! - **Daemon export**: [`Spawn`], [`Subprocess`], [`StreamTranslation`]
//! - **Collaborator failures**: [`Transfer`], [`Store`], [`InconsistentState`]
//! - **Resolution outcomes**: [`NotFound`], [`StillNotFoundAfterPull`], [`UnavailablePlatforms`]
//! - **Cancellation**: [`Cancelled`]
//!
//! The type is `Clone` so that concurrent callers sharing a single in-flight request can each
//! receive the outcome. Underlying I/O errors are kept behind an [`Arc`] for that reason.
//!
//! [`Parse`]: Error::Parse
//! [`Config`]: Error::Config
//! [`Spawn`]: Error::Spawn
//! [`Subprocess`]: Error::Subprocess
//! [`StreamTranslation`]: Error::StreamTranslation
//! [`Transfer`]: Error::Transfer
//! [`Store`]: Error::Store
//! [`InconsistentState`]: Error::InconsistentState
//! [`NotFound`]: Error::NotFound
//! [`StillNotFoundAfterPull`]: Error::StillNotFoundAfterPull
//! [`UnavailablePlatforms`]: Error::UnavailablePlatforms
//! [`Cancelled`]: Error::Cancelled

use std::{io, process::ExitStatus, sync::Arc};

use crate::{
    platform::PlatformSet, reference::ParseError, store::StoreError, transfer::TransferError,
};

/// Result type alias for image retrieval operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by image retrieval.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The reference string does not follow the image name grammar.
    #[error("failed to parse {reference:?}")]
    Parse {
        reference: String,
        #[source]
        source: ParseError,
    },

    /// An unrecognized configuration value, such as an unknown pull policy.
    #[error("{0}")]
    Config(String),

    /// The daemon export command could not be started.
    #[error("failed to run {command}")]
    Spawn {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The daemon export command exited abnormally.
    #[error("{command} exited with {status}")]
    Subprocess { command: String, status: ExitStatus },

    /// Reading or decompressing the exported archive failed.
    #[error("failed to read an archive (from {command})")]
    StreamTranslation {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The transfer engine failed to pull or import.
    #[error("failed to {action}")]
    Transfer {
        action: String,
        #[source]
        source: TransferError,
    },

    /// An import reported success, but the store does not know the image afterwards.
    #[error("should have loaded an archive (from {command}), but {name:?} is not accessible")]
    InconsistentState {
        name: String,
        command: String,
        #[source]
        source: StoreError,
    },

    /// The image is not in the store and the pull policy forbids pulling it.
    #[error("failed to get image {name:?}: not found")]
    NotFound { name: String },

    /// The image is still not in the store after pulling it.
    #[error("should have pulled {name:?}, but still not accessible in the local store")]
    StillNotFoundAfterPull {
        name: String,
        #[source]
        source: StoreError,
    },

    /// The image is present but lacks blobs for some requested platforms.
    #[error("image {name:?} lacks blobs for additional platforms (requested: {platforms})")]
    UnavailablePlatforms {
        name: String,
        platforms: PlatformSet,
    },

    /// The store failed for a reason other than a missing image.
    #[error("failed to get image {name:?}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },

    /// The caller cancelled the operation.
    #[error("{operation}: cancelled")]
    Cancelled { operation: String },
}

impl Error {
    /// Returns true if this error is the result of cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub(crate) fn cancelled(operation: impl Into<String>) -> Self {
        Error::Cancelled {
            operation: operation.into(),
        }
    }
}
