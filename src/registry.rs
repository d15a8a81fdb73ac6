//! Pulling images from remote registries.

use std::sync::Arc;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::CredentialResolver,
    error::{Error, Result},
    platform::PlatformSet,
    progress::ProgressSink,
    reference::Name,
    transfer::{Naming, RegistrySource, Source, StoreTarget, TransferEngine},
};

/// Copies images from a registry into the store through the transfer engine.
pub struct RegistryPuller {
    transfer: Arc<dyn TransferEngine>,
    credentials: Arc<dyn CredentialResolver>,
    progress: Arc<dyn ProgressSink>,
}

impl RegistryPuller {
    pub fn new(
        transfer: Arc<dyn TransferEngine>,
        credentials: Arc<dyn CredentialResolver>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        RegistryPuller {
            transfer,
            credentials,
            progress,
        }
    }

    /// Pulls `name` for `platforms` (all platforms if empty).
    pub async fn pull(
        &self,
        name: &Name,
        platforms: &PlatformSet,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reference = name.to_string();
        let action = format!("pull {reference:?}");
        if cancel.is_cancelled() {
            return Err(Error::cancelled(action));
        }
        debug!("Copying {reference} for {platforms}");

        let source = Source::Registry(RegistrySource {
            reference: reference.clone(),
            host: name.domain().to_string(),
            credentials: self.credentials.clone(),
        });
        let target = StoreTarget {
            name: reference,
            platforms: platforms.clone(),
            all_metadata: false,
            naming: Naming::Reference,
        };

        let result = tokio::select! {
            result = self.transfer.transfer(source, &target, self.progress.clone()) => result,
            _ = cancel.cancelled() => {
                self.progress.finish();
                return Err(Error::cancelled(action));
            }
        };
        self.progress.finish();

        result.map_err(|source| Error::Transfer { action, source })
    }
}
