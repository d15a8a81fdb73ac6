//! The image getter: resolves a reference to a locally available image record.
//!
//! Daemon references (`docker://`, `podman://`) are always exported from the daemon and imported.
//! Other references are looked up in the store and pulled from their registry as the
//! [`PullPolicy`] allows, following the transitions of [`Plan`].

use std::sync::Arc;

use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
    config::GetterConfig,
    credentials::CredentialResolver,
    daemon::DaemonImageLoader,
    error::{Error, Result},
    inflight::InFlight,
    platform::PlatformSet,
    policy::{Failure, Next, Outcome, Phase, Plan, PullPolicy},
    progress::ProgressSink,
    reference::{ImageReference, Name, SourceKind},
    registry::RegistryPuller,
    store::{ImageRecord, Store, StoreError},
    transfer::TransferEngine,
};

/// Identifies requests that can share one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    kind: SourceKind,
    name: String,
    platforms: PlatformSet,
    /// Daemon loads ignore the policy, so it is not part of their key.
    policy: Option<PullPolicy>,
}

/// Resolves image references into records of the local store.
pub struct ImageGetter {
    config: GetterConfig,
    store: Arc<dyn Store>,
    loader: DaemonImageLoader,
    puller: RegistryPuller,
    inflight: InFlight<FlightKey, Result<ImageRecord>>,
}

impl ImageGetter {
    pub fn new(
        config: GetterConfig,
        store: Arc<dyn Store>,
        transfer: Arc<dyn TransferEngine>,
        credentials: Arc<dyn CredentialResolver>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        ImageGetter {
            config,
            loader: DaemonImageLoader::new(transfer.clone(), store.clone(), progress.clone()),
            puller: RegistryPuller::new(transfer, credentials, progress),
            store,
            inflight: InFlight::new(),
        }
    }

    pub fn config(&self) -> &GetterConfig {
        &self.config
    }

    /// Resolves `raw` to an image record whose content is complete for `platforms`.
    ///
    /// An empty platform set asks for every platform of the image. Concurrent calls for the same
    /// reference, platforms and policy share one execution and all receive its result.
    pub async fn get(
        &self,
        raw: &str,
        platforms: &PlatformSet,
        policy: PullPolicy,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        let reference = ImageReference::classify(raw)?;
        let key = FlightKey {
            kind: reference.kind(),
            name: reference.name().to_string(),
            platforms: platforms.clone(),
            policy: match reference.kind() {
                SourceKind::Daemon(_) => None,
                SourceKind::Registry => Some(policy),
            },
        };

        loop {
            let flight = self.inflight.run(key.clone(), || {
                self.resolve(&reference, platforms, policy, cancel)
            });
            // A follower stops waiting on someone else's flight once its own token fires.
            let result = tokio::select! {
                result = flight => result,
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("get {:?}", key.name)));
                }
            };
            match result {
                // Someone else's request was cancelled; ours is still wanted.
                Err(err) if err.is_cancelled() && !cancel.is_cancelled() => {
                    debug!("Retrying {reference} after a cancelled shared request");
                }
                result => return result,
            }
        }
    }

    async fn resolve(
        &self,
        reference: &ImageReference,
        platforms: &PlatformSet,
        policy: PullPolicy,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        match reference.kind() {
            SourceKind::Daemon(daemon) => {
                let binary = self.config.daemon_binary(daemon);
                self.loader
                    .load(daemon, binary, reference.name(), platforms, cancel)
                    .await
            }
            SourceKind::Registry => {
                self.resolve_registry(reference.name(), platforms, policy, cancel)
                    .await
            }
        }
    }

    async fn resolve_registry(
        &self,
        name: &Name,
        platforms: &PlatformSet,
        policy: PullPolicy,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        let canonical = name.to_string();
        let plan = Plan::new(policy, self.config.verify_after_corrective_pull);
        let mut phase = plan.start();
        let mut record: Option<ImageRecord> = None;
        let mut lookup_error: Option<StoreError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("get {canonical:?}")));
            }

            let outcome = match phase {
                Phase::PrePull | Phase::PullMissing => {
                    info!("Pulling {canonical:?}");
                    self.puller.pull(name, platforms, cancel).await?;
                    Outcome::Pulled
                }
                Phase::PullPlatforms => {
                    info!("Pulling {canonical:?} for additional platforms");
                    self.puller.pull(name, platforms, cancel).await?;
                    Outcome::Pulled
                }
                Phase::Lookup | Phase::Relookup | Phase::RelookupPlatforms => {
                    match self.store.get(&canonical).await {
                        Ok(found) => {
                            record = Some(found);
                            Outcome::Found
                        }
                        Err(err) if err.is_not_found() => {
                            lookup_error = Some(err);
                            Outcome::NotFound
                        }
                        Err(source) => {
                            return Err(Error::Store {
                                name: canonical,
                                source,
                            })
                        }
                    }
                }
                Phase::Verify | Phase::Reverify => {
                    let Some(found) = &record else {
                        unreachable!("{phase:?} without a record");
                    };
                    let availability = self
                        .store
                        .check_availability(&found.target, platforms)
                        .await
                        .map_err(|source| Error::Store {
                            name: canonical.clone(),
                            source,
                        })?;
                    if availability.complete {
                        Outcome::Complete
                    } else {
                        debug!(
                            "{canonical} is incomplete for {platforms}: {} blob(s) missing, \
                             unmatched platforms {:?}",
                            availability.missing.len(),
                            availability.unmatched
                        );
                        Outcome::Incomplete
                    }
                }
            };

            phase = match plan.next(phase, outcome) {
                Next::Enter(next) => next,
                Next::Return => {
                    let Some(found) = record else {
                        unreachable!("returning without a record");
                    };
                    return Ok(found);
                }
                Next::Fail(Failure::NotFound) => return Err(Error::NotFound { name: canonical }),
                Next::Fail(Failure::StillNotFound) => {
                    let source =
                        lookup_error.unwrap_or_else(|| StoreError::NotFound(canonical.clone()));
                    return Err(Error::StillNotFoundAfterPull {
                        name: canonical,
                        source,
                    });
                }
                Next::Fail(Failure::UnavailablePlatforms) => {
                    return Err(Error::UnavailablePlatforms {
                        name: canonical,
                        platforms: platforms.clone(),
                    })
                }
            };
        }
    }
}
