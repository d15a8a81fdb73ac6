//! Loading images exported by a local container daemon.
//!
//! `<daemon> save <name>` writes a docker-archive of the image to stdout. The stream is fed to the
//! transfer engine while the daemon runs, after which the daemon is reaped and the imported image
//! is looked up and checked.

use std::{path::Path, process::Stdio, sync::Arc};

use log::{debug, info, warn};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    platform::PlatformSet,
    progress::ProgressSink,
    reference::{Daemon, Name},
    store::{ImageRecord, Store},
    transfer::{Naming, Source, StoreTarget, TransferEngine},
    util::{decompress, ClosedAsEof, ReadTracker},
};

/// Imports images from `docker save` or `podman save`.
pub struct DaemonImageLoader {
    transfer: Arc<dyn TransferEngine>,
    store: Arc<dyn Store>,
    progress: Arc<dyn ProgressSink>,
}

async fn kill(child: &mut Child, command: &str) {
    if let Err(err) = child.kill().await {
        warn!("Failed to kill {command}: {err}");
    }
}

impl DaemonImageLoader {
    pub fn new(
        transfer: Arc<dyn TransferEngine>,
        store: Arc<dyn Store>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        DaemonImageLoader {
            transfer,
            store,
            progress,
        }
    }

    /// Exports `name` from `daemon` by running `binary`, imports it and returns its record.
    ///
    /// The record must be complete for `platforms` afterwards; this never pulls from a registry.
    pub async fn load(
        &self,
        daemon: Daemon,
        binary: &Path,
        name: &Name,
        platforms: &PlatformSet,
        cancel: &CancellationToken,
    ) -> Result<ImageRecord> {
        let name = name.to_string();
        let command = format!("{} save {name}", binary.display());
        let operation = format!("load {name:?} from {daemon}");

        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        info!("Loading image {name} from {}", binary.display());
        let mut child = Command::new(binary)
            .arg("save")
            .arg(&name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command.clone(),
                source: Arc::new(source),
            })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Spawn {
            command: command.clone(),
            source: Arc::new(std::io::Error::other("stdout was not captured")),
        })?;

        let target = StoreTarget {
            name: name.clone(),
            platforms: platforms.clone(),
            all_metadata: true,
            naming: Naming::Foreknown,
        };

        let import = async {
            let stream = decompress(ClosedAsEof::new(stdout)).await?;
            let (stream, status) = ReadTracker::new(stream);
            let result = self
                .transfer
                .transfer(
                    Source::Archive(Box::pin(stream)),
                    &target,
                    self.progress.clone(),
                )
                .await;
            Ok::<_, std::io::Error>((result, status))
        };

        let imported = tokio::select! {
            imported = import => imported,
            _ = cancel.cancelled() => {
                debug!("Cancelled while running {command}");
                kill(&mut child, &command).await;
                self.progress.finish();
                return Err(Error::cancelled(operation));
            }
        };
        self.progress.finish();

        let (result, read_status) = match imported {
            Ok(imported) => imported,
            Err(source) => {
                kill(&mut child, &command).await;
                return Err(Error::StreamTranslation {
                    command,
                    source: Arc::new(source),
                });
            }
        };

        // The stream is gone with the source; a daemon still writing would only see EPIPE.
        if read_status.reached_eof() {
            let status = child.wait().await.map_err(|source| Error::Spawn {
                command: command.clone(),
                source: Arc::new(source),
            })?;
            if !status.success() {
                return Err(Error::Subprocess { command, status });
            }
        } else {
            kill(&mut child, &command).await;
        }

        if let Err(source) = result {
            if let Some(err) = read_status.error() {
                return Err(Error::StreamTranslation {
                    command,
                    source: err,
                });
            }
            return Err(Error::Transfer {
                action: format!("load an archive (from {command})"),
                source,
            });
        }

        let record = match self.store.get(&name).await {
            Ok(record) => record,
            Err(source) if source.is_not_found() => {
                return Err(Error::InconsistentState {
                    name,
                    command,
                    source,
                })
            }
            Err(source) => return Err(Error::Store { name, source }),
        };

        let availability = self
            .store
            .check_availability(&record.target, platforms)
            .await
            .map_err(|source| Error::Store {
                name: name.clone(),
                source,
            })?;
        if !availability.complete {
            debug!(
                "{name} lacks {} blob(s), unmatched platforms: {:?}",
                availability.missing.len(),
                availability.unmatched
            );
            return Err(Error::UnavailablePlatforms {
                name,
                platforms: platforms.clone(),
            });
        }

        Ok(record)
    }
}
