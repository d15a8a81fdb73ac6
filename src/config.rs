//! Getter configuration.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::reference::Daemon;

/// Settings fixed for the lifetime of an [`ImageGetter`](crate::ImageGetter).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetterConfig {
    /// Docker executable; `docker` from `$PATH` if unset.
    pub docker: Option<PathBuf>,
    /// Podman executable; `podman` from `$PATH` if unset.
    pub podman: Option<PathBuf>,
    /// Check platform completeness again after a corrective pull, instead of trusting it.
    pub verify_after_corrective_pull: bool,
}

impl GetterConfig {
    /// Reads the daemon overrides from `$DOCKER` and `$PODMAN`.
    ///
    /// Empty values count as unset.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var_os(name))
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let var = |name| lookup(name).filter(|value| !value.is_empty()).map(PathBuf::from);
        GetterConfig {
            docker: var("DOCKER"),
            podman: var("PODMAN"),
            verify_after_corrective_pull: false,
        }
    }

    /// The executable to run for `daemon`.
    pub fn daemon_binary(&self, daemon: Daemon) -> &Path {
        let configured = match daemon {
            Daemon::Docker => &self.docker,
            Daemon::Podman => &self.podman,
        };
        configured
            .as_deref()
            .unwrap_or_else(|| Path::new(daemon.default_binary()))
    }
}
