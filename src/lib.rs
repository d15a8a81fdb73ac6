//! Resolve container image references into a local content store.
//!
//! An [`ImageGetter`] accepts references like `nginx`, `registry.example/app:v1` or
//! `docker://myimage:latest`. Daemon references are exported from the local Docker or Podman
//! daemon and imported; everything else is looked up in the [`Store`] and pulled from its
//! registry as the [`PullPolicy`] allows. The returned [`ImageRecord`] is guaranteed to have
//! content for the requested [`PlatformSet`].

pub mod availability;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod getter;
pub mod inflight;
pub mod oci_layout;
pub mod platform;
pub mod policy;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod skopeo;
pub mod store;
pub mod transfer;
pub mod util;


pub use config::GetterConfig;
pub use error::{Error, Result};
pub use getter::ImageGetter;
pub use platform::{Platform, PlatformSet};
pub use policy::PullPolicy;
pub use reference::{ImageReference, Name};
pub use store::{ImageRecord, Store};
