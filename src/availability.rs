//! Completeness checks over a content-addressed blob store.
//!
//! Starting from a root descriptor, indexes (OCI image indexes and Docker manifest lists) are
//! expanded into manifests, and each manifest needs its own blob, its config and every layer.

use std::collections::HashSet;

use async_trait::async_trait;
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};

use crate::{
    platform::{Platform, PlatformSet},
    store::{Availability, StoreError},
};

const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Read access to blobs by descriptor.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Reads a blob, or returns `None` if it is not present.
    async fn read_blob(&self, descriptor: &Descriptor) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns true if the blob is present.
    async fn has_blob(&self, descriptor: &Descriptor) -> Result<bool, StoreError> {
        Ok(self.read_blob(descriptor).await?.is_some())
    }
}

enum Kind {
    Index,
    Manifest,
    Blob,
}

fn kind(descriptor: &Descriptor) -> Kind {
    match descriptor.media_type() {
        MediaType::ImageIndex => Kind::Index,
        MediaType::ImageManifest => Kind::Manifest,
        MediaType::Other(other) if other == DOCKER_MANIFEST_LIST => Kind::Index,
        MediaType::Other(other) if other == DOCKER_MANIFEST => Kind::Manifest,
        _ => Kind::Blob,
    }
}

fn invalid(descriptor: &Descriptor, err: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidContent {
        digest: descriptor.digest().to_string(),
        reason: err.to_string(),
    }
}

struct ManifestState {
    platform: Option<Platform>,
    complete: bool,
}

/// Checks whether everything reachable from `target` is present for `platforms`.
///
/// With a non-empty set, each requested platform needs at least one complete manifest; manifests
/// for other platforms are not inspected. With the empty set, every manifest must be complete,
/// except attestation manifests whose platform os is `unknown`.
pub async fn check(
    provider: &dyn ContentProvider,
    target: &Descriptor,
    platforms: &PlatformSet,
) -> Result<Availability, StoreError> {
    let mut stack: Vec<(Descriptor, Option<Platform>)> = vec![(target.clone(), None)];
    let mut visited = HashSet::new();
    let mut manifests = Vec::new();
    let mut missing = Vec::new();
    let mut index_missing = false;

    while let Some((descriptor, platform)) = stack.pop() {
        if !visited.insert(descriptor.digest().to_string()) {
            continue;
        }

        match kind(&descriptor) {
            Kind::Index => {
                let Some(blob) = provider.read_blob(&descriptor).await? else {
                    index_missing = true;
                    missing.push(descriptor);
                    continue;
                };
                let index = ImageIndex::from_reader(&blob[..])
                    .map_err(|err| invalid(&descriptor, err))?;
                for child in index.manifests().iter().rev() {
                    let child_platform = child.platform().as_ref().map(Platform::from);
                    if let Some(p) = &child_platform {
                        if platforms.is_empty() && p.os() == "unknown" {
                            continue;
                        }
                        if !platforms.matches(p) {
                            continue;
                        }
                    }
                    stack.push((child.clone(), child_platform));
                }
            }
            Kind::Manifest => {
                let state = check_manifest(provider, &descriptor, platform, &mut missing).await?;
                manifests.push(state);
            }
            Kind::Blob => {
                let complete = provider.has_blob(&descriptor).await?;
                if !complete {
                    missing.push(descriptor);
                }
                manifests.push(ManifestState {
                    platform,
                    complete,
                });
            }
        }
    }

    let unmatched: Vec<Platform> = platforms
        .iter()
        .filter(|wanted| {
            !manifests
                .iter()
                .any(|m| m.complete && m.platform.as_ref() == Some(*wanted))
        })
        .cloned()
        .collect();

    let complete = !index_missing
        && if platforms.is_empty() {
            !manifests.is_empty() && manifests.iter().all(|m| m.complete)
        } else {
            unmatched.is_empty()
        };

    Ok(Availability {
        complete,
        missing,
        unmatched,
    })
}

async fn check_manifest(
    provider: &dyn ContentProvider,
    descriptor: &Descriptor,
    platform: Option<Platform>,
    missing: &mut Vec<Descriptor>,
) -> Result<ManifestState, StoreError> {
    let Some(blob) = provider.read_blob(descriptor).await? else {
        missing.push(descriptor.clone());
        return Ok(ManifestState {
            platform,
            complete: false,
        });
    };
    let manifest =
        ImageManifest::from_reader(&blob[..]).map_err(|err| invalid(descriptor, err))?;

    let mut complete = true;
    let config = manifest.config();
    let platform = match platform {
        Some(platform) => {
            if !provider.has_blob(config).await? {
                complete = false;
                missing.push(config.clone());
            }
            Some(platform)
        }
        None => match provider.read_blob(config).await? {
            Some(raw) => {
                let config_json = ImageConfiguration::from_reader(&raw[..])
                    .map_err(|err| invalid(config, err))?;
                Some(Platform::from_config(&config_json))
            }
            None => {
                complete = false;
                missing.push(config.clone());
                None
            }
        },
    };

    for layer in manifest.layers() {
        if !provider.has_blob(layer).await? {
            complete = false;
            missing.push(layer.clone());
        }
    }

    Ok(ManifestState { platform, complete })
}
