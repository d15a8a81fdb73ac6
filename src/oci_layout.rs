//! A [`Store`] over an OCI image layout directory.
//!
//! Images are named by the `org.opencontainers.image.ref.name` annotation of their entry in
//! `index.json`, which is how `skopeo copy ... oci:<dir>:<name>` records them. Blobs live at
//! `blobs/<algorithm>/<encoded>`; sha256 blobs are verified when read.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use log::debug;
use oci_spec::image::{Descriptor, ImageIndex};
use sha2::{Digest, Sha256};

use crate::{
    availability::{self, ContentProvider},
    platform::PlatformSet,
    store::{Availability, ImageRecord, Store, StoreError},
};

/// The annotation carrying an image's name in `index.json`.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// An OCI image layout on the local filesystem.
#[derive(Debug, Clone)]
pub struct OciLayoutStore {
    root: PathBuf,
}

impl OciLayoutStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OciLayoutStore { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Reads `index.json`.  A layout that was never written to has no images.
    async fn index(&self) -> Result<Option<ImageIndex>, StoreError> {
        let path = self.root.join("index.json");
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        ImageIndex::from_reader(&data[..])
            .map(Some)
            .map_err(|err| StoreError::InvalidContent {
                digest: path.display().to_string(),
                reason: err.to_string(),
            })
    }

    /// Lists every named image in the layout.
    pub async fn list(&self) -> Result<Vec<ImageRecord>, StoreError> {
        let Some(index) = self.index().await? else {
            return Ok(Vec::new());
        };
        Ok(index
            .manifests()
            .iter()
            .filter_map(|descriptor| {
                let name = descriptor.annotations().as_ref()?.get(REF_NAME_ANNOTATION)?;
                Some(ImageRecord {
                    name: name.clone(),
                    target: descriptor.clone(),
                })
            })
            .collect())
    }

    fn blob_path(&self, descriptor: &Descriptor) -> Result<(PathBuf, String, String), StoreError> {
        let digest = descriptor.digest().to_string();
        let invalid = |reason: &str| StoreError::InvalidContent {
            digest: digest.clone(),
            reason: reason.to_string(),
        };
        let (algorithm, encoded) = digest
            .split_once(':')
            .ok_or_else(|| invalid("digest has no algorithm"))?;
        if encoded.is_empty() || encoded.contains(['/', '.']) || algorithm.contains(['/', '.']) {
            return Err(invalid("malformed digest"));
        }
        let path = self.root.join("blobs").join(algorithm).join(encoded);
        Ok((path, algorithm.to_string(), encoded.to_string()))
    }
}

#[async_trait]
impl ContentProvider for OciLayoutStore {
    async fn read_blob(&self, descriptor: &Descriptor) -> Result<Option<Vec<u8>>, StoreError> {
        let (path, algorithm, encoded) = self.blob_path(descriptor)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        if algorithm == "sha256" && hex::encode(Sha256::digest(&data)) != encoded {
            return Err(StoreError::InvalidContent {
                digest: descriptor.digest().to_string(),
                reason: format!("{} does not match its digest", path.display()),
            });
        }
        Ok(Some(data))
    }

    async fn has_blob(&self, descriptor: &Descriptor) -> Result<bool, StoreError> {
        let (path, _, _) = self.blob_path(descriptor)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[async_trait]
impl Store for OciLayoutStore {
    async fn get(&self, name: &str) -> Result<ImageRecord, StoreError> {
        let record = self
            .list()
            .await?
            .into_iter()
            .rev()
            .find(|record| record.name == name);
        match record {
            Some(record) => {
                debug!("Found {name:?} at {}", record.target.digest());
                Ok(record)
            }
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    async fn check_availability(
        &self,
        target: &Descriptor,
        platforms: &PlatformSet,
    ) -> Result<Availability, StoreError> {
        availability::check(self, target, platforms).await
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use oci_spec::image::{
        DescriptorBuilder, Digest as OciDigest, ImageIndexBuilder, ImageManifestBuilder,
        MediaType, OciLayoutBuilder,
    };
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::platforms;

    fn write_blob(root: &Path, media_type: MediaType, data: &[u8]) -> Descriptor {
        let encoded = hex::encode(Sha256::digest(data));
        let dir = root.join("blobs/sha256");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(&encoded), data).unwrap();
        DescriptorBuilder::default()
            .media_type(media_type)
            .digest(format!("sha256:{encoded}").parse::<OciDigest>().unwrap())
            .size(data.len() as u64)
            .build()
            .unwrap()
    }

    /// Writes a layout holding one amd64 image named `name`.
    fn write_layout(root: &Path, name: &str) -> Descriptor {
        let oci_layout = OciLayoutBuilder::default()
            .image_layout_version("1.0.0".to_string())
            .build()
            .unwrap();
        std::fs::write(root.join("oci-layout"), oci_layout.to_string().unwrap()).unwrap();

        let layer = write_blob(root, MediaType::ImageLayer, b"layer");
        let config = write_blob(
            root,
            MediaType::ImageConfig,
            br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#,
        );
        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(vec![layer])
            .build()
            .unwrap();
        let mut manifest = write_blob(
            root,
            MediaType::ImageManifest,
            manifest.to_string().unwrap().as_bytes(),
        );
        let target = manifest.clone();

        manifest.set_annotations(Some(HashMap::from([(
            REF_NAME_ANNOTATION.to_string(),
            name.to_string(),
        )])));
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![manifest])
            .build()
            .unwrap();
        std::fs::write(root.join("index.json"), index.to_string().unwrap()).unwrap();
        target
    }

    #[tokio::test]
    async fn test_empty_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = OciLayoutStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());
        let err = store.get("docker.io/library/nginx:latest").await.unwrap_err();
        assert!(err.is_not_found(), "{err:?}");
    }

    #[tokio::test]
    async fn test_get_and_check() {
        let dir = tempfile::tempdir().unwrap();
        let name = "registry.example/app:v1";
        let target = write_layout(dir.path(), name);
        let store = OciLayoutStore::new(dir.path());

        let record = store.get(name).await.unwrap();
        assert_eq!(record.name, name);
        assert_eq!(record.target.digest(), target.digest());

        assert!(store.get("registry.example/app:v2").await.unwrap_err().is_not_found());

        let availability = store
            .check_availability(&record.target, &platforms(&["linux/amd64"]))
            .await
            .unwrap();
        assert!(availability.complete);

        let availability = store
            .check_availability(&record.target, &platforms(&["linux/arm64"]))
            .await
            .unwrap();
        assert!(!availability.complete);
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_layout(dir.path(), "x.example/y:z");
        let store = OciLayoutStore::new(dir.path());

        let layer_path = dir
            .path()
            .join("blobs/sha256")
            .join(hex::encode(Sha256::digest(b"layer")));
        std::fs::remove_file(&layer_path).unwrap();
        let availability = store
            .check_availability(&target, &PlatformSet::any())
            .await
            .unwrap();
        assert!(!availability.complete);
        assert_eq!(availability.missing.len(), 1);

        let manifest_path = dir
            .path()
            .join("blobs/sha256")
            .join(target.digest().to_string().trim_start_matches("sha256:"));
        std::fs::write(&manifest_path, b"tampered").unwrap();
        let err = store.read_blob(&target).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidContent { .. }), "{err:?}");
    }
}
