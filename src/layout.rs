//! The on-disk OCI image layout store: a directory mirror of the same
//! content-addressable model used by [`crate::client`], serving as both a
//! source and a sink for [`crate::client::copy`].
use crate::digest::{self, DigestAlgorithm};
use crate::errors::{NotFoundKind, OciDistributionError};
use crate::manifest::{
    Config, Layer, OciDescriptor, OciIndex, OciManifest, ANNOTATION_REF_NAME, ANNOTATION_TITLE,
    IMAGE_INDEX_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
};
use crate::reference::LayoutRef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const LAYOUT_VERSION_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";

#[derive(serde::Serialize, serde::Deserialize)]
struct OciLayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

impl Default for OciLayoutMarker {
    fn default() -> Self {
        OciLayoutMarker {
            image_layout_version: "1.0.0".to_string(),
        }
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A local OCI image layout directory: an `oci-layout` marker, a flat
/// `index.json` of every manifest pushed into it, and a content-addressed
/// `blobs/<algorithm>/<hex>` tree.
///
/// Tags are not a separate namespace: they live as the conventional
/// `org.opencontainers.image.ref.name` annotation on a manifest's `index.json`
/// entry. Pushing a tag that another entry already carries moves it; both
/// entries remain if their digests differ.
pub struct OciLayoutStore {
    root: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl OciLayoutStore {
    /// Open (or prepare to lazily create) a layout store rooted at `root`.
    /// Fails with [`OciDistributionError::LayoutNotADirectory`] if `root`
    /// exists and is not a directory. A nonexistent root is not created until
    /// the first write.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, OciDistributionError> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(OciDistributionError::LayoutNotADirectory(
                root.display().to_string(),
            ));
        }
        Ok(OciLayoutStore {
            root,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The filesystem root this store is rooted at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, OciDistributionError> {
        let parsed = crate::digest::Digest::parse(digest)?;
        Ok(self
            .root
            .join(BLOBS_DIR)
            .join(parsed.algorithm().as_str())
            .join(parsed.hex()))
    }

    async fn ensure_scaffold(&self) -> Result<(), OciDistributionError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let marker_path = self.root.join(LAYOUT_VERSION_FILE);
        if tokio::fs::metadata(&marker_path).await.is_err() {
            let bytes = serde_json::to_vec(&OciLayoutMarker::default())?;
            self.write_atomic(&marker_path, &bytes).await?;
        }
        Ok(())
    }

    /// Write `bytes` to `dest` via a temp file in the same directory, then an
    /// atomic rename, so a reader never observes a partially-written file and
    /// a cancelled write leaves nothing at `dest`.
    async fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<(), OciDistributionError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = PathBuf::from(format!(
            "{}.tmp-{}-{}",
            dest.display(),
            std::process::id(),
            n
        ));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);
        match tokio::fs::rename(&tmp_path, dest).await {
            Ok(()) => {
                debug!(path = %dest.display(), "committed blob via atomic rename");
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(e.into())
            }
        }
    }

    /// Write a blob already known to hash to `digest`, skipping the write if
    /// the destination file already exists (content-addressed, write-once).
    pub async fn push_blob_with_digest(
        &self,
        bytes: &[u8],
        digest: &str,
    ) -> Result<OciDescriptor, OciDistributionError> {
        self.ensure_scaffold().await?;
        let alg = digest::from_digest(digest)?;
        let actual = digest::digest_bytes(alg, bytes);
        if actual != digest {
            return Err(OciDistributionError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        let path = self.blob_path(digest)?;
        if tokio::fs::metadata(&path).await.is_err() {
            self.write_atomic(&path, bytes).await?;
        }
        Ok(OciDescriptor::of(digest.to_string(), bytes.len() as i64))
    }

    /// Push a blob named by `reference`, which must carry a digest or a tag.
    /// When it carries a digest, the computed digest must match.
    pub async fn push_blob(
        &self,
        reference: &LayoutRef,
        bytes: &[u8],
    ) -> Result<OciDescriptor, OciDistributionError> {
        if !reference.has_tag_or_digest() {
            return Err(OciDistributionError::TagRequired);
        }
        let computed = digest::digest_bytes(DigestAlgorithm::Sha256, bytes);
        if let Some(expected) = reference.digest() {
            if expected != computed {
                return Err(OciDistributionError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: computed,
                });
            }
        }
        self.push_blob_with_digest(bytes, &computed).await
    }

    /// Whether a blob with this digest is already present.
    pub async fn blob_exists(&self, digest: &str) -> Result<bool, OciDistributionError> {
        let path = self.blob_path(digest)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Read a blob, verifying its content matches `descriptor`'s digest.
    pub async fn get_blob(&self, descriptor: &OciDescriptor) -> Result<Vec<u8>, OciDistributionError> {
        let path = self.blob_path(&descriptor.digest)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciDistributionError::NotFound {
                    kind: NotFoundKind::Blob,
                    reference: descriptor.digest.clone(),
                }
            } else {
                e.into()
            }
        })?;
        let alg = digest::from_digest(&descriptor.digest)?;
        let actual = digest::digest_bytes(alg, &bytes);
        if actual != descriptor.digest {
            return Err(OciDistributionError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        Ok(bytes)
    }

    async fn read_top_level_index(&self) -> Result<OciIndex, OciDistributionError> {
        let path = self.root.join(INDEX_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OciIndex::empty()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_top_level_index(&self, index: &OciIndex) -> Result<(), OciDistributionError> {
        let bytes = index.to_json_bytes()?;
        self.write_atomic(&self.root.join(INDEX_FILE), &bytes).await
    }

    /// The store's own `index.json`: every manifest ever pushed into this
    /// layout, tags recorded as annotations.
    pub async fn get_index(&self) -> Result<OciIndex, OciDistributionError> {
        let _guard = self.lock.lock().await;
        self.read_top_level_index().await
    }

    /// Upsert a manifest descriptor into `index.json`. If the descriptor
    /// carries a tag, any other entry currently holding that tag loses it
    /// (the tag "moves"); both entries remain if their digests differ. An
    /// entry already present at this digest is replaced in place.
    async fn upsert_index_entry(&self, descriptor: OciDescriptor) -> Result<(), OciDistributionError> {
        let _guard = self.lock.lock().await;
        let mut index = self.read_top_level_index().await?;
        if let Some(tag) = descriptor.tag() {
            for existing in index.manifests.iter_mut() {
                if existing.digest == descriptor.digest {
                    continue;
                }
                if existing.tag() == Some(tag) {
                    debug!(%tag, from = %existing.digest, to = %descriptor.digest, "tag moved");
                    if let Some(anns) = existing.annotations.as_mut() {
                        anns.remove(ANNOTATION_REF_NAME);
                    }
                }
            }
        }
        if let Some(pos) = index.manifests.iter().position(|d| d.digest == descriptor.digest) {
            index.manifests[pos] = descriptor;
        } else {
            index.manifests.push(descriptor);
        }
        self.write_top_level_index(&index).await
    }

    /// Push manifest/index bytes under `reference`, writing the blob then
    /// upserting its `index.json` entry.
    pub async fn push_manifest_bytes(
        &self,
        reference: &LayoutRef,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<OciDescriptor, OciDistributionError> {
        self.ensure_scaffold().await?;
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, bytes);
        let path = self.blob_path(&digest)?;
        if tokio::fs::metadata(&path).await.is_err() {
            self.write_atomic(&path, bytes).await?;
        }
        let mut descriptor = OciDescriptor::new(media_type.to_string(), digest, bytes.len() as i64);
        if let Some(tag) = reference.tag() {
            descriptor = descriptor.with_tag(tag.to_string());
        }
        self.upsert_index_entry(descriptor.clone()).await?;
        Ok(descriptor)
    }

    /// Push a manifest.
    pub async fn push_manifest(
        &self,
        reference: &LayoutRef,
        manifest: &OciManifest,
    ) -> Result<OciDescriptor, OciDistributionError> {
        let bytes = manifest.to_json_bytes()?;
        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| IMAGE_MANIFEST_MEDIA_TYPE.to_string());
        self.push_manifest_bytes(reference, &bytes, &media_type).await
    }

    /// Push an index.
    pub async fn push_index(
        &self,
        reference: &LayoutRef,
        index: &OciIndex,
    ) -> Result<OciDescriptor, OciDistributionError> {
        let bytes = index.to_json_bytes()?;
        let media_type = index
            .media_type
            .clone()
            .unwrap_or_else(|| IMAGE_INDEX_MEDIA_TYPE.to_string());
        self.push_manifest_bytes(reference, &bytes, &media_type).await
    }

    async fn resolve_descriptor(&self, reference: &LayoutRef) -> Result<OciDescriptor, OciDistributionError> {
        if let Some(digest) = reference.digest() {
            let index = self.get_index().await?;
            return index
                .find_by_digest(digest)
                .cloned()
                .ok_or_else(|| OciDistributionError::NotFound {
                    kind: NotFoundKind::Manifest,
                    reference: digest.to_string(),
                });
        }
        if let Some(tag) = reference.tag() {
            let index = self.get_index().await?;
            return index
                .find_by_tag(tag)
                .cloned()
                .ok_or_else(|| OciDistributionError::NotFound {
                    kind: NotFoundKind::Tag,
                    reference: tag.to_string(),
                });
        }
        Err(OciDistributionError::TagRequired)
    }

    /// Read manifest/index bytes named by `reference`, verifying the bytes on
    /// disk still hash to the digest recorded in `index.json`.
    pub async fn get_manifest_bytes(
        &self,
        reference: &LayoutRef,
    ) -> Result<(Vec<u8>, OciDescriptor), OciDistributionError> {
        let descriptor = self.resolve_descriptor(reference).await?;
        let path = self.blob_path(&descriptor.digest)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciDistributionError::NotFound {
                    kind: NotFoundKind::Manifest,
                    reference: descriptor.digest.clone(),
                }
            } else {
                e.into()
            }
        })?;
        let actual = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        if actual != descriptor.digest {
            return Err(OciDistributionError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        Ok((bytes, descriptor))
    }

    /// Fetch and parse a manifest.
    pub async fn get_manifest(
        &self,
        reference: &LayoutRef,
    ) -> Result<(OciManifest, OciDescriptor), OciDistributionError> {
        let (bytes, descriptor) = self.get_manifest_bytes(reference).await?;
        Ok((serde_json::from_slice(&bytes)?, descriptor))
    }

    /// Fetch and parse an index.
    pub async fn get_index_at(
        &self,
        reference: &LayoutRef,
    ) -> Result<(OciIndex, OciDescriptor), OciDistributionError> {
        let (bytes, descriptor) = self.get_manifest_bytes(reference).await?;
        Ok((serde_json::from_slice(&bytes)?, descriptor))
    }

    /// Find every manifest in this layout whose `subject` points at `digest`.
    pub async fn get_referrers(&self, digest: &str) -> Result<OciIndex, OciDistributionError> {
        let index = self.get_index().await?;
        let mut referrers = vec![];
        for entry in &index.manifests {
            if entry.digest == digest {
                continue;
            }
            let path = self.blob_path(&entry.digest)?;
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            if let Ok(manifest) = serde_json::from_slice::<OciManifest>(&bytes) {
                if manifest.subject.as_ref().map(|s| s.digest.as_str()) == Some(digest) {
                    referrers.push(entry.clone());
                }
            }
        }
        Ok(OciIndex::empty().with_manifests(referrers))
    }

    /// Enumerate the tags currently recorded in `index.json`.
    pub async fn list_tags(&self) -> Result<Vec<String>, OciDistributionError> {
        let index = self.get_index().await?;
        Ok(index
            .manifests
            .iter()
            .filter_map(|d| d.tag().map(str::to_string))
            .collect())
    }

    /// Push an artifact from a single layer: writes the layer blob, the
    /// config blob (empty unless supplied), and the binding manifest.
    pub async fn push_artifact(
        &self,
        reference: &LayoutRef,
        artifact_type: Option<&str>,
        layer: Layer,
        annotations: Option<HashMap<String, String>>,
        config: Option<Config>,
    ) -> Result<OciManifest, OciDistributionError> {
        let config = config.unwrap_or_else(Config::empty);
        let config_bytes = config.to_json_bytes()?;
        self.push_blob_with_digest(&config_bytes, &config.descriptor.digest).await?;

        let layer_bytes = match &layer.data {
            Some(bytes) => bytes.clone(),
            None => {
                let path = layer.path.clone().ok_or_else(|| {
                    OciDistributionError::ProtocolError(
                        "layer has neither in-memory data nor a file path".to_string(),
                    )
                })?;
                tokio::fs::read(&path).await?
            }
        };
        self.push_blob_with_digest(&layer_bytes, &layer.descriptor.digest).await?;

        let mut manifest = OciManifest::empty()
            .with_config(config.descriptor)
            .with_layers(vec![layer.descriptor]);
        if let Some(at) = artifact_type {
            manifest = manifest.with_artifact_type(at);
        }
        if let Some(ann) = annotations {
            manifest = manifest.with_annotations(ann);
        }
        self.push_manifest(reference, &manifest).await?;
        Ok(manifest)
    }

    /// Materialize every layer of the artifact named by `reference` under
    /// `dest_dir`, one file per layer, named by its
    /// `org.opencontainers.image.title` annotation (falling back to the
    /// layer's digest). Rejects layer titles that would escape `dest_dir`.
    pub async fn pull_artifact(
        &self,
        reference: &LayoutRef,
        dest_dir: &Path,
        overwrite: bool,
    ) -> Result<Vec<PathBuf>, OciDistributionError> {
        if !reference.has_tag_or_digest() {
            return Err(OciDistributionError::TagRequired);
        }
        let (manifest, _) = self.get_manifest(reference).await?;
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut written = vec![];
        for layer in &manifest.layers {
            let title = layer
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_TITLE))
                .cloned()
                .unwrap_or_else(|| layer.digest.replace(':', "-"));
            let rel = Path::new(&title);
            if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(OciDistributionError::ProtocolError(format!(
                    "refusing path traversal in layer title: {title}"
                )));
            }
            let dest_path = dest_dir.join(rel);
            if !overwrite && tokio::fs::metadata(&dest_path).await.is_ok() {
                return Err(OciDistributionError::AlreadyExists(
                    dest_path.display().to_string(),
                ));
            }
            let bytes = self.get_blob(layer).await?;
            self.write_atomic(&dest_path, &bytes).await?;
            written.push(dest_path);
        }
        Ok(written)
    }

    /// Copy an artifact from a registry into this layout.
    pub async fn copy_from_registry(
        &self,
        client: &crate::client::Client,
        source: &crate::reference::ContainerRef,
        dest: &LayoutRef,
        recursive: bool,
    ) -> Result<OciDescriptor, OciDistributionError> {
        crate::client::copy(
            crate::client::CopySource::Registry(client, source),
            crate::client::CopyDestination::Layout(self, dest),
            recursive,
        )
        .await
    }

    /// Copy an artifact from this layout to a registry.
    pub async fn copy_to_registry(
        &self,
        source: &LayoutRef,
        client: &crate::client::Client,
        dest: &crate::reference::ContainerRef,
        recursive: bool,
    ) -> Result<OciDescriptor, OciDistributionError> {
        crate::client::copy(
            crate::client::CopySource::Layout(self, source),
            crate::client::CopyDestination::Registry(client, dest),
            recursive,
        )
        .await
    }
}
