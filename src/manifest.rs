//! The content-addressable store model: descriptors, manifests, indices,
//! configs, and layers.
use crate::digest::{digest_bytes, DigestAlgorithm, EMPTY_JSON_BYTES, EMPTY_JSON_DIGEST};
use std::collections::HashMap;
use std::path::PathBuf;

/// The mediatype for an OCI image manifest.
pub const IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// The mediatype for an OCI image index (manifest list).
pub const IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// The mediatype for an OCI image config.
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
/// The mediatype shared by the canonical empty config and empty layer.
pub const EMPTY_MEDIA_TYPE: &str = "application/vnd.oci.empty.v1+json";
/// The mediatype for a plain tar layer.
pub const IMAGE_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";
/// The mediatype for a gzip-compressed tar layer.
pub const IMAGE_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// The mediatype for a zstd-compressed tar layer.
pub const IMAGE_LAYER_ZSTD_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
/// The mediatype for a nondistributable tar layer.
pub const IMAGE_LAYER_NONDISTRIBUTABLE_MEDIA_TYPE: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
/// The legacy Docker v2 manifest mediatype, still widely produced by registries.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
/// The legacy Docker v2 config mediatype.
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
/// The legacy Docker v2 gzip layer mediatype.
pub const DOCKER_LAYER_GZIP_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// The annotation key that binds a human-readable tag to a manifest descriptor
/// inside an index or layout `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// The annotation key conventionally used to record a layer's original file name.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// The OCI platform object: the architecture/OS a manifest entry targets.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU variant, e.g. `v8` for `arm/v8`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// The uniform content handle: media type, digest, size, and optional metadata.
///
/// Two descriptors are equal iff their `digest`, `size`, and `media_type` match;
/// `annotations`/`urls`/`artifact_type`/`data`/`platform` are not considered.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciDescriptor {
    /// The media type of the referenced content.
    pub media_type: String,
    /// The digest of the referenced content.
    pub digest: String,
    /// The size, in bytes, of the referenced content.
    pub size: i64,
    /// Alternate download URLs for nondistributable content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    /// Arbitrary metadata for this descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
    /// The artifact type of the referenced content, when it differs from `media_type`.
    #[serde(skip_serializing_if = "Option::is_none", rename = "artifactType")]
    pub artifact_type: Option<String>,
    /// Base64-encoded raw bytes embedded directly in the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// The platform this entry targets, for index manifest entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl PartialEq for OciDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
            && self.size == other.size
            && self.media_type == other.media_type
    }
}
impl Eq for OciDescriptor {}

impl Default for OciDescriptor {
    fn default() -> Self {
        OciDescriptor {
            media_type: IMAGE_CONFIG_MEDIA_TYPE.to_owned(),
            digest: "".to_owned(),
            size: 0,
            urls: None,
            annotations: None,
            artifact_type: None,
            data: None,
            platform: None,
        }
    }
}

impl OciDescriptor {
    /// Construct a descriptor with the default (config) media type.
    pub fn of(digest: impl Into<String>, size: i64) -> Self {
        OciDescriptor {
            digest: digest.into(),
            size,
            ..Default::default()
        }
    }

    /// Construct a descriptor with an explicit media type.
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        OciDescriptor {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            ..Default::default()
        }
    }

    /// Return a copy with the given annotations attached.
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Return a copy with an artifact type attached.
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Return a copy with a platform attached (for index manifest entries).
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Bind a human-readable tag to this descriptor via the conventional
    /// `org.opencontainers.image.ref.name` annotation.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(HashMap::new)
            .insert(ANNOTATION_REF_NAME.to_string(), tag.into());
        self
    }

    /// The tag bound to this descriptor, if any.
    pub fn tag(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }
}

/// The canonical empty descriptor: media type `application/vnd.oci.empty.v1+json`,
/// digest `sha256:44136fa3...`, size 2, with the two-byte body `{}` embedded.
pub fn empty_descriptor() -> OciDescriptor {
    OciDescriptor {
        media_type: EMPTY_MEDIA_TYPE.to_string(),
        digest: EMPTY_JSON_DIGEST.to_string(),
        size: EMPTY_JSON_BYTES.len() as i64,
        urls: None,
        annotations: None,
        artifact_type: None,
        data: Some(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            EMPTY_JSON_BYTES,
        )),
        platform: None,
    }
}

/// A layer: a descriptor plus, optionally, the bytes or a path to them.
#[derive(Debug, Clone)]
pub struct Layer {
    /// The layer's descriptor.
    pub descriptor: OciDescriptor,
    /// The layer's content, if held in memory.
    pub data: Option<Vec<u8>>,
    /// A path to the layer's content on disk, if not held in memory.
    pub path: Option<PathBuf>,
}

impl Layer {
    /// Build a layer from in-memory bytes, computing its digest and size.
    pub fn from_bytes(media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        let digest = digest_bytes(DigestAlgorithm::Sha256, &bytes);
        let descriptor = OciDescriptor::new(media_type, digest, bytes.len() as i64);
        Layer {
            descriptor,
            data: Some(bytes),
            path: None,
        }
    }

    /// Build a layer referencing a file on disk; the digest is computed by
    /// streaming the file rather than reading it into memory.
    pub fn from_path(
        media_type: impl Into<String>,
        path: PathBuf,
    ) -> Result<Self, crate::errors::OciDistributionError> {
        let size = std::fs::metadata(&path)?.len() as i64;
        let digest = crate::digest::digest_file(DigestAlgorithm::Sha256, &path)?;
        let descriptor = OciDescriptor::new(media_type, digest, size);
        Ok(Layer {
            descriptor,
            data: None,
            path: Some(path),
        })
    }

    /// The canonical empty layer, shared by digest with the canonical empty config.
    pub fn empty() -> Self {
        Layer {
            descriptor: empty_descriptor(),
            data: Some(EMPTY_JSON_BYTES.to_vec()),
            path: None,
        }
    }
}

/// An OCI image manifest: a config descriptor, an ordered list of layers, and
/// optional subject/annotations/artifact type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    /// This is a schema version.
    ///
    /// The specification does not specify the width of this integer.
    /// However, the only version allowed by the specification is `2`.
    /// So we have made this a u8.
    pub schema_version: u8,

    /// This is an optional media type describing this manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// The artifact type, for artifact manifests that are not container images.
    #[serde(skip_serializing_if = "Option::is_none", rename = "artifactType")]
    pub artifact_type: Option<String>,

    /// The image configuration descriptor.
    ///
    /// This object is required.
    pub config: OciDescriptor,

    /// The ordered list of layer descriptors. A manifest with no real layers
    /// still carries one synthetic empty-layer entry; see [`empty_descriptor`].
    pub layers: Vec<OciDescriptor>,

    /// The subject descriptor, if this manifest is a referrer of another artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<OciDescriptor>,

    /// The annotations for this manifest.
    ///
    /// The specification says "If there are no annotations then this property
    /// MUST either be absent or be an empty map." To accommodate either, this
    /// is optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl OciManifest {
    /// The minimal valid manifest: an empty config and the synthetic empty
    /// layer (so registries that refuse an empty `layers` array still accept it).
    pub fn empty() -> Self {
        OciManifest {
            schema_version: 2,
            media_type: Some(IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
            artifact_type: None,
            config: empty_descriptor(),
            layers: vec![empty_descriptor()],
            subject: None,
            annotations: None,
        }
    }

    /// Replace the config descriptor.
    pub fn with_config(mut self, config: OciDescriptor) -> Self {
        self.config = config;
        self
    }

    /// Replace the layer list. A caller passing an empty vector gets the
    /// synthetic empty-layer convention re-applied automatically.
    pub fn with_layers(mut self, layers: Vec<OciDescriptor>) -> Self {
        self.layers = if layers.is_empty() {
            vec![empty_descriptor()]
        } else {
            layers
        };
        self
    }

    /// Attach a subject descriptor, making this manifest a referrer.
    pub fn with_subject(mut self, subject: OciDescriptor) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Replace the manifest-level annotations.
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Set the artifact type.
    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Serialize to the exact bytes that should be pushed/digested.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// An OCI image index: an ordered list of manifest descriptors, used for
/// multi-platform image lists and for layout top-level indices.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    /// The index schema version; always `2`.
    pub schema_version: u8,
    /// The index's own media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// The ordered list of manifest descriptors.
    pub manifests: Vec<OciDescriptor>,
    /// Arbitrary index-level annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl OciIndex {
    /// A fresh, empty index.
    pub fn empty() -> Self {
        OciIndex {
            schema_version: 2,
            media_type: Some(IMAGE_INDEX_MEDIA_TYPE.to_string()),
            manifests: vec![],
            annotations: None,
        }
    }

    /// Replace the manifest list.
    pub fn with_manifests(mut self, manifests: Vec<OciDescriptor>) -> Self {
        self.manifests = manifests;
        self
    }

    /// Replace the index-level annotations.
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Self {
        self.annotations = Some(annotations);
        self
    }

    /// Find the entry carrying the given tag annotation, if any.
    pub fn find_by_tag(&self, tag: &str) -> Option<&OciDescriptor> {
        self.manifests.iter().find(|d| d.tag() == Some(tag))
    }

    /// Find the entry with the given digest, if any.
    pub fn find_by_digest(&self, digest: &str) -> Option<&OciDescriptor> {
        self.manifests.iter().find(|d| d.digest == digest)
    }

    /// Serialize to the exact bytes that should be pushed/digested.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// An OCI image configuration: a descriptor plus an arbitrary JSON document.
/// The canonical empty config is `{}` with media type [`EMPTY_MEDIA_TYPE`].
#[derive(Debug, Clone)]
pub struct Config {
    /// The config's descriptor.
    pub descriptor: OciDescriptor,
    /// The raw JSON document this descriptor points at.
    pub raw: serde_json::Value,
}

impl Config {
    /// The canonical empty config: `{}`.
    pub fn empty() -> Self {
        Config {
            descriptor: empty_descriptor(),
            raw: serde_json::json!({}),
        }
    }

    /// Build a config from an arbitrary JSON document, computing its digest.
    pub fn new(media_type: impl Into<String>, raw: serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(&raw).unwrap_or_default();
        let digest = digest_bytes(DigestAlgorithm::Sha256, &bytes);
        Config {
            descriptor: OciDescriptor::new(media_type, digest, bytes.len() as i64),
            raw,
        }
    }

    /// Serialize to the exact bytes that should be pushed/digested.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.raw)
    }
}

/// Versioned provides a struct with the manifest's schemaVersion and mediaType.
/// Incoming content with unknown schema versions can be decoded against this
/// struct to check the version before committing to a full manifest or index
/// deserialization.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versioned {
    /// schema_version is the schema version this document claims to follow.
    pub schema_version: i32,

    /// media_type is the media type of this document, if present.
    pub media_type: Option<String>,
}

/// Build a new manifest whose `subject` points at `target`, attaching an
/// artifact of the given type. The caller is responsible for pushing both the
/// artifact's content and the resulting manifest.
pub fn attach(
    target: OciDescriptor,
    artifact_type: impl Into<String>,
    layer: Layer,
) -> OciManifest {
    OciManifest::empty()
        .with_config(empty_descriptor())
        .with_layers(vec![layer.descriptor])
        .with_artifact_type(artifact_type)
        .with_subject(target)
}

#[cfg(test)]
mod test {
    use super::*;
    const TEST_MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "size": 2,
            "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        },
        "layers": [
            {
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "size": 1615998,
                "digest": "sha256:f9c91f4c280ab92aff9eb03b279c4774a80b84428741ab20855d32004b2b983f",
                "annotations": {
                    "org.opencontainers.image.title": "module.tar"
                }
            }
        ]
    }
    "#;

    #[test]
    fn test_manifest() {
        let manifest: OciManifest = serde_json::from_str(TEST_MANIFEST).expect("parsed manifest");
        assert_eq!(2, manifest.schema_version);
        assert_eq!(
            Some(IMAGE_MANIFEST_MEDIA_TYPE.to_owned()),
            manifest.media_type
        );
        let config = manifest.config;
        assert_eq!(IMAGE_CONFIG_MEDIA_TYPE.to_owned(), config.media_type);
        assert_eq!(2, config.size);
        assert_eq!(
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a".to_owned(),
            config.digest
        );

        assert_eq!(1, manifest.layers.len());
        let layer = &manifest.layers[0];
        assert_eq!(1_615_998, layer.size);
        assert_eq!(IMAGE_LAYER_MEDIA_TYPE.to_owned(), layer.media_type);
        assert_eq!(1, layer.annotations.as_ref().expect("annotations map").len());
    }

    #[test]
    fn empty_manifest_has_synthetic_layer() {
        let m = OciManifest::empty();
        assert_eq!(m.layers.len(), 1);
        assert_eq!(m.layers[0].digest, EMPTY_JSON_DIGEST);
        assert_eq!(m.config.digest, EMPTY_JSON_DIGEST);
    }

    #[test]
    fn with_layers_reapplies_empty_convention() {
        let m = OciManifest::empty().with_layers(vec![]);
        assert_eq!(m.layers, vec![empty_descriptor()]);
    }

    #[test]
    fn descriptor_equality_ignores_annotations() {
        let mut annotated = OciDescriptor::of("sha256:aaaa", 10);
        annotated.annotations = Some(HashMap::from([("x".to_string(), "y".to_string())]));
        let bare = OciDescriptor::of("sha256:aaaa", 10);
        assert_eq!(annotated, bare);
    }

    #[test]
    fn descriptor_inequality_on_digest() {
        let a = OciDescriptor::of("sha256:aaaa", 10);
        let b = OciDescriptor::of("sha256:bbbb", 10);
        assert_ne!(a, b);
    }

    #[test]
    fn index_finds_entries_by_tag_and_digest() {
        let d1 = OciDescriptor::of("sha256:aaaa", 1).with_tag("latest");
        let d2 = OciDescriptor::of("sha256:bbbb", 2);
        let idx = OciIndex::empty().with_manifests(vec![d1.clone(), d2.clone()]);
        assert_eq!(idx.find_by_tag("latest"), Some(&d1));
        assert_eq!(idx.find_by_digest("sha256:bbbb"), Some(&d2));
        assert_eq!(idx.find_by_tag("missing"), None);
    }

    #[test]
    fn attach_sets_subject() {
        let target = OciDescriptor::new(IMAGE_MANIFEST_MEDIA_TYPE, "sha256:aaaa", 10);
        let layer = Layer::from_bytes("application/vnd.example.sbom+json", b"{}".to_vec());
        let m = attach(target.clone(), "application/vnd.example.sbom+json", layer);
        assert_eq!(m.subject, Some(target));
        assert_eq!(
            m.artifact_type.as_deref(),
            Some("application/vnd.example.sbom+json")
        );
    }

    #[test]
    fn config_empty_matches_canonical_digest() {
        let c = Config::empty();
        assert_eq!(c.descriptor.digest, EMPTY_JSON_DIGEST);
        assert_eq!(c.descriptor.media_type, EMPTY_MEDIA_TYPE);
    }

    #[test]
    fn manifest_json_round_trips() {
        let m = OciManifest::empty();
        let bytes = m.to_json_bytes().unwrap();
        let back: OciManifest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.schema_version, m.schema_version);
        assert_eq!(back.config, m.config);
    }
}
