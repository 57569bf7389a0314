//! The distribution client: pushes, pulls, mounts, and copies blobs,
//! manifests, and indices against an OCI-conformant registry.
use crate::digest::{self, Digest, DigestAlgorithm};
use crate::errors::{NotFoundKind, OciDistributionError, OciEnvelope};
use crate::http::{ClientConfig, ClientProtocol, HttpEngine};
use crate::manifest::{
    Config, Layer, OciDescriptor, OciIndex, OciManifest, IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
};
use crate::reference::ContainerRef;
use crate::secrets::AuthProvider;
use reqwest::{header, Method, Response, StatusCode};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A client for a single OCI-conformant registry host.
///
/// `Client` carries no per-reference state beyond an [`HttpEngine`] (redirect
/// policy, TLS policy, bearer-token cache) and an [`AuthProvider`] (the
/// credential resolution strategy). The same client can be reused across many
/// repositories on the same registry.
pub struct Client {
    engine: HttpEngine,
    auth: AuthProvider,
    protocol: &'static str,
}

impl Client {
    /// Build a client with the given configuration, authenticating anonymously.
    pub fn new(config: ClientConfig) -> Result<Self, OciDistributionError> {
        Self::with_auth(config, AuthProvider::None)
    }

    /// Build a client with the given configuration and auth strategy.
    pub fn with_auth(config: ClientConfig, auth: AuthProvider) -> Result<Self, OciDistributionError> {
        let protocol = config.protocol.as_str();
        Ok(Client {
            engine: HttpEngine::new(config)?,
            auth,
            protocol,
        })
    }

    /// Replace the auth strategy used for subsequent requests.
    pub fn set_auth(&mut self, auth: AuthProvider) {
        self.auth = auth;
    }

    /// A clone of this client's cancellation token. Calling `.cancel()` on
    /// any clone aborts every in-flight and future network operation issued
    /// through this client, surfacing [`OciDistributionError::Cancelled`].
    pub fn cancellation_token(&self) -> tokio_util::sync::CancellationToken {
        self.engine.cancellation_token()
    }

    /// Abort every in-flight and future network operation issued through
    /// this client.
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Whether [`Client::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.engine.is_cancelled()
    }

    async fn error_for_status(
        &self,
        response: Response,
        kind: NotFoundKind,
        reference: &str,
    ) -> OciDistributionError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<OciEnvelope>(&body)
            .ok()
            .and_then(|e| e.errors.into_iter().next())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or(body);
        match status {
            StatusCode::UNAUTHORIZED => OciDistributionError::Unauthorized(message),
            StatusCode::FORBIDDEN => OciDistributionError::Forbidden(message),
            StatusCode::NOT_FOUND => OciDistributionError::NotFound {
                kind,
                reference: reference.to_string(),
            },
            _ => OciDistributionError::ProtocolError(format!("unexpected status {status}: {message}")),
        }
    }

    fn verify_digest(&self, expected: &str, bytes: &[u8]) -> Result<(), OciDistributionError> {
        let alg = digest::from_digest(expected)?;
        let actual = digest::digest_bytes(alg, bytes);
        if actual != expected {
            return Err(OciDistributionError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    fn resolve_location(&self, reference: &ContainerRef, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else if let Some(stripped) = location.strip_prefix('/') {
            format!("{}://{}/{}", self.protocol, reference.registry(), stripped)
        } else {
            format!("{}://{}/{}", self.protocol, reference.registry(), location)
        }
    }

    fn append_digest_query(&self, location: &str, digest: &str) -> Result<String, OciDistributionError> {
        let mut url = reqwest::Url::parse(location)
            .map_err(|e| OciDistributionError::ProtocolError(e.to_string()))?;
        url.query_pairs_mut().append_pair("digest", digest);
        Ok(url.to_string())
    }

    // ---- Blobs ----------------------------------------------------------

    /// HEAD a blob to check whether it already exists at this registry.
    pub async fn blob_exists(&self, reference: &ContainerRef, digest: &str) -> Result<bool, OciDistributionError> {
        let url = reference.to_v2_blob_url(self.protocol, digest);
        let response = self
            .engine
            .execute(reference, Method::HEAD, &url, vec![], None, &self.auth)
            .await?;
        Ok(response.status().is_success())
    }

    async fn begin_blob_upload(&self, reference: &ContainerRef) -> Result<String, OciDistributionError> {
        let url = reference.to_v2_blob_upload_url(self.protocol);
        let response = self
            .engine
            .execute(reference, Method::POST, &url, vec![], None, &self.auth)
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::CREATED => {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .ok_or_else(|| OciDistributionError::ProtocolError("upload POST missing Location".into()))?
                    .to_str()
                    .map_err(|e| OciDistributionError::ProtocolError(e.to_string()))?
                    .to_string();
                Ok(self.resolve_location(reference, &location))
            }
            _ => Err(self
                .error_for_status(response, NotFoundKind::Blob, reference.repository())
                .await),
        }
    }

    /// Cross-repository mount: ask the registry to link a blob already present
    /// in `from_repository` into `reference`'s repository without re-uploading
    /// it. Returns `false` if the registry declined the mount (the caller
    /// should fall back to [`Client::push_blob`]).
    pub async fn mount_blob(
        &self,
        reference: &ContainerRef,
        from_repository: &str,
        source: &OciDescriptor,
    ) -> Result<bool, OciDistributionError> {
        let url = reference.to_v2_blob_mount_url(self.protocol, &source.digest, from_repository);
        let response = self
            .engine
            .execute(reference, Method::POST, &url, vec![], None, &self.auth)
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => Ok(false),
            _ => {
                Err(self
                    .error_for_status(response, NotFoundKind::Blob, &source.digest)
                    .await)
            }
        }
    }

    async fn commit_blob_monolithic(
        &self,
        reference: &ContainerRef,
        location: &str,
        digest: &str,
        bytes: &[u8],
    ) -> Result<bool, OciDistributionError> {
        let url = self.append_digest_query(location, digest)?;
        let headers = vec![(header::CONTENT_TYPE, "application/octet-stream".to_string())];
        let response = self
            .engine
            .execute(reference, Method::PUT, &url, headers, Some(bytes.to_vec()), &self.auth)
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK | StatusCode::CONFLICT => Ok(true),
            s if s.is_client_error() && s != StatusCode::UNAUTHORIZED && s != StatusCode::FORBIDDEN => Ok(false),
            _ => Err(self.error_for_status(response, NotFoundKind::Blob, digest).await),
        }
    }

    /// Upload in fixed-size chunks read incrementally from `reader`, so the
    /// whole blob is never resident in memory at once.
    async fn commit_blob_chunked<R: AsyncRead + Unpin>(
        &self,
        reference: &ContainerRef,
        digest: &str,
        mut reader: R,
    ) -> Result<(), OciDistributionError> {
        let mut location = self.begin_blob_upload(reference).await?;
        let mut offset: u64 = 0;
        loop {
            let mut buf = vec![0u8; digest::CHUNK_SIZE];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            let end = offset + buf.len() as u64;
            let headers = vec![(
                header::CONTENT_RANGE,
                format!("{}-{}", offset, end.saturating_sub(1)),
            )];
            let response = self
                .engine
                .execute(reference, Method::PATCH, &location, headers, Some(buf), &self.auth)
                .await?;
            match response.status() {
                StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::CREATED => {
                    if let Some(loc) = response.headers().get(header::LOCATION) {
                        if let Ok(loc) = loc.to_str() {
                            location = self.resolve_location(reference, loc);
                        }
                    }
                    offset = end;
                }
                _ => return Err(self.error_for_status(response, NotFoundKind::Blob, digest).await),
            }
        }
        let close_url = self.append_digest_query(&location, digest)?;
        let response = self
            .engine
            .execute(reference, Method::PUT, &close_url, vec![], None, &self.auth)
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK | StatusCode::CONFLICT => Ok(()),
            _ => Err(self.error_for_status(response, NotFoundKind::Blob, digest).await),
        }
    }

    /// Push a blob already fully resident in memory, skipping the upload if
    /// the registry already has it. Falls back to a chunked upload if the
    /// registry rejects the monolithic form.
    pub async fn push_blob_bytes(
        &self,
        reference: &ContainerRef,
        digest: &str,
        bytes: &[u8],
    ) -> Result<(), OciDistributionError> {
        if self.blob_exists(reference, digest).await? {
            debug!("blob {} already present at {}, skipping upload", digest, reference.repository());
            return Ok(());
        }
        let location = self.begin_blob_upload(reference).await?;
        if self.commit_blob_monolithic(reference, &location, digest, bytes).await? {
            return Ok(());
        }
        self.commit_blob_chunked(reference, digest, std::io::Cursor::new(bytes.to_vec()))
            .await
    }

    /// Push a blob from a file on disk, streaming it in fixed-size chunks so
    /// the whole file is never buffered in memory.
    pub async fn push_blob_from_path(
        &self,
        reference: &ContainerRef,
        digest: &str,
        path: &Path,
    ) -> Result<(), OciDistributionError> {
        if self.blob_exists(reference, digest).await? {
            return Ok(());
        }
        let file = tokio::fs::File::open(path).await?;
        self.commit_blob_chunked(reference, digest, file).await
    }

    /// Push a [`Layer`]'s content (config, manifest layer, or artifact blob)
    /// to `reference`'s repository, dispatching on whether the layer holds
    /// its bytes in memory or on disk.
    pub async fn push_blob(&self, reference: &ContainerRef, layer: &Layer) -> Result<(), OciDistributionError> {
        match (&layer.data, &layer.path) {
            (Some(bytes), _) => self.push_blob_bytes(reference, &layer.descriptor.digest, bytes).await,
            (None, Some(path)) => self.push_blob_from_path(reference, &layer.descriptor.digest, path).await,
            (None, None) => Err(OciDistributionError::ProtocolError(
                "layer has neither in-memory data nor a file path".to_string(),
            )),
        }
    }

    /// Push a config blob.
    pub async fn push_config(&self, reference: &ContainerRef, config: &Config) -> Result<(), OciDistributionError> {
        let bytes = config.to_json_bytes()?;
        self.push_blob_bytes(reference, &config.descriptor.digest, &bytes).await
    }

    /// Fetch a blob fully into memory, verifying it matches `descriptor`'s digest.
    pub async fn get_blob(
        &self,
        reference: &ContainerRef,
        descriptor: &OciDescriptor,
    ) -> Result<Vec<u8>, OciDistributionError> {
        let url = reference.to_v2_blob_url(self.protocol, &descriptor.digest);
        let response = self
            .engine
            .execute(reference, Method::GET, &url, vec![], None, &self.auth)
            .await?;
        if !response.status().is_success() {
            return Err(self
                .error_for_status(response, NotFoundKind::Blob, &descriptor.digest)
                .await);
        }
        let bytes = response.bytes().await?.to_vec();
        self.verify_digest(&descriptor.digest, &bytes)?;
        Ok(bytes)
    }

    /// Stream a blob directly into `out`, verifying its digest as bytes
    /// arrive, without ever buffering the whole blob in memory.
    pub async fn stream_blob<W: AsyncWrite + Unpin>(
        &self,
        reference: &ContainerRef,
        descriptor: &OciDescriptor,
        out: &mut W,
    ) -> Result<(), OciDistributionError> {
        use futures_util::StreamExt;

        let url = reference.to_v2_blob_url(self.protocol, &descriptor.digest);
        let response = self
            .engine
            .execute(reference, Method::GET, &url, vec![], None, &self.auth)
            .await?;
        if !response.status().is_success() {
            return Err(self
                .error_for_status(response, NotFoundKind::Blob, &descriptor.digest)
                .await);
        }
        let alg = digest::from_digest(&descriptor.digest)?;
        let mut digester = digest::StreamingDigester::new(alg);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if self.is_cancelled() {
                return Err(OciDistributionError::Cancelled);
            }
            let chunk = chunk?;
            digester.update(&chunk);
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        let actual = digester.finalize();
        if actual != descriptor.digest {
            return Err(OciDistributionError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Stream a blob to a file on disk.
    pub async fn fetch_blob(
        &self,
        reference: &ContainerRef,
        descriptor: &OciDescriptor,
        dest: &Path,
    ) -> Result<(), OciDistributionError> {
        let mut file = tokio::fs::File::create(dest).await?;
        self.stream_blob(reference, descriptor, &mut file).await
    }

    /// Delete a blob. A registry that has already forgotten it reports success.
    pub async fn delete_blob(&self, reference: &ContainerRef, digest: &str) -> Result<(), OciDistributionError> {
        let url = reference.to_v2_blob_url(self.protocol, digest);
        let response = self
            .engine
            .execute(reference, Method::DELETE, &url, vec![], None, &self.auth)
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(self.error_for_status(response, NotFoundKind::Blob, digest).await),
        }
    }

    // ---- Manifests and indices -------------------------------------------

    async fn push_manifest_bytes(
        &self,
        reference: &ContainerRef,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<OciDescriptor, OciDistributionError> {
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, bytes);
        let url = reference.to_v2_manifest_url(self.protocol);
        let headers = vec![(header::CONTENT_TYPE, media_type.to_string())];
        let response = self
            .engine
            .execute(reference, Method::PUT, &url, headers, Some(bytes.to_vec()), &self.auth)
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK | StatusCode::ACCEPTED => {
                Ok(OciDescriptor::new(media_type, digest, bytes.len() as i64))
            }
            _ => {
                Err(self
                    .error_for_status(response, NotFoundKind::Manifest, reference.tag_or_digest())
                    .await)
            }
        }
    }

    /// Push a manifest. Callers are responsible for having already pushed its
    /// config and layer blobs.
    pub async fn push_manifest(
        &self,
        reference: &ContainerRef,
        manifest: &OciManifest,
    ) -> Result<OciDescriptor, OciDistributionError> {
        let bytes = manifest.to_json_bytes()?;
        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| IMAGE_MANIFEST_MEDIA_TYPE.to_string());
        self.push_manifest_bytes(reference, &bytes, &media_type).await
    }

    /// Push an index. Callers are responsible for having already pushed every
    /// manifest it references.
    pub async fn push_index(
        &self,
        reference: &ContainerRef,
        index: &OciIndex,
    ) -> Result<OciDescriptor, OciDistributionError> {
        let bytes = index.to_json_bytes()?;
        let media_type = index
            .media_type
            .clone()
            .unwrap_or_else(|| IMAGE_INDEX_MEDIA_TYPE.to_string());
        self.push_manifest_bytes(reference, &bytes, &media_type).await
    }

    async fn get_manifest_bytes(
        &self,
        reference: &ContainerRef,
    ) -> Result<(Vec<u8>, OciDescriptor), OciDistributionError> {
        let url = reference.to_v2_manifest_url(self.protocol);
        let response = self
            .engine
            .execute(reference, Method::GET, &url, vec![], None, &self.auth)
            .await?;
        if !response.status().is_success() {
            return Err(self
                .error_for_status(response, NotFoundKind::Manifest, reference.tag_or_digest())
                .await);
        }
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(IMAGE_MANIFEST_MEDIA_TYPE)
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        if let Some(expected) = reference.digest() {
            if expected != digest {
                return Err(OciDistributionError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: digest,
                });
            }
        }
        Ok((bytes, OciDescriptor::new(media_type, digest, bytes.len() as i64)))
    }

    /// Fetch and parse a manifest.
    pub async fn get_manifest(
        &self,
        reference: &ContainerRef,
    ) -> Result<(OciManifest, OciDescriptor), OciDistributionError> {
        debug!("pulling manifest for {}", reference.whole());
        let (bytes, descriptor) = self.get_manifest_bytes(reference).await?;
        let manifest: OciManifest = serde_json::from_slice(&bytes)?;
        Ok((manifest, descriptor))
    }

    /// Fetch and parse an index.
    pub async fn get_index(&self, reference: &ContainerRef) -> Result<(OciIndex, OciDescriptor), OciDistributionError> {
        let (bytes, descriptor) = self.get_manifest_bytes(reference).await?;
        let index: OciIndex = serde_json::from_slice(&bytes)?;
        Ok((index, descriptor))
    }

    /// HEAD the manifest for `reference`, resolving its descriptor without
    /// downloading the body. Used by [`Client::attach_artifact`] to find the
    /// subject a new referrer should point at.
    pub async fn resolve_descriptor(&self, reference: &ContainerRef) -> Result<OciDescriptor, OciDistributionError> {
        let url = reference.to_v2_manifest_url(self.protocol);
        let response = self
            .engine
            .execute(reference, Method::HEAD, &url, vec![], None, &self.auth)
            .await?;
        if !response.status().is_success() {
            return Err(self
                .error_for_status(response, NotFoundKind::Manifest, reference.tag_or_digest())
                .await);
        }
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(IMAGE_MANIFEST_MEDIA_TYPE)
            .to_string();
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| OciDistributionError::ProtocolError("manifest HEAD missing Docker-Content-Digest".into()))?;
        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(OciDescriptor::new(media_type, digest, size))
    }

    /// Delete a manifest (or index). A registry that has already forgotten it
    /// reports success.
    pub async fn delete_manifest(&self, reference: &ContainerRef) -> Result<(), OciDistributionError> {
        let url = reference.to_v2_manifest_url(self.protocol);
        let response = self
            .engine
            .execute(reference, Method::DELETE, &url, vec![], None, &self.auth)
            .await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK | StatusCode::NOT_FOUND => Ok(()),
            _ => {
                Err(self
                    .error_for_status(response, NotFoundKind::Manifest, reference.tag_or_digest())
                    .await)
            }
        }
    }

    /// List the tags of `reference`'s repository.
    pub async fn list_tags(&self, reference: &ContainerRef) -> Result<Vec<String>, OciDistributionError> {
        #[derive(serde::Deserialize)]
        struct TagList {
            tags: Vec<String>,
        }
        let url = reference.to_v2_tags_list_url(self.protocol);
        let response = self
            .engine
            .execute(reference, Method::GET, &url, vec![], None, &self.auth)
            .await?;
        if !response.status().is_success() {
            return Err(self
                .error_for_status(response, NotFoundKind::Tag, reference.repository())
                .await);
        }
        let parsed: TagList = response.json().await?;
        Ok(parsed.tags)
    }

    /// Discover the referrers of `digest`: manifests whose `subject` points at
    /// it. Falls back to the pre-referrers-API tag convention
    /// (`<alg>-<hex>`) if the registry doesn't support `/v2/<name>/referrers/`.
    pub async fn get_referrers(
        &self,
        reference: &ContainerRef,
        digest: &str,
        artifact_type: Option<&str>,
    ) -> Result<OciIndex, OciDistributionError> {
        let url = reference.to_v2_referrers_url(self.protocol, digest);
        let response = self
            .engine
            .execute(reference, Method::GET, &url, vec![], None, &self.auth)
            .await?;
        let mut index = match response.status() {
            StatusCode::OK => {
                let bytes = response.bytes().await?;
                serde_json::from_slice::<OciIndex>(&bytes)?
            }
            StatusCode::NOT_FOUND => self.get_referrers_by_tag_schema(reference, digest).await?,
            _ => {
                return Err(self.error_for_status(response, NotFoundKind::Manifest, digest).await);
            }
        };
        if let Some(at) = artifact_type {
            index.manifests.retain(|d| d.artifact_type.as_deref() == Some(at));
        }
        Ok(index)
    }

    async fn get_referrers_by_tag_schema(
        &self,
        reference: &ContainerRef,
        digest: &str,
    ) -> Result<OciIndex, OciDistributionError> {
        let parsed = Digest::parse(digest)?;
        let tag = format!("{}-{}", parsed.algorithm(), parsed.hex());
        let tag_ref = reference.clone_with_tag(tag);
        match self.get_index(&tag_ref).await {
            Ok((index, _)) => Ok(index),
            Err(OciDistributionError::NotFound { .. }) => Ok(OciIndex::empty()),
            Err(e) => Err(e),
        }
    }

    // ---- Convenience: artifacts -------------------------------------------

    /// Push an artifact from a single layer: the layer blob, an empty (or
    /// caller-supplied) config blob, and the manifest binding them together.
    pub async fn push_artifact(
        &self,
        reference: &ContainerRef,
        artifact_type: Option<&str>,
        layer: Layer,
        annotations: Option<HashMap<String, String>>,
        config: Option<Config>,
    ) -> Result<OciManifest, OciDistributionError> {
        let config = config.unwrap_or_else(Config::empty);
        self.push_config(reference, &config).await?;
        self.push_blob(reference, &layer).await?;

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

    /// Attach an artifact (e.g. an SBOM or signature) to the manifest or index
    /// currently at `reference`, producing a new referrer manifest whose
    /// `subject` points at it.
    pub async fn attach_artifact(
        &self,
        reference: &ContainerRef,
        artifact_type: &str,
        layer: Layer,
    ) -> Result<OciManifest, OciDistributionError> {
        let target = self.resolve_descriptor(reference).await?;
        self.push_config(reference, &Config::empty()).await?;
        self.push_blob(reference, &layer).await?;
        let manifest = crate::manifest::attach(target, artifact_type, layer);
        self.push_manifest(reference, &manifest).await?;
        Ok(manifest)
    }
}

/// Where a [`copy`] reads its source artifact graph from.
pub enum CopySource<'a> {
    /// A remote registry, via an already-authenticated client.
    Registry(&'a Client, &'a ContainerRef),
    /// A local OCI image layout directory.
    Layout(&'a crate::layout::OciLayoutStore, &'a crate::reference::LayoutRef),
}

/// Where a [`copy`] writes its destination artifact graph to.
pub enum CopyDestination<'a> {
    /// A remote registry, via an already-authenticated client.
    Registry(&'a Client, &'a ContainerRef),
    /// A local OCI image layout directory.
    Layout(&'a crate::layout::OciLayoutStore, &'a crate::reference::LayoutRef),
}

async fn source_get_manifest(source: &CopySource<'_>) -> Result<(Vec<u8>, OciDescriptor), OciDistributionError> {
    match source {
        CopySource::Registry(client, reference) => client.get_manifest_bytes(reference).await,
        CopySource::Layout(store, layout_ref) => store.get_manifest_bytes(layout_ref).await,
    }
}

async fn source_get_manifest_at_digest(
    source: &CopySource<'_>,
    digest: &str,
) -> Result<(Vec<u8>, OciDescriptor), OciDistributionError> {
    match source {
        CopySource::Registry(client, reference) => {
            let at_digest = reference.clone_with_digest(digest.to_string());
            client.get_manifest_bytes(&at_digest).await
        }
        CopySource::Layout(store, layout_ref) => {
            let at_digest =
                crate::reference::LayoutRef::parse(&format!("{}@{}", layout_ref.folder(), digest))?;
            store.get_manifest_bytes(&at_digest).await
        }
    }
}

async fn source_get_blob(
    source: &CopySource<'_>,
    descriptor: &OciDescriptor,
) -> Result<Vec<u8>, OciDistributionError> {
    match source {
        CopySource::Registry(client, reference) => client.get_blob(reference, descriptor).await,
        CopySource::Layout(store, _) => store.get_blob(descriptor).await,
    }
}

async fn dest_blob_exists(dest: &CopyDestination<'_>, digest: &str) -> Result<bool, OciDistributionError> {
    match dest {
        CopyDestination::Registry(client, reference) => client.blob_exists(reference, digest).await,
        CopyDestination::Layout(store, _) => store.blob_exists(digest).await,
    }
}

async fn dest_push_blob(
    dest: &CopyDestination<'_>,
    descriptor: &OciDescriptor,
    bytes: Vec<u8>,
) -> Result<(), OciDistributionError> {
    match dest {
        CopyDestination::Registry(client, reference) => {
            let layer = Layer {
                descriptor: descriptor.clone(),
                data: Some(bytes),
                path: None,
            };
            client.push_blob(reference, &layer).await
        }
        CopyDestination::Layout(store, _) => store.push_blob_with_digest(&bytes, &descriptor.digest).await.map(|_| ()),
    }
}

/// If `source` and `dest` are both registry references on the same host but
/// different repositories, try to mount `descriptor` into `dest`'s repository
/// directly rather than fetching and re-uploading its bytes. Returns `true`
/// if the mount succeeded; any decline or error leaves the blob unmounted so
/// the caller falls back to the ordinary fetch-then-push path.
async fn try_mount_blob(
    source: &CopySource<'_>,
    dest: &CopyDestination<'_>,
    descriptor: &OciDescriptor,
) -> bool {
    if let (CopySource::Registry(_, src_ref), CopyDestination::Registry(dst_client, dst_ref)) = (source, dest) {
        if src_ref.registry() == dst_ref.registry() && src_ref.repository() != dst_ref.repository() {
            if let Ok(true) = dst_client.mount_blob(dst_ref, src_ref.repository(), descriptor).await {
                return true;
            }
        }
    }
    false
}

async fn dest_push_manifest_bytes(
    dest: &CopyDestination<'_>,
    bytes: &[u8],
    media_type: &str,
) -> Result<OciDescriptor, OciDistributionError> {
    match dest {
        CopyDestination::Registry(client, reference) => client.push_manifest_bytes(reference, bytes, media_type).await,
        CopyDestination::Layout(store, layout_ref) => store.push_manifest_bytes(layout_ref, bytes, media_type).await,
    }
}

fn manifest_bytes_are_index(bytes: &[u8]) -> bool {
    match serde_json::from_slice::<crate::manifest::Versioned>(bytes) {
        Ok(v) => match v.media_type.as_deref() {
            Some(mt) => mt.contains("image.index") || mt.contains("manifest.list"),
            None => serde_json::from_slice::<OciManifest>(bytes).is_err(),
        },
        Err(_) => false,
    }
}

fn copy_node<'a>(
    source: &'a CopySource<'a>,
    dest: &'a CopyDestination<'a>,
    at_digest: Option<String>,
    visited: &'a mut std::collections::HashSet<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<OciDescriptor, OciDistributionError>> + 'a>> {
    Box::pin(async move {
        let (bytes, descriptor) = match &at_digest {
            None => source_get_manifest(source).await?,
            Some(d) => source_get_manifest_at_digest(source, d).await?,
        };

        if visited.contains(&descriptor.digest) {
            return Ok(descriptor);
        }
        visited.insert(descriptor.digest.clone());

        if manifest_bytes_are_index(&bytes) {
            let index: OciIndex = serde_json::from_slice(&bytes)?;
            for entry in &index.manifests {
                copy_node(source, dest, Some(entry.digest.clone()), visited).await?;
            }
        } else {
            let manifest: OciManifest = serde_json::from_slice(&bytes)?;
            if !visited.contains(&manifest.config.digest) {
                visited.insert(manifest.config.digest.clone());
                if !dest_blob_exists(dest, &manifest.config.digest).await?
                    && !try_mount_blob(source, dest, &manifest.config).await
                {
                    let config_bytes = source_get_blob(source, &manifest.config).await?;
                    dest_push_blob(dest, &manifest.config, config_bytes).await?;
                }
            }
            for layer in &manifest.layers {
                if visited.contains(&layer.digest) {
                    continue;
                }
                visited.insert(layer.digest.clone());
                if dest_blob_exists(dest, &layer.digest).await? {
                    continue;
                }
                if try_mount_blob(source, dest, layer).await {
                    continue;
                }
                let layer_bytes = source_get_blob(source, layer).await?;
                dest_push_blob(dest, layer, layer_bytes).await?;
            }
        }

        dest_push_manifest_bytes(dest, &bytes, &descriptor.media_type).await
    })
}

fn copy_referrers<'a>(
    source: &'a CopySource<'a>,
    dest: &'a CopyDestination<'a>,
    digest: String,
    visited: &'a mut std::collections::HashSet<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), OciDistributionError>> + 'a>> {
    Box::pin(async move {
        let referrers = match source {
            CopySource::Registry(client, reference) => client.get_referrers(reference, &digest, None).await?,
            CopySource::Layout(store, _) => store.get_referrers(&digest).await?,
        };
        for entry in referrers.manifests {
            if visited.contains(&entry.digest) {
                continue;
            }
            copy_node(source, dest, Some(entry.digest.clone()), visited).await?;
            copy_referrers(source, dest, entry.digest, visited).await?;
        }
        Ok(())
    })
}

/// Copy an artifact graph from `source` to `dest`.
///
/// A non-recursive copy moves the artifact named by `source` plus its config
/// and layers. A recursive copy additionally walks the referrer graph
/// transitively. Blobs already present at the destination (checked by digest)
/// are skipped; each remaining blob is read from the source and written to
/// the destination one at a time rather than accumulating the whole graph in
/// memory. Manifests are written only after every blob they reference exists
/// at the destination, and an index only after every manifest it references
/// does.
pub async fn copy(
    source: CopySource<'_>,
    dest: CopyDestination<'_>,
    recursive: bool,
) -> Result<OciDescriptor, OciDistributionError> {
    let mut visited = std::collections::HashSet::new();
    let descriptor = copy_node(&source, &dest, None, &mut visited).await?;
    if recursive {
        copy_referrers(&source, &dest, descriptor.digest.clone(), &mut visited).await?;
    }
    Ok(descriptor)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reference::ContainerRef;

    fn test_client() -> Client {
        let config = ClientConfig {
            protocol: ClientProtocol::Http,
            ..ClientConfig::default()
        };
        Client::new(config).expect("client builds")
    }

    fn reference(mock_url: &str) -> ContainerRef {
        let host = mock_url.trim_start_matches("http://");
        ContainerRef::parse(&format!("{host}/my/repo:latest")).expect("reference parses")
    }

    #[tokio::test]
    async fn blob_exists_reflects_head_status() {
        let mut server = mockito::Server::new_async().await;
        let digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let m = server
            .mock("HEAD", "/v2/my/repo/blobs/sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
            .with_status(200)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        assert!(client.blob_exists(&r, digest).await.unwrap());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn push_blob_bytes_skips_when_already_present() {
        let mut server = mockito::Server::new_async().await;
        let bytes = b"hello".to_vec();
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        let head = server
            .mock("HEAD", format!("/v2/my/repo/blobs/{digest}").as_str())
            .with_status(200)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        client.push_blob_bytes(&r, &digest, &bytes).await.unwrap();
        head.assert_async().await;
    }

    #[tokio::test]
    async fn push_blob_bytes_uploads_monolithically() {
        let mut server = mockito::Server::new_async().await;
        let bytes = b"hello".to_vec();
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        let head = server
            .mock("HEAD", format!("/v2/my/repo/blobs/{digest}").as_str())
            .with_status(404)
            .create_async()
            .await;
        let post = server
            .mock("POST", "/v2/my/repo/blobs/uploads/")
            .with_status(202)
            .with_header("Location", "/v2/my/repo/blobs/uploads/abc123")
            .create_async()
            .await;
        let put = server
            .mock("PUT", mockito::Matcher::Regex("/v2/my/repo/blobs/uploads/abc123.*".into()))
            .with_status(201)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        client.push_blob_bytes(&r, &digest, &bytes).await.unwrap();
        head.assert_async().await;
        post.assert_async().await;
        put.assert_async().await;
    }

    #[tokio::test]
    async fn mount_blob_reports_success_on_201() {
        let mut server = mockito::Server::new_async().await;
        let digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let m = server
            .mock("POST", "/v2/my/repo/blobs/uploads/")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("mount".into(), digest.into()),
                mockito::Matcher::UrlEncoded("from".into(), "other/repo".into()),
            ]))
            .with_status(201)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let descriptor = OciDescriptor::of(digest.to_string(), 5);
        let mounted = client.mount_blob(&r, "other/repo", &descriptor).await.unwrap();
        assert!(mounted);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn mount_blob_reports_decline_on_202() {
        let mut server = mockito::Server::new_async().await;
        let digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let m = server
            .mock("POST", "/v2/my/repo/blobs/uploads/")
            .with_status(202)
            .with_header("Location", "/v2/my/repo/blobs/uploads/abc123")
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let descriptor = OciDescriptor::of(digest.to_string(), 5);
        let mounted = client.mount_blob(&r, "other/repo", &descriptor).await.unwrap();
        assert!(!mounted);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn copy_node_mounts_blobs_across_repositories_on_the_same_registry() {
        let mut server = mockito::Server::new_async().await;
        let config_bytes = b"{}".to_vec();
        let config_digest = digest::digest_bytes(DigestAlgorithm::Sha256, &config_bytes);
        let layer_bytes = b"hello".to_vec();
        let layer_digest = digest::digest_bytes(DigestAlgorithm::Sha256, &layer_bytes);
        let manifest = OciManifest::empty()
            .with_config(OciDescriptor::of(config_digest.clone(), config_bytes.len() as i64))
            .with_layers(vec![OciDescriptor::of(layer_digest.clone(), layer_bytes.len() as i64)]);
        let manifest_bytes = manifest.to_json_bytes().unwrap();

        let host = server.url();
        let host = host.trim_start_matches("http://");
        let src_ref = ContainerRef::parse(&format!("{host}/src/repo:latest")).unwrap();
        let dst_ref = ContainerRef::parse(&format!("{host}/dst/repo:latest")).unwrap();

        let get_manifest = server
            .mock("GET", "/v2/src/repo/manifests/latest")
            .with_status(200)
            .with_header("Content-Type", IMAGE_MANIFEST_MEDIA_TYPE)
            .with_body(manifest_bytes.clone())
            .create_async()
            .await;
        let dest_head_config = server
            .mock("HEAD", format!("/v2/dst/repo/blobs/{config_digest}").as_str())
            .with_status(404)
            .create_async()
            .await;
        let mount_config = server
            .mock("POST", "/v2/dst/repo/blobs/uploads/")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("mount".into(), config_digest.clone()),
                mockito::Matcher::UrlEncoded("from".into(), "src/repo".into()),
            ]))
            .with_status(201)
            .create_async()
            .await;
        let dest_head_layer = server
            .mock("HEAD", format!("/v2/dst/repo/blobs/{layer_digest}").as_str())
            .with_status(404)
            .create_async()
            .await;
        let mount_layer = server
            .mock("POST", "/v2/dst/repo/blobs/uploads/")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("mount".into(), layer_digest.clone()),
                mockito::Matcher::UrlEncoded("from".into(), "src/repo".into()),
            ]))
            .with_status(201)
            .create_async()
            .await;
        let put_manifest = server
            .mock("PUT", "/v2/dst/repo/manifests/latest")
            .with_status(201)
            .with_header("Docker-Content-Digest", "sha256:deadbeef")
            .create_async()
            .await;

        let src_client = test_client();
        let dst_client = test_client();
        let source = CopySource::Registry(&src_client, &src_ref);
        let dest = CopyDestination::Registry(&dst_client, &dst_ref);
        copy(source, dest, false).await.unwrap();

        get_manifest.assert_async().await;
        dest_head_config.assert_async().await;
        mount_config.assert_async().await;
        dest_head_layer.assert_async().await;
        mount_layer.assert_async().await;
        put_manifest.assert_async().await;
    }

    #[tokio::test]
    async fn get_blob_verifies_digest() {
        let mut server = mockito::Server::new_async().await;
        let bytes = b"hello".to_vec();
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        let m = server
            .mock("GET", format!("/v2/my/repo/blobs/{digest}").as_str())
            .with_status(200)
            .with_body(bytes.clone())
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let descriptor = OciDescriptor::of(digest, bytes.len() as i64);
        let got = client.get_blob(&r, &descriptor).await.unwrap();
        assert_eq!(got, bytes);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn get_blob_rejects_digest_mismatch() {
        let mut server = mockito::Server::new_async().await;
        let bytes = b"hello".to_vec();
        let wrong_digest = digest::digest_bytes(DigestAlgorithm::Sha256, b"goodbye");
        let _m = server
            .mock("GET", format!("/v2/my/repo/blobs/{wrong_digest}").as_str())
            .with_status(200)
            .with_body(bytes)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let descriptor = OciDescriptor::of(wrong_digest, 5);
        let err = client.get_blob(&r, &descriptor).await.unwrap_err();
        assert!(matches!(err, OciDistributionError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn stream_blob_honors_cancellation() {
        let mut server = mockito::Server::new_async().await;
        let bytes = b"hello world".to_vec();
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        server
            .mock("GET", format!("/v2/my/repo/blobs/{digest}").as_str())
            .with_status(200)
            .with_body(bytes.clone())
            .create_async()
            .await;
        let client = test_client();
        client.cancel();
        let r = reference(&server.url());
        let descriptor = OciDescriptor::of(digest, bytes.len() as i64);
        let mut out = Vec::new();
        let err = client
            .stream_blob(&r, &descriptor, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, OciDistributionError::Cancelled));
    }

    #[tokio::test]
    async fn push_manifest_returns_descriptor() {
        let mut server = mockito::Server::new_async().await;
        let manifest = OciManifest::empty();
        let bytes = manifest.to_json_bytes().unwrap();
        let digest = digest::digest_bytes(DigestAlgorithm::Sha256, &bytes);
        let m = server
            .mock("PUT", "/v2/my/repo/manifests/latest")
            .with_status(201)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let descriptor = client.push_manifest(&r, &manifest).await.unwrap();
        assert_eq!(descriptor.digest, digest);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn get_manifest_parses_body() {
        let mut server = mockito::Server::new_async().await;
        let manifest = OciManifest::empty();
        let bytes = manifest.to_json_bytes().unwrap();
        let m = server
            .mock("GET", "/v2/my/repo/manifests/latest")
            .with_status(200)
            .with_header("Content-Type", IMAGE_MANIFEST_MEDIA_TYPE)
            .with_body(bytes)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let (got, descriptor) = client.get_manifest(&r).await.unwrap();
        assert_eq!(got.schema_version, manifest.schema_version);
        assert_eq!(descriptor.media_type, IMAGE_MANIFEST_MEDIA_TYPE);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn list_tags_parses_body() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/v2/my/repo/tags/list")
            .with_status(200)
            .with_body(r#"{"tags":["v1","v2"]}"#)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let tags = client.list_tags(&r).await.unwrap();
        assert_eq!(tags, vec!["v1".to_string(), "v2".to_string()]);
        m.assert_async().await;
    }

    #[tokio::test]
    async fn delete_manifest_treats_404_as_success() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("DELETE", "/v2/my/repo/manifests/latest")
            .with_status(404)
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        client.delete_manifest(&r).await.unwrap();
        m.assert_async().await;
    }

    #[tokio::test]
    async fn get_referrers_falls_back_to_tag_schema_on_404() {
        let mut server = mockito::Server::new_async().await;
        let digest = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let _referrers = server
            .mock("GET", format!("/v2/my/repo/referrers/{digest}").as_str())
            .with_status(404)
            .create_async()
            .await;
        let index = OciIndex::empty();
        let _fallback = server
            .mock("GET", "/v2/my/repo/manifests/sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
            .with_status(200)
            .with_header("Content-Type", IMAGE_INDEX_MEDIA_TYPE)
            .with_body(index.to_json_bytes().unwrap())
            .create_async()
            .await;
        let client = test_client();
        let r = reference(&server.url());
        let got = client.get_referrers(&r, digest, None).await.unwrap();
        assert!(got.manifests.is_empty());
    }
}
