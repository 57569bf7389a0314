//! Errors related to interacting with an OCI compliant remote store or local layout.

/// The OCI specification defines a specific error format.
///
/// This struct represents that error format, which is formally described here:
/// https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug)]
pub struct OciError {
    /// The error code
    pub code: OciErrorCode,
    /// An optional message associated with the error
    #[serde(default)]
    pub message: String,
    /// Unstructured optional data associated with the error
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl std::fmt::Display for OciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OCI API error: {}", self.message.as_str())
    }
}

#[derive(serde::Deserialize)]
pub(crate) struct OciEnvelope {
    pub(crate) errors: Vec<OciError>,
}

/// OCI error codes
///
/// Outlined here: https://github.com/opencontainers/distribution-spec/blob/master/spec.md#errors-2
#[derive(serde::Deserialize, Debug, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    /// Blob unknown to registry
    BlobUnknown,
    /// Blob upload is invalid
    BlobUploadInvalid,
    /// Blob upload is unknown to registry
    BlobUploadUnknown,
    /// Provided digest did not match uploaded content.
    DigestInvalid,
    /// Blob is unknown to registry
    ManifestBlobUnknown,
    /// Manifest is invalid
    ManifestInvalid,
    /// Manifest unknown
    ManifestUnknown,
    /// Manifest failed signature validation (deprecated)
    ManifestUnverified,
    /// Invalid repository name
    NameInvalid,
    /// Repository name is not known
    NameUnknown,
    /// Provided length did not match content length
    SizeInvalid,
    /// Manifest tag did not match URI (deprecated)
    TagInvalid,
    /// Authentication required.
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// This operation is unsupported
    Unsupported,
    /// Too many requests from client
    Toomanyrequests,
}

/// The single error family surfaced by this crate.
///
/// Each variant names a distinct failure mode callers are expected to branch on;
/// the source is preserved where the failure originated in another crate.
#[derive(thiserror::Error, Debug)]
pub enum OciDistributionError {
    /// A `ContainerRef` or `LayoutRef` string could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A digest string did not match `alg:hex` or named an unsupported algorithm.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A credential file entry was malformed (bad base64, missing fields, ...).
    #[error("malformed credential: {0}")]
    BadCredentialFormat(String),

    /// The server rejected the request as unauthenticated even after a token refresh.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server rejected the request as forbidden even after a token refresh.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The requested blob, manifest, or tag does not exist.
    #[error("{kind} not found: {reference}")]
    NotFound {
        /// What kind of resource was missing.
        kind: NotFoundKind,
        /// The reference or digest that was looked up.
        reference: String,
    },

    /// A conflict the caller must resolve (not raised for idempotent push-exists cases).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The remote server's response did not conform to the distribution spec.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Bytes received did not hash to the digest they were expected to match.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest that was expected.
        expected: String,
        /// The digest actually computed over the received bytes.
        actual: String,
    },

    /// An underlying network or filesystem operation failed.
    #[error("I/O failure: {0}")]
    IOFailure(#[source] anyhow::Error),

    /// A credential helper subprocess exited non-zero or could not be spawned.
    #[error("credential helper {helper} failed: {message}")]
    CredentialHelperFailed {
        /// The helper binary name (without the `docker-credential-` prefix).
        helper: String,
        /// A human-readable description of the failure.
        message: String,
    },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not complete within its configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The requested algorithm, media type, or operation is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The layout root exists but is not a directory.
    #[error("layout path is not a directory: {0}")]
    LayoutNotADirectory(String),

    /// A layout operation that requires a tag or digest was given neither.
    #[error("a tag or digest is required for this operation")]
    TagRequired,
}

/// Distinguishes what kind of resource a `NotFound` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    /// A content blob (layer or config).
    Blob,
    /// A manifest or index.
    Manifest,
    /// A tag name.
    Tag,
}

impl std::fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotFoundKind::Blob => "blob",
            NotFoundKind::Manifest => "manifest",
            NotFoundKind::Tag => "tag",
        };
        write!(f, "{}", s)
    }
}

impl From<std::io::Error> for OciDistributionError {
    fn from(e: std::io::Error) -> Self {
        OciDistributionError::IOFailure(e.into())
    }
}

impl From<reqwest::Error> for OciDistributionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OciDistributionError::Timeout
        } else {
            OciDistributionError::IOFailure(e.into())
        }
    }
}

impl From<serde_json::Error> for OciDistributionError {
    fn from(e: serde_json::Error) -> Self {
        OciDistributionError::ProtocolError(e.to_string())
    }
}

impl From<toml::de::Error> for OciDistributionError {
    fn from(e: toml::de::Error) -> Self {
        OciDistributionError::ProtocolError(format!("invalid registries.conf: {}", e))
    }
}
