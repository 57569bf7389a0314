//! Parsing and formatting of registry references (`ContainerRef`) and OCI image
//! layout references (`LayoutRef`).

use crate::errors::OciDistributionError;
use std::convert::TryFrom;
use std::fmt;

/// The default registry used when a reference omits one entirely.
pub const DEFAULT_REGISTRY: &str = "docker.io";
/// The default tag used when a reference gives neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// A fully-qualified reference to an artifact in a remote registry:
/// `registry/repository[:tag|@digest]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerRef {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ContainerRef {
    /// The registry host (and optional port), e.g. `registry.example.com:5000`.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path, e.g. `library/hello`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if this reference names one. Mutually exclusive with `digest()`.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if this reference names one. Mutually exclusive with `tag()`.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The tag or digest this reference resolves to on the wire (the last path
    /// segment of a `/v2/<name>/manifests/<ref>` URL).
    pub fn tag_or_digest(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Parse a reference string.
    ///
    /// Recognizes, in order: an optional `registry/` prefix (identified by the
    /// first path segment containing a `.` or `:`, or equalling `localhost`),
    /// a repository path, then either `@digest` or `:tag`. `registry` defaults
    /// to `docker.io` when omitted; `tag` defaults to `latest` when neither a
    /// tag nor a digest is given.
    pub fn parse(s: &str) -> Result<Self, OciDistributionError> {
        if s.is_empty() {
            return Err(OciDistributionError::InvalidReference(s.to_string()));
        }

        let (registry, rest) = match s.find('/') {
            Some(idx) => {
                let candidate = &s[..idx];
                if candidate.contains('.') || candidate.contains(':') || candidate == "localhost"
                {
                    (candidate.to_string(), &s[idx + 1..])
                } else {
                    (DEFAULT_REGISTRY.to_string(), s)
                }
            }
            None => (DEFAULT_REGISTRY.to_string(), s),
        };

        if rest.is_empty() {
            return Err(OciDistributionError::InvalidReference(s.to_string()));
        }

        let (repository, tag, digest) = if let Some(at) = rest.find('@') {
            let repository = &rest[..at];
            let digest = &rest[at + 1..];
            if repository.is_empty() || digest.is_empty() {
                return Err(OciDistributionError::InvalidReference(s.to_string()));
            }
            crate::digest::Digest::parse(digest)?;
            (repository.to_string(), None, Some(digest.to_string()))
        } else if let Some(colon) = rest.rfind(':') {
            let repository = &rest[..colon];
            let tag = &rest[colon + 1..];
            if repository.is_empty() || tag.is_empty() {
                return Err(OciDistributionError::InvalidReference(s.to_string()));
            }
            (repository.to_string(), Some(tag.to_string()), None)
        } else {
            (rest.to_string(), None, None)
        };

        let tag = tag.or_else(|| {
            if digest.is_none() {
                Some(DEFAULT_TAG.to_string())
            } else {
                None
            }
        });

        Ok(ContainerRef {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Render the full reference string, e.g. `docker.io/library/hello:latest`.
    pub fn whole(&self) -> String {
        match &self.digest {
            Some(d) => format!("{}/{}@{}", self.registry, self.repository, d),
            None => format!(
                "{}/{}:{}",
                self.registry,
                self.repository,
                self.tag.as_deref().unwrap_or(DEFAULT_TAG)
            ),
        }
    }

    /// The `/v2/` base URL for this reference's registry.
    pub fn to_v2_base_url(&self, protocol: &str) -> String {
        format!("{}://{}/v2/", protocol, self.registry)
    }

    /// The manifest URL: `/v2/<name>/manifests/<tag-or-digest>`.
    pub fn to_v2_manifest_url(&self, protocol: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            protocol,
            self.registry,
            self.repository,
            self.tag_or_digest()
        )
    }

    /// The blob URL: `/v2/<name>/blobs/<digest>`.
    pub fn to_v2_blob_url(&self, protocol: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            protocol, self.registry, self.repository, digest
        )
    }

    /// The upload-session-initiation URL: `/v2/<name>/blobs/uploads/`.
    pub fn to_v2_blob_upload_url(&self, protocol: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/uploads/",
            protocol, self.registry, self.repository
        )
    }

    /// The cross-repository blob mount URL.
    pub fn to_v2_blob_mount_url(&self, protocol: &str, digest: &str, from: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/uploads/?mount={}&from={}",
            protocol, self.registry, self.repository, digest, from
        )
    }

    /// The tag-listing URL: `/v2/<name>/tags/list`.
    pub fn to_v2_tags_list_url(&self, protocol: &str) -> String {
        format!(
            "{}://{}/v2/{}/tags/list",
            protocol, self.registry, self.repository
        )
    }

    /// The referrers-discovery URL: `/v2/<name>/referrers/<digest>`.
    pub fn to_v2_referrers_url(&self, protocol: &str, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/referrers/{}",
            protocol, self.registry, self.repository, digest
        )
    }

    /// A new reference pointing at the same registry/repository, but at `digest`.
    pub fn clone_with_digest(&self, digest: String) -> Self {
        ContainerRef {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    /// A new reference pointing at the same registry/repository, but at `tag`.
    pub fn clone_with_tag(&self, tag: String) -> Self {
        ContainerRef {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag),
            digest: None,
        }
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl TryFrom<&str> for ContainerRef {
    type Error = OciDistributionError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ContainerRef::parse(s)
    }
}

impl TryFrom<String> for ContainerRef {
    type Error = OciDistributionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        ContainerRef::parse(&s)
    }
}

/// A reference into a local OCI image layout directory: `folder[:tag|@digest]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutRef {
    folder: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl LayoutRef {
    /// The filesystem folder this reference names.
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// The tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if any.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Parse a layout reference. Everything before the first `:` or `@` is the
    /// folder; what follows names a tag or a digest, respectively. Neither is
    /// required: a bare folder path is a valid `LayoutRef` with no tag/digest.
    pub fn parse(s: &str) -> Result<Self, OciDistributionError> {
        if s.is_empty() {
            return Err(OciDistributionError::InvalidReference(s.to_string()));
        }

        let at = s.find('@');
        let colon = s.find(':');

        let split_idx = match (at, colon) {
            (Some(a), Some(c)) => Some(a.min(c)),
            (Some(a), None) => Some(a),
            (None, Some(c)) => Some(c),
            (None, None) => None,
        };

        match split_idx {
            None => Ok(LayoutRef {
                folder: s.to_string(),
                tag: None,
                digest: None,
            }),
            Some(idx) => {
                let folder = &s[..idx];
                let marker = s.as_bytes()[idx] as char;
                let rest = &s[idx + 1..];
                if folder.is_empty() || rest.is_empty() {
                    return Err(OciDistributionError::InvalidReference(s.to_string()));
                }
                if marker == '@' {
                    crate::digest::Digest::parse(rest)?;
                    Ok(LayoutRef {
                        folder: folder.to_string(),
                        tag: None,
                        digest: Some(rest.to_string()),
                    })
                } else {
                    Ok(LayoutRef {
                        folder: folder.to_string(),
                        tag: Some(rest.to_string()),
                        digest: None,
                    })
                }
            }
        }
    }

    /// A layout ref that names only a bare folder, with no tag or digest.
    pub fn folder_only(folder: impl Into<String>) -> Self {
        LayoutRef {
            folder: folder.into(),
            tag: None,
            digest: None,
        }
    }

    /// Whether this reference carries a tag or a digest (required by most
    /// write/read operations against a layout).
    pub fn has_tag_or_digest(&self) -> bool {
        self.tag.is_some() || self.digest.is_some()
    }
}

impl TryFrom<&str> for LayoutRef {
    type Error = OciDistributionError;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        LayoutRef::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_repository_and_tag() {
        let r = ContainerRef::parse("registry.example.com/library/hello:v1").unwrap();
        assert_eq!(r.registry(), "registry.example.com");
        assert_eq!(r.repository(), "library/hello");
        assert_eq!(r.tag(), Some("v1"));
        assert_eq!(r.digest(), None);
    }

    #[test]
    fn parses_localhost_as_registry() {
        let r = ContainerRef::parse("localhost/hello:v1").unwrap();
        assert_eq!(r.registry(), "localhost");
        assert_eq!(r.repository(), "hello");
    }

    #[test]
    fn parses_localhost_with_port() {
        let r = ContainerRef::parse("localhost:5000/hello:v1").unwrap();
        assert_eq!(r.registry(), "localhost:5000");
        assert_eq!(r.repository(), "hello");
        assert_eq!(r.tag(), Some("v1"));
    }

    #[test]
    fn defaults_registry_when_absent() {
        let r = ContainerRef::parse("library/hello:v1").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "library/hello");
    }

    #[test]
    fn single_segment_defaults_registry_and_tag() {
        let r = ContainerRef::parse("hello").unwrap();
        assert_eq!(r.registry(), DEFAULT_REGISTRY);
        assert_eq!(r.repository(), "hello");
        assert_eq!(r.tag(), Some(DEFAULT_TAG));
    }

    #[test]
    fn defaults_tag_to_latest() {
        let r = ContainerRef::parse("registry.example.com/hello").unwrap();
        assert_eq!(r.tag(), Some("latest"));
    }

    #[test]
    fn parses_digest_reference() {
        let r = ContainerRef::parse(
            "registry.example.com/hello@sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap();
        assert_eq!(r.tag(), None);
        assert_eq!(
            r.digest(),
            Some("sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn rejects_malformed_digest_reference() {
        ContainerRef::parse("registry.example.com/hello@not-a-digest")
            .expect_err("malformed digest must fail");
    }

    #[test]
    fn builds_v2_manifest_url() {
        let r = ContainerRef::parse("registry.example.com/library/hello:v1").unwrap();
        assert_eq!(
            r.to_v2_manifest_url("https"),
            "https://registry.example.com/v2/library/hello/manifests/v1"
        );
    }

    #[test]
    fn layout_ref_parses_tag_and_digest() {
        let r = LayoutRef::parse("/tmp/layout:v1").unwrap();
        assert_eq!(r.folder(), "/tmp/layout");
        assert_eq!(r.tag(), Some("v1"));

        let r = LayoutRef::parse(
            "/tmp/layout@sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap();
        assert_eq!(r.folder(), "/tmp/layout");
        assert_eq!(
            r.digest(),
            Some("sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn layout_ref_without_tag_or_digest() {
        let r = LayoutRef::parse("/tmp/layout").unwrap();
        assert!(!r.has_tag_or_digest());
    }
}
