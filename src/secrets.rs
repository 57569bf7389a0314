//! Types for working with registry access secrets: basic credentials, the
//! layered Docker/Podman credential store, and the auth-provider strategy
//! consumed by the HTTP engine.
use crate::errors::OciDistributionError;
use crate::reference::ContainerRef;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::warn;

/// A method for authenticating to a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryAuth {
    /// Access the registry anonymously.
    Anonymous,
    /// Access the registry with a username/password pair.
    Basic(String, String),
}

impl RegistryAuth {
    /// Render as the value of an HTTP `Authorization: Basic` header, if applicable.
    pub fn basic_header_value(&self) -> Option<String> {
        match self {
            RegistryAuth::Anonymous => None,
            RegistryAuth::Basic(user, pass) => {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
                Some(format!("Basic {encoded}"))
            }
        }
    }
}

pub(crate) trait Authenticable {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self;
}

impl Authenticable for reqwest::RequestBuilder {
    fn apply_authentication(self, auth: &RegistryAuth) -> Self {
        match auth.basic_header_value() {
            Some(header) => self.header(reqwest::header::AUTHORIZATION, header),
            None => self,
        }
    }
}

/// The authentication scheme a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// No authentication is attempted.
    None,
    /// HTTP Basic authentication.
    Basic,
    /// OAuth2-style bearer token authentication.
    Bearer,
}

/// A single `auths` entry in a Docker- or Podman-style credential file.
#[derive(Debug, Clone, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

/// A layered credential store: reads Docker's `config.json` and Podman's
/// `auth.json`, merging their `auths`/`credHelpers` maps. On a key collision
/// between the two files, the Podman entry wins, since it is read second.
#[derive(Debug, Default)]
pub struct CredentialStore {
    auths: HashMap<String, String>,
    cred_helpers: HashMap<String, String>,
    creds_store: Option<String>,
}

impl CredentialStore {
    /// Load from the conventional Docker and Podman locations, in that order
    /// (Podman's entries win ties). Missing files are treated as empty, not
    /// an error.
    pub fn load() -> Result<Self, OciDistributionError> {
        let mut store = CredentialStore::default();
        if let Some(path) = docker_config_path() {
            store.merge_file(&path)?;
        }
        if let Some(path) = podman_auth_path() {
            store.merge_file(&path)?;
        }
        Ok(store)
    }

    /// Load from an explicit list of files, applied in order (later files win).
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<Self, OciDistributionError> {
        let mut store = CredentialStore::default();
        for path in paths {
            store.merge_file(path)?;
        }
        Ok(store)
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), OciDistributionError> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let parsed: DockerConfigFile = serde_json::from_slice(&bytes)?;
        for (host, entry) in parsed.auths {
            if let Some(auth) = entry.auth {
                self.auths.insert(host, auth);
            }
        }
        for (host, helper) in parsed.cred_helpers {
            self.cred_helpers.insert(host, helper);
        }
        if let Some(store) = parsed.creds_store {
            self.creds_store = Some(store);
        }
        Ok(())
    }

    /// Resolve credentials for `reference`, trying progressively less
    /// specific keys: `registry/full-repository`, then `registry` with one
    /// path segment stripped at a time, then the registry-scoped credential
    /// helper, then the all-registries helper.
    pub fn lookup(
        &self,
        reference: &ContainerRef,
    ) -> Result<Option<RegistryAuth>, OciDistributionError> {
        for key in lookup_keys(reference) {
            if let Some(encoded) = self.auths.get(&key) {
                return Ok(Some(decode_basic_auth(encoded)?));
            }
        }
        if let Some(helper) = self.cred_helpers.get(reference.registry()) {
            return match invoke_credential_helper(helper, reference.registry()) {
                Ok(auth) => Ok(Some(auth)),
                Err(e) => {
                    warn!("credential helper {} failed, falling back: {}", helper, e);
                    self.fallback_to_creds_store(reference.registry())
                }
            };
        }
        if let Some(helper) = &self.creds_store {
            return invoke_credential_helper(helper, reference.registry()).map(Some);
        }
        Ok(None)
    }

    fn fallback_to_creds_store(
        &self,
        registry: &str,
    ) -> Result<Option<RegistryAuth>, OciDistributionError> {
        match &self.creds_store {
            Some(helper) => invoke_credential_helper(helper, registry).map(Some),
            None => Ok(None),
        }
    }
}

/// Build the most-specific-first sequence of lookup keys for a reference:
/// `registry/a/b`, `registry/a`, `registry`.
fn lookup_keys(reference: &ContainerRef) -> Vec<String> {
    let mut keys = vec![];
    let segments: Vec<&str> = reference.repository().split('/').collect();
    for n in (0..=segments.len()).rev() {
        if n == 0 {
            keys.push(reference.registry().to_string());
        } else {
            keys.push(format!(
                "{}/{}",
                reference.registry(),
                segments[..n].join("/")
            ));
        }
    }
    keys
}

fn decode_basic_auth(encoded: &str) -> Result<RegistryAuth, OciDistributionError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| OciDistributionError::BadCredentialFormat(e.to_string()))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| OciDistributionError::BadCredentialFormat(e.to_string()))?;
    let (user, pass) = text
        .split_once(':')
        .ok_or_else(|| OciDistributionError::BadCredentialFormat("missing ':' in auth".into()))?;
    Ok(RegistryAuth::Basic(user.to_string(), pass.to_string()))
}

/// The JSON object a `docker-credential-<helper> get` subprocess prints on stdout.
#[derive(Deserialize)]
struct CredentialHelperOutput {
    #[serde(rename = "ServerURL")]
    #[allow(dead_code)]
    server_url: String,
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

/// Invoke `docker-credential-<name> get`, writing `server` to its stdin and
/// parsing `{ServerURL, Username, Secret}` from its stdout. A non-zero exit
/// yields `CredentialHelperFailed`; the caller is expected to treat this as a
/// fallback failure, not fatal.
fn invoke_credential_helper(name: &str, server: &str) -> Result<RegistryAuth, OciDistributionError> {
    let program = format!("docker-credential-{name}");
    let mut child = Command::new(&program)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OciDistributionError::CredentialHelperFailed {
            helper: name.to_string(),
            message: e.to_string(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(server.as_bytes());
    }

    let output = child
        .wait_with_output()
        .map_err(|e| OciDistributionError::CredentialHelperFailed {
            helper: name.to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(OciDistributionError::CredentialHelperFailed {
            helper: name.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let parsed: CredentialHelperOutput =
        serde_json::from_slice(&output.stdout).map_err(|e| {
            OciDistributionError::CredentialHelperFailed {
                helper: name.to_string(),
                message: format!("malformed helper output: {e}"),
            }
        })?;
    Ok(RegistryAuth::Basic(parsed.username, parsed.secret))
}

fn docker_config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }
    dirs_home().map(|h| h.join(".docker").join("config.json"))
}

fn podman_auth_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("REGISTRY_AUTH_FILE") {
        return Some(PathBuf::from(path));
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return Some(
            PathBuf::from(runtime_dir)
                .join("containers")
                .join("auth.json"),
        );
    }
    dirs_home().map(|h| h.join(".config").join("containers").join("auth.json"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// The authentication strategy used for a single request: resolves to an
/// `Authorization` header value, or `None` if anonymous.
#[derive(Clone)]
pub enum AuthProvider {
    /// No credentials are sent.
    None,
    /// A fixed username/password pair, sent as HTTP Basic.
    Basic {
        /// The username.
        username: String,
        /// The password.
        password: String,
    },
    /// A username/password pair read from environment variables at header time.
    Env {
        /// The environment variable holding the username.
        username_var: String,
        /// The environment variable holding the password.
        password_var: String,
    },
    /// Credentials resolved from a loaded `CredentialStore`.
    Store(Arc<CredentialStore>),
    /// A bearer token refreshed out-of-band and cached here.
    Bearer(Arc<tokio::sync::Mutex<Option<String>>>),
}

impl AuthProvider {
    /// The default environment-backed provider, reading credentials from
    /// `OCI_USERNAME` and `OCI_PASSWORD`.
    pub fn from_env() -> Self {
        AuthProvider::Env {
            username_var: "OCI_USERNAME".to_string(),
            password_var: "OCI_PASSWORD".to_string(),
        }
    }

    /// The scheme this provider speaks.
    pub fn scheme(&self) -> AuthScheme {
        match self {
            AuthProvider::None => AuthScheme::None,
            AuthProvider::Basic { .. } | AuthProvider::Env { .. } | AuthProvider::Store(_) => {
                AuthScheme::Basic
            }
            AuthProvider::Bearer(_) => AuthScheme::Bearer,
        }
    }

    /// Compute the `Authorization` header value for `reference`, if any.
    pub async fn auth_header(
        &self,
        reference: &ContainerRef,
    ) -> Result<Option<String>, OciDistributionError> {
        match self {
            AuthProvider::None => Ok(None),
            AuthProvider::Basic { username, password } => {
                Ok(RegistryAuth::Basic(username.clone(), password.clone()).basic_header_value())
            }
            AuthProvider::Env {
                username_var,
                password_var,
            } => {
                let username = std::env::var(username_var).ok();
                let password = std::env::var(password_var).ok();
                Ok(match (username, password) {
                    (Some(u), Some(p)) => RegistryAuth::Basic(u, p).basic_header_value(),
                    _ => None,
                })
            }
            AuthProvider::Store(store) => Ok(store
                .lookup(reference)?
                .and_then(|auth| auth.basic_header_value())),
            AuthProvider::Bearer(token) => {
                let guard = token.lock().await;
                Ok(guard.as_ref().map(|t| format!("Bearer {t}")))
            }
        }
    }

    /// Overwrite the cached bearer token. A no-op for non-bearer providers.
    pub async fn set_bearer_token(&self, token: String) {
        if let AuthProvider::Bearer(slot) = self {
            *slot.lock().await = Some(token);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_header_is_base64_user_colon_pass() {
        let auth = RegistryAuth::Basic("alice".into(), "hunter2".into());
        let header = auth.basic_header_value().expect("header");
        assert!(header.starts_with("Basic "));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header.trim_start_matches("Basic "))
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "alice:hunter2");
    }

    #[test]
    fn anonymous_has_no_header() {
        assert_eq!(RegistryAuth::Anonymous.basic_header_value(), None);
    }

    #[test]
    fn lookup_keys_are_most_specific_first() {
        let r = ContainerRef::parse("example.com/ns/app:v1").unwrap();
        let keys = lookup_keys(&r);
        assert_eq!(
            keys,
            vec![
                "example.com/ns/app".to_string(),
                "example.com/ns".to_string(),
                "example.com".to_string(),
            ]
        );
    }

    #[test]
    fn merges_docker_and_podman_with_podman_winning() {
        let dir = tempfile::tempdir().unwrap();
        let docker_path = dir.path().join("docker-config.json");
        let podman_path = dir.path().join("podman-auth.json");
        std::fs::write(
            &docker_path,
            r#"{"auths":{"example.com":{"auth":"ZG9ja2VyOnBhc3M="}}}"#,
        )
        .unwrap();
        std::fs::write(
            &podman_path,
            r#"{"auths":{"example.com":{"auth":"cG9kbWFuOnBhc3M="}}}"#,
        )
        .unwrap();
        let store = CredentialStore::load_from_paths(&[docker_path, podman_path]).unwrap();
        let r = ContainerRef::parse("example.com/app:v1").unwrap();
        let auth = store.lookup(&r).unwrap().unwrap();
        assert_eq!(auth, RegistryAuth::Basic("podman".into(), "pass".into()));
    }

    #[test]
    fn missing_files_are_treated_as_empty() {
        let store =
            CredentialStore::load_from_paths(&[PathBuf::from("/nonexistent/config.json")])
                .unwrap();
        let r = ContainerRef::parse("example.com/app:v1").unwrap();
        assert_eq!(store.lookup(&r).unwrap(), None);
    }

    #[tokio::test]
    async fn bearer_provider_returns_none_before_token_is_set() {
        let provider = AuthProvider::Bearer(Arc::new(tokio::sync::Mutex::new(None)));
        let r = ContainerRef::parse("example.com/app:v1").unwrap();
        assert_eq!(provider.auth_header(&r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bearer_provider_returns_header_after_refresh() {
        let provider = AuthProvider::Bearer(Arc::new(tokio::sync::Mutex::new(None)));
        provider.set_bearer_token("abc123".into()).await;
        let r = ContainerRef::parse("example.com/app:v1").unwrap();
        assert_eq!(
            provider.auth_header(&r).await.unwrap(),
            Some("Bearer abc123".to_string())
        );
    }

    #[tokio::test]
    async fn from_env_reads_oci_username_and_password() {
        match AuthProvider::from_env() {
            AuthProvider::Env {
                username_var,
                password_var,
            } => {
                assert_eq!(username_var, "OCI_USERNAME");
                assert_eq!(password_var, "OCI_PASSWORD");
            }
            _ => panic!("expected AuthProvider::Env"),
        }

        std::env::set_var("OCI_USERNAME", "alice");
        std::env::set_var("OCI_PASSWORD", "hunter2");
        let provider = AuthProvider::from_env();
        let r = ContainerRef::parse("example.com/app:v1").unwrap();
        assert_eq!(
            provider.auth_header(&r).await.unwrap(),
            RegistryAuth::Basic("alice".to_string(), "hunter2".to_string()).basic_header_value()
        );
        std::env::remove_var("OCI_USERNAME");
        std::env::remove_var("OCI_PASSWORD");
    }
}
