//! The bearer-token cache and `WWW-Authenticate` challenge parser used to
//! drive the 401/403 challenge-and-retry flow in the HTTP engine.
use crate::reference::ContainerRef;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

/// A token granted during the bearer-token exchange for OCI registries.
///
/// Registries are inconsistent about whether the field is named `token` or
/// `access_token`; both are accepted.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub(crate) enum RegistryToken {
    Token {
        token: String,
        #[serde(default)]
        expires_in: Option<u64>,
        #[serde(default)]
        issued_at: Option<String>,
    },
    AccessToken {
        access_token: String,
        #[serde(default)]
        expires_in: Option<u64>,
        #[serde(default)]
        issued_at: Option<String>,
    },
}

impl RegistryToken {
    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.token())
    }

    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token, .. } => token,
            RegistryToken::AccessToken { access_token, .. } => access_token,
        }
    }
}

#[derive(Clone)]
pub(crate) enum RegistryTokenType {
    Bearer(RegistryToken),
    Basic(String, String),
}

/// Desired operation for registry authentication.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum RegistryOperation {
    /// Authenticate for push operations.
    Push,
    /// Authenticate for pull operations.
    Pull,
    /// Authenticate for delete operations.
    Delete,
}

impl RegistryOperation {
    /// The scope action string this operation requests from a bearer-token exchange.
    pub fn as_scope_action(self) -> &'static str {
        match self {
            RegistryOperation::Pull => "pull",
            RegistryOperation::Push => "push",
            RegistryOperation::Delete => "delete",
        }
    }
}

/// A single-flight cache of bearer/basic tokens keyed by `(registry,
/// repository, operation)`. Guarded by a `tokio::sync::Mutex` so concurrent
/// requests to the same reference share one refresh rather than racing.
#[derive(Default)]
pub(crate) struct TokenCache {
    tokens: tokio::sync::Mutex<BTreeMap<(String, String, RegistryOperation), RegistryTokenType>>,
}

impl TokenCache {
    pub(crate) fn new() -> Self {
        TokenCache {
            tokens: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn key(reference: &ContainerRef, op: RegistryOperation) -> (String, String, RegistryOperation) {
        (
            reference.registry().to_string(),
            reference.repository().to_string(),
            op,
        )
    }

    pub(crate) async fn insert(
        &self,
        reference: &ContainerRef,
        op: RegistryOperation,
        token: RegistryTokenType,
    ) {
        let mut tokens = self.tokens.lock().await;
        tokens.insert(Self::key(reference, op), token);
    }

    pub(crate) async fn get(
        &self,
        reference: &ContainerRef,
        op: RegistryOperation,
    ) -> Option<RegistryTokenType> {
        let tokens = self.tokens.lock().await;
        tokens.get(&Self::key(reference, op)).cloned()
    }

    pub(crate) async fn contains_key(&self, reference: &ContainerRef, op: RegistryOperation) -> bool {
        let tokens = self.tokens.lock().await;
        tokens.contains_key(&Self::key(reference, op))
    }
}

impl Clone for RegistryTokenType {
    fn clone(&self) -> Self {
        match self {
            RegistryTokenType::Bearer(t) => RegistryTokenType::Bearer(t.clone()),
            RegistryTokenType::Basic(u, p) => RegistryTokenType::Basic(u.clone(), p.clone()),
        }
    }
}

lazy_static! {
    static ref BEARER_CHALLENGE_RE: Regex = Regex::new(
        concat!(
            r#"^Bearer\s+realm="(?P<realm>[^"]*)""#,
            r#"(?:\s*,\s*service="(?P<service>[^"]*)")?"#,
            r#"(?:\s*,\s*scope="(?P<scope>[^"]*)")?"#,
            r#"(?:\s*,\s*error="(?P<error>[^"]*)")?"#,
        )
    )
    .expect("valid bearer challenge regex");
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The token endpoint to GET.
    pub realm: String,
    /// The `service` the token is scoped to, if present.
    pub service: Option<String>,
    /// The `scope` the server is requesting, if present.
    pub scope: Option<String>,
    /// The `error` code the server reported, if this is a re-challenge.
    pub error: Option<String>,
}

/// Parse a `WWW-Authenticate` header value as a bearer challenge.
///
/// Returns `None` for non-bearer schemes or a header that doesn't match the
/// expected shape.
pub fn parse_www_authenticate(header: &str) -> Option<BearerChallenge> {
    let caps = BEARER_CHALLENGE_RE.captures(header.trim())?;
    Some(BearerChallenge {
        realm: caps.name("realm")?.as_str().to_string(),
        service: caps.name("service").map(|m| m.as_str().to_string()),
        scope: caps.name("scope").map(|m| m.as_str().to_string()),
        error: caps.name("error").map(|m| m.as_str().to_string()),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_full_challenge() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo/bar:pull""#;
        let challenge = parse_www_authenticate(header).expect("parsed");
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:foo/bar:pull"));
        assert_eq!(challenge.error, None);
    }

    #[test]
    fn parses_challenge_with_error() {
        let header = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:foo/bar:pull",error="insufficient_scope""#;
        let challenge = parse_www_authenticate(header).expect("parsed");
        assert_eq!(challenge.error.as_deref(), Some("insufficient_scope"));
    }

    #[test]
    fn parses_challenge_with_realm_only() {
        let header = r#"Bearer realm="https://auth.example.com/token""#;
        let challenge = parse_www_authenticate(header).expect("parsed");
        assert_eq!(challenge.service, None);
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        assert_eq!(parse_www_authenticate(r#"Basic realm="x""#), None);
    }

    #[test]
    fn deserializes_token_field_variant() {
        let t: RegistryToken = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(t.token(), "abc");
        assert_eq!(t.bearer_token(), "Bearer abc");
    }

    #[test]
    fn deserializes_access_token_field_variant() {
        let t: RegistryToken = serde_json::from_str(r#"{"access_token":"xyz"}"#).unwrap();
        assert_eq!(t.token(), "xyz");
    }

    #[tokio::test]
    async fn cache_round_trips_bearer_token() {
        let cache = TokenCache::new();
        let r = ContainerRef::parse("example.com/ns/app:v1").unwrap();
        assert!(!cache.contains_key(&r, RegistryOperation::Pull).await);
        let token: RegistryToken = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        cache
            .insert(&r, RegistryOperation::Pull, RegistryTokenType::Bearer(token))
            .await;
        assert!(cache.contains_key(&r, RegistryOperation::Pull).await);
        assert!(!cache.contains_key(&r, RegistryOperation::Push).await);
        match cache.get(&r, RegistryOperation::Pull).await {
            Some(RegistryTokenType::Bearer(t)) => assert_eq!(t.token(), "abc"),
            _ => panic!("expected bearer token"),
        }
    }
}
