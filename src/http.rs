//! The HTTP engine: method dispatch, redirect policy, TLS policy, and the
//! 401/403 challenge-driven bearer-token exchange shared by every registry
//! operation in [`crate::client`].
use crate::errors::OciDistributionError;
use crate::reference::ContainerRef;
use crate::scope;
use crate::secrets::AuthProvider;
use crate::token_cache::{parse_www_authenticate, RegistryOperation, RegistryToken, RegistryTokenType, TokenCache};
use reqwest::{header, Method, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The key `TokenCache` indexes refreshed tokens by: `(registry, repository, operation)`.
type RefreshKey = (String, String, RegistryOperation);

/// The transport scheme used to talk to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    /// Plaintext HTTP, for local/insecure registries.
    Http,
    /// TLS-protected HTTPS. The default.
    Https,
}

impl Default for ClientProtocol {
    fn default() -> Self {
        ClientProtocol::Https
    }
}

impl ClientProtocol {
    /// The URL scheme string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientProtocol::Http => "http",
            ClientProtocol::Https => "https",
        }
    }
}

/// Configuration for an [`HttpEngine`] (and the [`crate::client::Client`] built on top of it).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Which scheme to use for registry URLs.
    pub protocol: ClientProtocol,
    /// Skip TLS certificate verification. Dangerous; intended for local testing.
    pub skip_tls_verify: bool,
    /// The request timeout applied to connect + transfer.
    pub timeout: Duration,
    /// The `User-Agent` header value sent with every request.
    pub user_agent: String,
    /// The maximum number of redirects a single call will follow.
    pub max_redirects: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            protocol: ClientProtocol::default(),
            skip_tls_verify: false,
            timeout: Duration::from_secs(60),
            user_agent: concat!("oci-distribution/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 10,
        }
    }
}

const OCI_ACCEPT_HEADER: &str = "application/vnd.oci.image.manifest.v1+json,application/vnd.oci.image.index.v1+json,application/vnd.docker.distribution.manifest.v2+json,application/vnd.docker.distribution.manifest.list.v2+json";

/// Drives requests against a single registry host, handling redirects and
/// challenge-driven bearer-token refresh transparently.
pub struct HttpEngine {
    client: reqwest::Client,
    config: ClientConfig,
    tokens: TokenCache,
    cancellation: CancellationToken,
    /// Per-`(registry, repository, operation)` guards ensuring only one
    /// refresh is in flight at a time; concurrent callers for the same key
    /// wait on the same guard and then observe the token it fetched instead
    /// of each issuing their own challenge GET.
    refresh_guards: tokio::sync::Mutex<HashMap<RefreshKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl HttpEngine {
    /// Build a new engine from `config`.
    pub fn new(config: ClientConfig) -> Result<Self, OciDistributionError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.skip_tls_verify)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| OciDistributionError::IOFailure(e.into()))?;
        Ok(HttpEngine {
            client,
            config,
            tokens: TokenCache::new(),
            cancellation: CancellationToken::new(),
            refresh_guards: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// A clone of this engine's cancellation token. Calling `.cancel()` on any
    /// clone aborts every in-flight and future call to [`HttpEngine::execute`]
    /// on this engine, surfacing [`OciDistributionError::Cancelled`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Abort every in-flight and future call to [`HttpEngine::execute`] on
    /// this engine.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether [`HttpEngine::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    fn scheme(&self) -> &'static str {
        self.config.protocol.as_str()
    }

    /// The `/v2/` base URL for `reference`'s registry.
    pub fn base_url(&self, reference: &ContainerRef) -> String {
        reference.to_v2_base_url(self.scheme())
    }

    /// Execute a single logical call, transparently handling redirects and a
    /// single 401/403 challenge-and-retry cycle. `body` is resent verbatim on
    /// both redirect and retry, per the spec's non-downgrading redirect policy.
    pub async fn execute(
        &self,
        reference: &ContainerRef,
        method: Method,
        url: &str,
        extra_headers: Vec<(header::HeaderName, String)>,
        body: Option<Vec<u8>>,
        auth: &AuthProvider,
    ) -> Result<Response, OciDistributionError> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(OciDistributionError::Cancelled),
            result = self.execute_uncancellable(reference, method, url, extra_headers, body, auth) => result,
        }
    }

    async fn execute_uncancellable(
        &self,
        reference: &ContainerRef,
        method: Method,
        url: &str,
        extra_headers: Vec<(header::HeaderName, String)>,
        body: Option<Vec<u8>>,
        auth: &AuthProvider,
    ) -> Result<Response, OciDistributionError> {
        let op = operation_for(&method);
        debug!("{} {}", method, url);
        let current_url = url.to_string();
        let mut current_method = method.clone();

        let response = self
            .send_once(reference, op, &current_method, &current_url, &extra_headers, body.as_deref(), auth)
            .await?;
        let response = self
            .follow_redirects(reference, op, current_method.clone(), response, &extra_headers, body.as_deref(), auth)
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN {
            debug!("{} challenged the request, attempting a token refresh", reference.registry());
            if let Some(token) = self.refresh_token_single_flight(reference, op, &response, auth).await? {
                current_method = method;
                let retried = self
                    .send_with_bearer(&current_method, &current_url, &extra_headers, body.as_deref(), &token)
                    .await?;
                let retried = self
                    .follow_redirects_bearer(&current_method, retried, &extra_headers, body.as_deref(), &token)
                    .await?;
                return Ok(retried);
            }
        }

        Ok(response)
    }

    async fn send_once(
        &self,
        reference: &ContainerRef,
        op: RegistryOperation,
        method: &Method,
        url: &str,
        extra_headers: &[(header::HeaderName, String)],
        body: Option<&[u8]>,
        auth: &AuthProvider,
    ) -> Result<Response, OciDistributionError> {
        let mut builder = self.client.request(method.clone(), url);
        builder = builder.header(header::ACCEPT, OCI_ACCEPT_HEADER);
        for (name, value) in extra_headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(b) = body {
            builder = builder.body(b.to_vec());
        }

        if let Some(RegistryTokenType::Bearer(token)) = self.tokens.get(reference, op).await {
            builder = builder.header(header::AUTHORIZATION, token.bearer_token());
        } else if auth.scheme() != crate::secrets::AuthScheme::None {
            if let Some(header_value) = auth.auth_header(reference).await? {
                builder = builder.header(header::AUTHORIZATION, header_value);
            }
        }

        builder.send().await.map_err(OciDistributionError::from)
    }

    async fn send_with_bearer(
        &self,
        method: &Method,
        url: &str,
        extra_headers: &[(header::HeaderName, String)],
        body: Option<&[u8]>,
        token: &RegistryToken,
    ) -> Result<Response, OciDistributionError> {
        let mut builder = self.client.request(method.clone(), url);
        builder = builder.header(header::ACCEPT, OCI_ACCEPT_HEADER);
        for (name, value) in extra_headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(b) = body {
            builder = builder.body(b.to_vec());
        }
        builder = builder.header(header::AUTHORIZATION, token.bearer_token());
        builder.send().await.map_err(OciDistributionError::from)
    }

    async fn follow_redirects(
        &self,
        reference: &ContainerRef,
        op: RegistryOperation,
        method: Method,
        mut response: Response,
        extra_headers: &[(header::HeaderName, String)],
        body: Option<&[u8]>,
        auth: &AuthProvider,
    ) -> Result<Response, OciDistributionError> {
        let mut hops = 0u8;
        while matches!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
        ) {
            hops += 1;
            if hops > self.config.max_redirects {
                return Err(OciDistributionError::ProtocolError(
                    "too many redirects".to_string(),
                ));
            }
            let location = response
                .headers()
                .get(header::LOCATION)
                .ok_or_else(|| OciDistributionError::ProtocolError("redirect without Location".into()))?
                .to_str()
                .map_err(|e| OciDistributionError::ProtocolError(e.to_string()))?
                .to_string();
            response = self
                .send_once(reference, op, &method, &location, extra_headers, body, auth)
                .await?;
        }
        Ok(response)
    }

    async fn follow_redirects_bearer(
        &self,
        method: &Method,
        mut response: Response,
        extra_headers: &[(header::HeaderName, String)],
        body: Option<&[u8]>,
        token: &RegistryToken,
    ) -> Result<Response, OciDistributionError> {
        let mut hops = 0u8;
        while matches!(
            response.status(),
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
        ) {
            hops += 1;
            if hops > self.config.max_redirects {
                return Err(OciDistributionError::ProtocolError(
                    "too many redirects".to_string(),
                ));
            }
            let location = response
                .headers()
                .get(header::LOCATION)
                .ok_or_else(|| OciDistributionError::ProtocolError("redirect without Location".into()))?
                .to_str()
                .map_err(|e| OciDistributionError::ProtocolError(e.to_string()))?
                .to_string();
            response = self
                .send_with_bearer(method, &location, extra_headers, body, token)
                .await?;
        }
        Ok(response)
    }

    /// Serializes concurrent refreshes for the same `(registry, repository,
    /// operation)` key: the first caller performs the challenge GET and
    /// populates the token cache; callers that arrive while a refresh is
    /// already in flight wait on the same guard and then reuse the token it
    /// fetched instead of issuing their own.
    async fn refresh_token_single_flight(
        &self,
        reference: &ContainerRef,
        op: RegistryOperation,
        response: &Response,
        auth: &AuthProvider,
    ) -> Result<Option<RegistryToken>, OciDistributionError> {
        if let Some(RegistryTokenType::Bearer(token)) = self.tokens.get(reference, op).await {
            return Ok(Some(token));
        }

        let key = TokenCache::key(reference, op);
        let guard = {
            let mut guards = self.refresh_guards.lock().await;
            guards.entry(key).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
        };
        let _permit = guard.lock().await;

        // Re-check now that we hold the per-key guard: another caller may
        // have completed a refresh while we were waiting for it.
        if let Some(RegistryTokenType::Bearer(token)) = self.tokens.get(reference, op).await {
            return Ok(Some(token));
        }

        let token = self.refresh_token(reference, op, response, auth).await?;
        if let Some(token) = &token {
            self.tokens
                .insert(reference, op, RegistryTokenType::Bearer(token.clone()))
                .await;
        }
        Ok(token)
    }

    /// Parse the `WWW-Authenticate` header off `response` and perform the
    /// bearer-token exchange GET, returning the refreshed token. Returns
    /// `Ok(None)` if the header is absent or not a bearer challenge (the
    /// caller should then surface `Unauthorized`/`Forbidden` as-is).
    async fn refresh_token(
        &self,
        reference: &ContainerRef,
        op: RegistryOperation,
        response: &Response,
        auth: &AuthProvider,
    ) -> Result<Option<RegistryToken>, OciDistributionError> {
        let header_value = match response.headers().get(header::WWW_AUTHENTICATE) {
            Some(h) => h.to_str().unwrap_or_default().to_string(),
            None => return Ok(None),
        };
        let challenge = match parse_www_authenticate(&header_value) {
            Some(c) => c,
            None => return Ok(None),
        };

        let caller_scope = scope::append_repository_scope("", reference, &[op.as_scope_action()]);
        let merged_scope = match &challenge.scope {
            Some(server_scope) => scope::clean_scopes(&format!("{caller_scope} {server_scope}")),
            None => caller_scope,
        };

        let mut req = self.client.get(&challenge.realm).query(&[("scope", &merged_scope)]);
        if let Some(service) = &challenge.service {
            req = req.query(&[("service", service)]);
        }
        if let Some(header_value) = auth.auth_header(reference).await? {
            req = req.header(header::AUTHORIZATION, header_value);
        }

        let res = req.send().await?;
        if res.status() != StatusCode::OK {
            return Ok(None);
        }
        let token: RegistryToken = res.json().await.map_err(OciDistributionError::from)?;
        debug!("refreshed bearer token for {}", challenge.realm);
        Ok(Some(token))
    }
}

fn operation_for(method: &Method) -> RegistryOperation {
    match *method {
        Method::GET | Method::HEAD => RegistryOperation::Pull,
        Method::DELETE => RegistryOperation::Delete,
        _ => RegistryOperation::Push,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn protocol_renders_scheme() {
        assert_eq!(ClientProtocol::Https.as_str(), "https");
        assert_eq!(ClientProtocol::Http.as_str(), "http");
    }

    #[test]
    fn default_config_has_sane_timeout_and_redirect_bound() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_redirects, 10);
        assert_eq!(config.protocol, ClientProtocol::Https);
    }

    #[test]
    fn operation_for_maps_methods_to_actions() {
        assert_eq!(operation_for(&Method::GET), RegistryOperation::Pull);
        assert_eq!(operation_for(&Method::HEAD), RegistryOperation::Pull);
        assert_eq!(operation_for(&Method::POST), RegistryOperation::Push);
        assert_eq!(operation_for(&Method::PUT), RegistryOperation::Push);
        assert_eq!(operation_for(&Method::PATCH), RegistryOperation::Push);
        assert_eq!(operation_for(&Method::DELETE), RegistryOperation::Delete);
    }

    #[tokio::test]
    async fn engine_builds_with_default_config() {
        let engine = HttpEngine::new(ClientConfig::default());
        assert!(engine.is_ok());
    }

    #[tokio::test]
    async fn concurrent_challenges_share_a_single_refresh() {
        let mut server = mockito::Server::new_async().await;
        let host = server.url().trim_start_matches("http://").to_string();
        let reference = ContainerRef::parse(&format!("{host}/my/repo:latest")).unwrap();

        let challenge = format!(
            r#"Bearer realm="{}/token",service="registry",scope="repository:my/repo:pull""#,
            server.url()
        );
        let unauthorized = server
            .mock("GET", "/v2/my/repo/manifests/latest")
            .match_header("authorization", mockito::Matcher::Missing)
            .with_status(401)
            .with_header("www-authenticate", &challenge)
            .expect(2)
            .create_async()
            .await;
        let authorized = server
            .mock("GET", "/v2/my/repo/manifests/latest")
            .match_header("authorization", "Bearer abc123")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let token_endpoint = server
            .mock("GET", mockito::Matcher::Regex("/token.*".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token":"abc123"}"#)
            .expect(1)
            .create_async()
            .await;

        let engine = HttpEngine::new(ClientConfig {
            protocol: ClientProtocol::Http,
            ..ClientConfig::default()
        })
        .unwrap();
        let auth = AuthProvider::None;
        let url = format!("{}/v2/my/repo/manifests/latest", server.url());

        let (a, b) = tokio::join!(
            engine.execute(&reference, Method::GET, &url, vec![], None, &auth),
            engine.execute(&reference, Method::GET, &url, vec![], None, &auth),
        );
        assert!(a.unwrap().status().is_success());
        assert!(b.unwrap().status().is_success());

        unauthorized.assert_async().await;
        authorized.assert_async().await;
        token_endpoint.assert_async().await;
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_execute() {
        let engine = HttpEngine::new(ClientConfig::default()).unwrap();
        engine.cancel();
        let reference = ContainerRef::parse("example.com/ns/app:latest").unwrap();
        let auth = AuthProvider::None;
        let result = engine
            .execute(
                &reference,
                Method::GET,
                "https://example.com/v2/ns/app/manifests/latest",
                vec![],
                None,
                &auth,
            )
            .await;
        assert!(matches!(result, Err(OciDistributionError::Cancelled)));
    }
}
