//! Outbound HTTP authentication and TLS policy
//!
//! Three concerns live here, all applying to the client-role HTTP
//! transports:
//!
//! - `API_ACCESS_TOKEN` bearer injection: when the environment variable is
//!   set and the operator did not pass an explicit `Authorization` header,
//!   a `Authorization: Bearer <token>` header is added to all outbound
//!   requests. Explicit headers always win.
//! - OAuth2 client-credentials acquisition: a token is fetched before the
//!   first request and refreshed exactly once after a `401`; a second `401`
//!   closes the transport with an authentication failure.
//! - `verify_ssl` policy: certificate verification can be disabled or
//!   pointed at a custom PEM CA bundle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{ProxyError, Result};

/// Timeout for a single token-endpoint request.
pub const OAUTH_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable consulted for implicit bearer authentication.
pub const API_ACCESS_TOKEN_VAR: &str = "API_ACCESS_TOKEN";

/// TLS verification policy for outbound HTTP connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum VerifySsl {
    /// Standard certificate verification (the default).
    #[default]
    Enabled,
    /// Verification disabled entirely.
    Disabled,
    /// Verify against a custom PEM CA bundle.
    CaBundle(PathBuf),
}

/// Build the shared `reqwest` client honoring the TLS policy.
///
/// # Errors
///
/// Returns [`ProxyError::Config`] when the CA bundle cannot be read or
/// parsed, or when the client cannot be constructed.
pub fn build_http_client(verify: &VerifySsl) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    match verify {
        VerifySsl::Enabled => {}
        VerifySsl::Disabled => {
            builder = builder.danger_accept_invalid_certs(true);
        }
        VerifySsl::CaBundle(path) => {
            let pem = std::fs::read(path).map_err(|e| {
                ProxyError::Config(format!("failed to read CA bundle {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ProxyError::Config(format!("invalid CA bundle {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
    }
    builder
        .build()
        .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {e}")).into())
}

/// Merge the implicit `API_ACCESS_TOKEN` bearer into a header map.
///
/// The token is only applied when the caller did not already set an
/// `Authorization` header (matched case-insensitively): explicit headers
/// win over the environment.
pub fn apply_access_token_env(headers: &mut HashMap<String, String>) {
    let has_authorization = headers.keys().any(|k| k.eq_ignore_ascii_case("authorization"));
    if has_authorization {
        return;
    }
    if let Ok(token) = std::env::var(API_ACCESS_TOKEN_VAR) {
        if !token.is_empty() {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
    }
}

/// OAuth2 client-credentials configuration, assembled from the CLI flags.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Client identifier presented to the token endpoint.
    pub client_id: String,
    /// Client secret presented to the token endpoint.
    pub client_secret: String,
    /// The token endpoint URL.
    pub token_url: Url,
}

/// Successful token-endpoint response. Only `access_token` is consumed.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Client-credentials token source with a one-deep cache.
///
/// `bearer()` returns the cached token when present; `refresh()` always
/// hits the token endpoint and replaces the cache. Transports call
/// `refresh()` exactly once after a `401` before giving up.
#[derive(Debug)]
pub struct ClientCredentials {
    config: OAuthConfig,
    http: reqwest::Client,
    cached: RwLock<Option<String>>,
}

impl ClientCredentials {
    /// Create a token source over an existing HTTP client (so the TLS
    /// policy also governs the token endpoint).
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            cached: RwLock::new(None),
        }
    }

    /// The current bearer token, fetching one if none is cached.
    ///
    /// # Errors
    ///
    /// Propagates token-endpoint failures as [`ProxyError::AuthFailure`].
    pub async fn bearer(&self) -> Result<String> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                return Ok(token.clone());
            }
        }
        self.refresh().await
    }

    /// Fetch a fresh token from the endpoint and replace the cache.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AuthFailure`] when the endpoint is
    /// unreachable, answers with a non-success status, or returns a body
    /// without an `access_token`.
    pub async fn refresh(&self) -> Result<String> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .timeout(OAUTH_REFRESH_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProxyError::AuthFailure(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                ProxyError::AuthFailure(format!("token endpoint returned HTTP {status}")).into(),
            );
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::AuthFailure(format!("invalid token response: {e}")))?;

        let mut cached = self.cached.write().await;
        *cached = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth_config(server_uri: &str) -> OAuthConfig {
        OAuthConfig {
            client_id: "proxy-client".to_string(),
            client_secret: "s3cret".to_string(),
            token_url: Url::parse(&format!("{server_uri}/token")).unwrap(),
        }
    }

    #[test]
    fn test_apply_access_token_env_respects_explicit_authorization() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer explicit".to_string());
        // Even with the env var set, the explicit header must win.
        std::env::set_var(API_ACCESS_TOKEN_VAR, "from-env");
        apply_access_token_env(&mut headers);
        std::env::remove_var(API_ACCESS_TOKEN_VAR);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["authorization"], "Bearer explicit");
    }

    #[test]
    fn test_build_http_client_default_policy() {
        assert!(build_http_client(&VerifySsl::Enabled).is_ok());
        assert!(build_http_client(&VerifySsl::Disabled).is_ok());
    }

    #[test]
    fn test_build_http_client_missing_bundle_is_config_error() {
        let err = build_http_client(&VerifySsl::CaBundle(PathBuf::from("/no/such/bundle.pem")))
            .unwrap_err();
        assert!(crate::error::is_config_error(&err));
    }

    #[tokio::test]
    async fn test_refresh_fetches_and_caches_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let creds = ClientCredentials::new(oauth_config(&server.uri()), reqwest::Client::new());
        assert_eq!(creds.refresh().await.unwrap(), "tok-1");
        // Served from the cache: the mock's expect(1) would fail otherwise.
        assert_eq!(creds.bearer().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn test_refresh_maps_error_status_to_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let creds = ClientCredentials::new(oauth_config(&server.uri()), reqwest::Client::new());
        let err = creds.refresh().await.unwrap_err();
        let proxy_err = err.downcast_ref::<ProxyError>().expect("expected ProxyError");
        assert!(matches!(proxy_err, ProxyError::AuthFailure(_)));
    }
}
