//! Credential and auth manager: per-provider header derivation and
//! OAuth2 token refresh, backed by a provider-keyed credential store.

use std::collections::HashMap;
use std::time::Duration;

use cqe_core::{Error, ProviderTag, Result};
use dashmap::DashMap;
use reqwest::Client as ReqwestClient;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::instrument;

#[derive(Debug, Clone)]
pub enum Credentials {
    ApiKey { key: String },
    Aws { access_key_id: String, secret_access_key: String },
    R2 { auth_key: String, auth_email: String },
    OAuth2 { refresh_token: String, client_id: Option<String>, client_secret: Option<String> },
    /// Assumed-role credentials: no long-term secret is held client-side, only
    /// the role identifier the caller's environment has already assumed.
    IamRole { role_arn: String },
}

impl Credentials {
    /// Shape-only validation per provider: checks that the fields a
    /// provider's signing scheme needs are actually present, not that they
    /// are correct.
    pub fn validate(&self, provider: ProviderTag) -> Result<()> {
        match (provider, self) {
            (ProviderTag::S3, Credentials::Aws { access_key_id, secret_access_key }) => {
                if access_key_id.is_empty() || secret_access_key.is_empty() {
                    return Err(Error::unsupported_auth_method("s3 requires both an access key id and a secret"));
                }
                Ok(())
            }
            (ProviderTag::S3, Credentials::IamRole { role_arn }) => {
                if role_arn.is_empty() {
                    return Err(Error::unsupported_auth_method("iam role auth requires a role arn"));
                }
                Ok(())
            }
            (ProviderTag::R2, Credentials::R2 { auth_key, auth_email }) => {
                if auth_key.is_empty() || auth_email.is_empty() {
                    return Err(Error::unsupported_auth_method("r2 requires both an auth key and an auth email"));
                }
                Ok(())
            }
            (ProviderTag::Gcs, Credentials::OAuth2 { refresh_token, .. })
            | (ProviderTag::AzureBlob, Credentials::OAuth2 { refresh_token, .. }) => {
                if refresh_token.is_empty() {
                    return Err(Error::unsupported_auth_method("oauth2 requires a refresh token"));
                }
                Ok(())
            }
            (_, Credentials::ApiKey { key }) if !key.is_empty() => Ok(()),
            _ => Err(Error::unsupported_auth_method(format!(
                "credential shape does not match provider '{provider}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

fn default_oauth2_endpoint(provider: ProviderTag) -> Option<&'static str> {
    match provider {
        ProviderTag::Gcs => Some("https://oauth2.googleapis.com/token"),
        ProviderTag::AzureBlob => Some("https://login.microsoftonline.com/common/oauth2/v2.0/token"),
        ProviderTag::S3 | ProviderTag::R2 => None,
    }
}

/// Process-wide store of per-provider credentials, derived request
/// headers, and cached OAuth2 tokens.
pub struct AuthManager {
    http: ReqwestClient,
    credentials: DashMap<ProviderTag, Credentials>,
    tokens: DashMap<ProviderTag, CachedToken>,
    oauth2_endpoints: DashMap<ProviderTag, String>,
    refresh_threshold: Duration,
}

impl AuthManager {
    pub fn new(refresh_threshold: Duration) -> Self {
        let oauth2_endpoints = DashMap::new();
        for provider in [ProviderTag::Gcs, ProviderTag::AzureBlob] {
            if let Some(url) = default_oauth2_endpoint(provider) {
                oauth2_endpoints.insert(provider, url.to_string());
            }
        }
        Self {
            http: ReqwestClient::builder().build().expect("failed to build reqwest client"),
            credentials: DashMap::new(),
            tokens: DashMap::new(),
            oauth2_endpoints,
            refresh_threshold,
        }
    }

    /// Overrides a provider's OAuth2 token endpoint (useful in tests, or to
    /// point at a private STS-compatible endpoint).
    pub fn set_oauth2_endpoint(&self, provider: ProviderTag, url: impl Into<String>) {
        self.oauth2_endpoints.insert(provider, url.into());
    }

    /// Replaces any prior credentials for `provider` and invalidates its
    /// cached token.
    pub fn set_credentials(&self, provider: ProviderTag, creds: Credentials) {
        self.credentials.insert(provider, creds);
        self.tokens.remove(&provider);
    }

    pub fn validate(&self, provider: ProviderTag, creds: &Credentials) -> Result<()> {
        creds.validate(provider)
    }

    /// Refreshes the cached OAuth2 token if it is within `refresh_threshold`
    /// of expiry (or absent). A no-op for non-OAuth2 credential shapes.
    #[instrument(skip(self), fields(provider = %provider))]
    pub async fn refresh_if_needed(&self, provider: ProviderTag) -> Result<()> {
        let needs_refresh = match self.tokens.get(&provider) {
            Some(t) => Instant::now() + self.refresh_threshold >= t.expires_at,
            None => true,
        };
        if !needs_refresh {
            return Ok(());
        }

        let creds = self
            .credentials
            .get(&provider)
            .map(|c| c.clone())
            .ok_or_else(|| Error::no_oauth2_token(provider.to_string()))?;

        let Credentials::OAuth2 { refresh_token, client_id, client_secret } = creds else {
            return Ok(());
        };

        let endpoint = self
            .oauth2_endpoints
            .get(&provider)
            .map(|e| e.clone())
            .ok_or_else(|| Error::unsupported_auth_method(format!("{provider} has no oauth2 token endpoint")))?;

        let mut form = HashMap::new();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token);
        if let Some(id) = client_id {
            form.insert("client_id", id);
        }
        if let Some(secret) = client_secret {
            form.insert("client_secret", secret);
        }

        let send_result = self.http.post(&endpoint).form(&form).send().await;
        let response = match send_result {
            Ok(r) => r,
            Err(e) => {
                self.tokens.remove(&provider);
                return Err(Error::token_refresh_failed(provider.to_string(), e.to_string()));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            self.tokens.remove(&provider);
            return Err(Error::token_refresh_failed(provider.to_string(), format!("token endpoint returned {status}")));
        }

        let body: OAuthTokenResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                self.tokens.remove(&provider);
                return Err(Error::token_refresh_failed(provider.to_string(), e.to_string()));
            }
        };

        self.tokens.insert(
            provider,
            CachedToken { access_token: body.access_token, expires_at: Instant::now() + Duration::from_secs(body.expires_in) },
        );
        Ok(())
    }

    /// Derives request headers for `provider`. Synchronous work for
    /// API-key/AWS shapes; OAuth2 shapes may trigger a refresh first.
    pub async fn auth_headers(&self, provider: ProviderTag) -> Result<HashMap<String, String>> {
        let creds = self.credentials.get(&provider).map(|c| c.clone());
        let mut headers = HashMap::new();

        match creds {
            Some(Credentials::Aws { access_key_id, secret_access_key }) => {
                if access_key_id.is_empty() || secret_access_key.is_empty() {
                    return Err(Error::unsupported_auth_method("s3 requires both an access key id and a secret"));
                }
                // Real SigV4 signing is out of scope; the contract only
                // requires an Authorization header be present.
                headers.insert("Authorization".to_string(), format!("AWS4-HMAC-SHA256 Credential={access_key_id}"));
            }
            Some(Credentials::R2 { auth_key, auth_email }) => {
                headers.insert("X-Auth-Key".to_string(), auth_key);
                headers.insert("X-Auth-Email".to_string(), auth_email);
            }
            Some(Credentials::IamRole { role_arn }) => {
                // Presence-only: the caller's environment has already assumed
                // this role. No SigV4 signing; see Credentials::IamRole.
                headers.insert("Authorization".to_string(), format!("Bearer {role_arn}"));
            }
            Some(Credentials::ApiKey { key }) => {
                headers.insert("Authorization".to_string(), format!("Bearer {key}"));
            }
            Some(Credentials::OAuth2 { .. }) => {
                self.refresh_if_needed(provider).await?;
                let token = self.tokens.get(&provider).ok_or_else(|| Error::no_oauth2_token(provider.to_string()))?;
                headers.insert("Authorization".to_string(), format!("Bearer {}", token.access_token));
            }
            None => {}
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn aws_validation_requires_both_fields() {
        let creds = Credentials::Aws { access_key_id: "id".into(), secret_access_key: "".into() };
        assert!(creds.validate(ProviderTag::S3).is_err());
    }

    #[tokio::test]
    async fn r2_headers_use_auth_key_and_email() {
        let manager = AuthManager::new(Duration::from_secs(60));
        manager.set_credentials(
            ProviderTag::R2,
            Credentials::R2 { auth_key: "key123".into(), auth_email: "a@b.com".into() },
        );
        let headers = manager.auth_headers(ProviderTag::R2).await.unwrap();
        assert_eq!(headers.get("X-Auth-Key").unwrap(), "key123");
        assert_eq!(headers.get("X-Auth-Email").unwrap(), "a@b.com");
    }

    #[tokio::test]
    async fn iam_role_headers_carry_bearer_token() {
        let manager = AuthManager::new(Duration::from_secs(60));
        manager.set_credentials(ProviderTag::S3, Credentials::IamRole { role_arn: "arn:aws:iam::123:role/reader".into() });
        let headers = manager.auth_headers(ProviderTag::S3).await.unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer arn:aws:iam::123:role/reader");
    }

    #[test]
    fn iam_role_validation_requires_a_role_arn() {
        let creds = Credentials::IamRole { role_arn: "".into() };
        assert!(creds.validate(ProviderTag::S3).is_err());
    }

    #[tokio::test]
    async fn missing_credentials_yield_no_headers() {
        let manager = AuthManager::new(Duration::from_secs(60));
        let headers = manager.auth_headers(ProviderTag::S3).await.unwrap();
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn oauth2_refresh_populates_bearer_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-abc",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let manager = AuthManager::new(Duration::from_secs(60));
        manager.set_oauth2_endpoint(ProviderTag::Gcs, server.uri());
        manager.set_credentials(
            ProviderTag::Gcs,
            Credentials::OAuth2 { refresh_token: "refresh-xyz".into(), client_id: None, client_secret: None },
        );

        let headers = manager.auth_headers(ProviderTag::Gcs).await.unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok-abc");
    }

    #[tokio::test]
    async fn oauth2_refresh_failure_clears_token_and_fails_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(401)).mount(&server).await;

        let manager = AuthManager::new(Duration::from_secs(60));
        manager.set_oauth2_endpoint(ProviderTag::Gcs, server.uri());
        manager.set_credentials(
            ProviderTag::Gcs,
            Credentials::OAuth2 { refresh_token: "bad".into(), client_id: None, client_secret: None },
        );

        let err = manager.auth_headers(ProviderTag::Gcs).await.unwrap_err();
        assert_eq!(err.code(), "TOKEN_REFRESH_FAILED");

        let err2 = manager.refresh_if_needed(ProviderTag::Gcs).await.unwrap_err();
        assert_eq!(err2.code(), "TOKEN_REFRESH_FAILED");
    }
}
