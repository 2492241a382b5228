//! Auth header provider built from [`AuthConfig`].
//!
//! Basic auth encodes the configured credentials. OAuth runs the
//! client-credentials grant through the extractor's own [`HttpClient`] and
//! caches the token until shortly before it expires.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::form_urlencoded;

use crate::config::{AuthConfig, BasicAuthConfig, OAuthConfig};
use crate::error::AppError;
use crate::http::{HttpMethod, HttpRequest};
use crate::traits::{AuthProvider, HttpClient};

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
enum Scheme {
    Basic(BasicAuthConfig),
    OAuth(OAuthConfig),
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<Instant>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// [`AuthProvider`] for the schemes in [`AuthConfig`].
#[derive(Clone)]
pub struct AuthenticationProvider<C> {
    scheme: Option<Scheme>,
    client: C,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl<C: HttpClient> AuthenticationProvider<C> {
    /// Build a provider. `None` yields an unconfigured provider; a config
    /// with zero or several schemes is rejected.
    pub fn new(config: Option<AuthConfig>, client: C) -> Result<Self, AppError> {
        let scheme = match config {
            None => None,
            Some(AuthConfig {
                basic: Some(basic),
                oauth: None,
            }) => Some(Scheme::Basic(basic)),
            Some(AuthConfig {
                basic: None,
                oauth: Some(oauth),
            }) => {
                oauth.token_endpoint()?;
                Some(Scheme::OAuth(oauth))
            }
            Some(_) => {
                return Err(AppError::ConfigError(
                    "exactly one of basic or oauth is required for auth".into(),
                ));
            }
        };
        Ok(Self {
            scheme,
            client,
            token: Arc::new(Mutex::new(None)),
        })
    }

    async fn bearer_token(&self, oauth: &OAuthConfig) -> Result<String, AppError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            let fresh = token
                .expires_at
                .is_none_or(|at| Instant::now() + EXPIRY_MARGIN < at);
            if fresh {
                return Ok(token.token.clone());
            }
        }

        let token = self.request_token(oauth).await?;
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn request_token(&self, oauth: &OAuthConfig) -> Result<CachedToken, AppError> {
        let endpoint = oauth.token_endpoint()?;

        // The serializer is not Send; it must be gone before the await below.
        let body = {
            let mut form = form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "client_credentials")
                .append_pair("client_id", &oauth.client_id)
                .append_pair("scope", &oauth.scopes.join(" "))
                .append_pair("client_secret", &oauth.secret);
            if let Some(audience) = &oauth.audience {
                form.append_pair("audience", audience);
            }
            form.finish()
        };

        let request = HttpRequest::new(HttpMethod::Post, endpoint.clone())
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body(body);

        tracing::debug!(token_url = %endpoint, "Requesting OAuth token");
        let response = self.client.send(&request).await?;
        if !response.is_success() {
            return Err(AppError::AuthError(format!(
                "token request to {endpoint} failed with HTTP {}: {}",
                response.status, response.body
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|e| AppError::AuthError(format!("invalid token response: {e}")))?;
        Ok(CachedToken {
            token: parsed.access_token,
            // An expiry too far out to represent is treated as none.
            expires_at: parsed
                .expires_in
                .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs))),
        })
    }
}

impl<C: HttpClient> AuthProvider for AuthenticationProvider<C> {
    fn is_configured(&self) -> bool {
        self.scheme.is_some()
    }

    async fn auth_header(&self) -> Result<String, AppError> {
        match &self.scheme {
            None => Err(AppError::ConfigError("No auth configured".into())),
            Some(Scheme::Basic(basic)) => {
                let credentials = format!(
                    "{}:{}",
                    basic.username.as_deref().unwrap_or_default(),
                    basic.password.as_deref().unwrap_or_default()
                );
                Ok(format!("Basic {}", STANDARD.encode(credentials)))
            }
            Some(Scheme::OAuth(oauth)) => Ok(format!("Bearer {}", self.bearer_token(oauth).await?)),
        }
    }
}
