//! Extractor configuration, loaded from YAML.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::retry::RetryPolicy;

/// Top-level configuration for a [`RestExtractor`](crate::extractor::RestExtractor).
///
/// Every field has a default, so an empty document is a valid config.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractorConfig {
    /// Maximum number of calls executing at once.
    pub parallelism: usize,
    /// How long the dispatcher waits for due work before re-checking cancellation.
    pub poll_interval_secs: f64,
    pub retry: RetryConfig,
    pub source: SourceConfig,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            parallelism: 10,
            poll_interval_secs: 1.0,
            retry: RetryConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl ExtractorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, AppError> {
        // An empty document deserializes as unit, not as an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| AppError::ConfigError(format!("Invalid extractor config: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check value ranges. Auth scheme selection is checked when the auth
    /// provider is built.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.parallelism == 0 {
            return Err(AppError::ConfigError(
                "parallelism must be at least 1".into(),
            ));
        }
        check_secs("poll_interval_secs", self.poll_interval_secs)?;
        if self.poll_interval_secs == 0.0 {
            return Err(AppError::ConfigError(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        self.retry.validate()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            tries: self.retry.tries,
            delay: Duration::from_secs_f64(self.retry.delay_secs),
            max_delay: Duration::from_secs_f64(self.retry.max_delay_secs),
            backoff: self.retry.backoff,
            jitter: Duration::from_secs_f64(self.retry.jitter_secs),
        }
    }
}

/// Retry settings for transient HTTP failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub tries: u32,
    pub delay_secs: f64,
    pub max_delay_secs: f64,
    pub backoff: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: 5,
            delay_secs: 5.0,
            max_delay_secs: 60.0,
            backoff: 1.5,
            jitter_secs: 1.0,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), AppError> {
        if self.tries == 0 {
            return Err(AppError::ConfigError("retry.tries must be at least 1".into()));
        }
        check_secs("retry.delay_secs", self.delay_secs)?;
        check_secs("retry.max_delay_secs", self.max_delay_secs)?;
        check_secs("retry.jitter_secs", self.jitter_secs)?;
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err(AppError::ConfigError(format!(
                "retry.backoff must be at least 1, got {}",
                self.backoff
            )));
        }
        Ok(())
    }
}

/// Longest accepted delay or poll timeout: one day.
const MAX_SECS: f64 = 86_400.0;

fn check_secs(field: &str, value: f64) -> Result<(), AppError> {
    if Duration::try_from_secs_f64(value).is_err() {
        return Err(AppError::ConfigError(format!(
            "{field} must be a non-negative number of seconds, got {value}"
        )));
    }
    if value > MAX_SECS {
        return Err(AppError::ConfigError(format!(
            "{field} must be at most {MAX_SECS} seconds, got {value}"
        )));
    }
    Ok(())
}

/// Settings applied to every request against the source.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Headers applied after endpoint headers.
    pub headers: BTreeMap<String, String>,
    pub auth: Option<AuthConfig>,
}

/// Auth scheme selection. Exactly one scheme must be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub basic: Option<BasicAuthConfig>,
    pub oauth: Option<OAuthConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BasicAuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// OAuth client-credentials settings. Either `tenant` or `token_url` must be set.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OAuthConfig {
    pub client_id: String,
    pub secret: String,
    pub token_url: Option<String>,
    pub tenant: Option<String>,
    pub scopes: Vec<String>,
    pub audience: Option<String>,
}

impl OAuthConfig {
    /// Token endpoint: the Microsoft identity endpoint when `tenant` is set,
    /// otherwise `token_url`.
    pub fn token_endpoint(&self) -> Result<String, AppError> {
        match (&self.tenant, &self.token_url) {
            (Some(tenant), _) => Ok(format!(
                "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
            )),
            (None, Some(url)) => Ok(url.clone()),
            (None, None) => Err(AppError::ConfigError(
                "oauth requires either token_url or tenant".into(),
            )),
        }
    }
}
