use std::time::Duration;

use reqwest::{Client, Method};
use restpoll_core::error::AppError;
use restpoll_core::http::{HttpMethod, HttpRequest, HttpResponse};
use restpoll_core::traits::HttpClient;

/// HTTP client using reqwest.
///
/// Returns every response the server produced, whatever its status; the
/// extractor decides which statuses are retried. Transport failures map to
/// [`AppError::Timeout`] or [`AppError::HttpError`].
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent(concat!("restpoll/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs,
        })
    }

    /// Wrap an already configured reqwest client.
    pub fn from_client(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout_secs: timeout.as_secs(),
        }
    }
}

fn method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
    }
}

impl HttpClient for ReqwestClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, AppError> {
        let mut builder = self.client.request(method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::HttpError(format!("Connection failed: {e}"))
            } else if e.is_builder() {
                AppError::InvalidUrl(format!("{}: {e}", request.url))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        tracing::trace!(url = %request.url, %status, "Response received");
        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;
        Ok(HttpResponse::new(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_methods() {
        assert_eq!(method(HttpMethod::Get), Method::GET);
        assert_eq!(method(HttpMethod::Post), Method::POST);
    }

    #[tokio::test]
    async fn connection_refused_is_an_http_error() {
        // Bind and drop a listener to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ReqwestClient::with_timeout(Duration::from_secs(5)).unwrap();
        let request = HttpRequest::new(HttpMethod::Get, format!("http://{addr}/"));
        let err = client.send(&request).await.unwrap_err();
        assert!(matches!(err, AppError::HttpError(_)), "got {err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_header_is_rejected() {
        let client = ReqwestClient::new().unwrap();
        let request = HttpRequest::new(HttpMethod::Get, "http://127.0.0.1:9/")
            .with_header("bad header", "x");
        assert!(client.send(&request).await.is_err());
    }
}
