//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::http::{HttpRequest, HttpResponse};
use crate::traits::{AuthProvider, HttpClient};

// ---------------------------------------------------------------------------
// MockHttpClient
// ---------------------------------------------------------------------------

/// Mock HTTP client with scripted responses per URL.
///
/// Each URL has a queue of responses; every call pops the front, except
/// that the last one is repeated forever. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockHttpClient {
    routes: Arc<Mutex<HashMap<String, Vec<Result<HttpResponse, AppError>>>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    latency: Option<Duration>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `send`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Answer `url` with `body` and status 200.
    pub fn on_json(self, url: &str, body: serde_json::Value) -> Self {
        self.on(url, vec![Ok(HttpResponse::ok(body.to_string()))])
    }

    /// Script the responses for `url`, in order.
    pub fn on(self, url: &str, responses: Vec<Result<HttpResponse, AppError>>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), responses);
        self
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// URLs of every request sent so far.
    pub fn urls(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    /// Highest number of `send` calls observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &str) -> Result<HttpResponse, AppError> {
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => match queue.first() {
                Some(Ok(response)) => Ok(response.clone()),
                Some(Err(e)) => Err(clone_error(e)),
                None => Ok(HttpResponse::new(404, "")),
            },
            None => Ok(HttpResponse::new(404, "")),
        }
    }
}

fn clone_error(error: &AppError) -> AppError {
    match error {
        AppError::HttpError(msg) => AppError::HttpError(msg.clone()),
        AppError::Timeout(secs) => AppError::Timeout(*secs),
        other => AppError::HttpError(other.to_string()),
    }
}

impl HttpClient for MockHttpClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.next_response(&request.url)
    }
}

// ---------------------------------------------------------------------------
// MockAuth
// ---------------------------------------------------------------------------

/// Mock auth provider returning a fixed header value.
#[derive(Clone)]
pub struct MockAuth {
    header: String,
    calls: Arc<AtomicUsize>,
}

impl MockAuth {
    pub fn new(header: &str) -> Self {
        Self {
            header: header.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of times a header was requested.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AuthProvider for MockAuth {
    fn is_configured(&self) -> bool {
        true
    }

    async fn auth_header(&self) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.header.clone())
    }
}
