//! Endpoint descriptors.
//!
//! An [`Endpoint<T>`] describes one family of requests whose responses decode
//! into `T`. Attaching a handler with [`Endpoint::handle`] erases `T` and
//! yields a [`BoundEndpoint`], which is what the extractor schedules.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use restpoll_core::endpoint::Endpoint;
//! use restpoll_core::output::{RawRow, Row};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Page {
//!     items: Vec<serde_json::Value>,
//!     next: Option<String>,
//! }
//!
//! let endpoint = Endpoint::<Page>::get("assets")
//!     .query("limit", 100)
//!     .next_page(|call| {
//!         let cursor = call.response.next.as_ref()?;
//!         let mut url = call.url.clone();
//!         url.set_query("cursor", cursor.as_str());
//!         Some(url)
//!     })
//!     .interval(Duration::from_secs(60))
//!     .handle(|page| {
//!         page.items
//!             .iter()
//!             .map(|item| Row::from_json(item["id"].to_string(), item.clone()))
//!             .collect::<Result<Vec<_>, _>>()
//!             .map(|rows| RawRow::many("db", "assets", rows))
//!     });
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::decode::decode;
use crate::error::AppError;
use crate::http::{HttpMethod, set_header};
use crate::http_url::HttpUrl;
use crate::output::{Output, OutputRouter};
use crate::template::{BodyTemplate, Template};

/// Result of one completed call, handed to the pagination function.
#[derive(Debug, Clone)]
pub struct CallResult<T> {
    /// The URL that was called.
    pub url: HttpUrl,
    /// The decoded response.
    pub response: T,
    pub time: DateTime<Utc>,
    pub id: Uuid,
}

type NextPageFn<T> = Arc<dyn Fn(&CallResult<T>) -> Option<HttpUrl> + Send + Sync>;
type HandlerFn<T> = Arc<dyn Fn(&T) -> Result<Output, AppError> + Send + Sync>;

/// Builder for an endpoint whose responses decode into `T`.
pub struct Endpoint<T> {
    name: Option<String>,
    method: HttpMethod,
    path: Template<String>,
    query: Vec<(String, Template<Value>)>,
    headers: Vec<(String, Template<String>)>,
    body: Option<BodyTemplate>,
    next_page: Option<NextPageFn<T>>,
    interval: Option<Duration>,
}

impl<T: DeserializeOwned + 'static> Endpoint<T> {
    fn new(method: HttpMethod, path: Template<String>, body: Option<BodyTemplate>) -> Self {
        Self {
            name: None,
            method,
            path,
            query: Vec::new(),
            headers: Vec::new(),
            body,
            next_page: None,
            interval: None,
        }
    }

    pub fn get(path: impl Into<Template<String>>) -> Self {
        Self::new(HttpMethod::Get, path.into(), None)
    }

    pub fn post(path: impl Into<Template<String>>, body: impl Into<BodyTemplate>) -> Self {
        Self::new(HttpMethod::Post, path.into(), Some(body.into()))
    }

    /// Display name used in logs and failure reports. Defaults to `METHOD path`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Compute the path on every call instead of using a fixed one.
    pub fn path_with<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.path = Template::computed(f);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.push((key.into(), Template::Literal(value.into())));
        self
    }

    pub fn query_with<F, V>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
        V: Into<Value>,
    {
        self.query
            .push((key.into(), Template::computed(move || f().into())));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.into(), Template::Literal(value.into())));
        self
    }

    pub fn header_with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.headers.push((name.into(), Template::computed(f)));
        self
    }

    /// Pagination rule: given the last call, return the next URL or `None`.
    pub fn next_page<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallResult<T>) -> Option<HttpUrl> + Send + Sync + 'static,
    {
        self.next_page = Some(Arc::new(f));
        self
    }

    /// Poll forever: once a pagination chain ends, start over after `interval`.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Attach the handler that turns each decoded response into output.
    pub fn handle<F, O>(self, handler: F) -> BoundEndpoint
    where
        F: Fn(&T) -> Result<O, AppError> + Send + Sync + 'static,
        O: Into<Output>,
    {
        let handler: HandlerFn<T> = Arc::new(move |response: &T| handler(response).map(Into::into));
        let descriptor = Descriptor {
            name: self.name,
            method: self.method,
            path: self.path,
            query: self.query,
            headers: self.headers,
            body: self.body,
            interval: self.interval,
        };
        BoundEndpoint {
            descriptor: Arc::new(descriptor),
            processor: Arc::new(Processor {
                handler,
                next_page: self.next_page,
                _response: PhantomData,
            }),
            registered_name: None,
        }
    }
}

struct Descriptor {
    name: Option<String>,
    method: HttpMethod,
    path: Template<String>,
    query: Vec<(String, Template<Value>)>,
    headers: Vec<(String, Template<String>)>,
    body: Option<BodyTemplate>,
    interval: Option<Duration>,
}

/// What processing one response produced.
#[derive(Debug)]
pub struct Processed {
    /// Records handed to sinks.
    pub routed: usize,
    /// Next page, if the pagination function returned one.
    pub next: Option<HttpUrl>,
}

trait Process: Send + Sync {
    fn process(
        &self,
        url: &HttpUrl,
        payload: &str,
        router: &OutputRouter,
    ) -> Result<Processed, AppError>;
}

struct Processor<T> {
    handler: HandlerFn<T>,
    next_page: Option<NextPageFn<T>>,
    _response: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Process for Processor<T> {
    fn process(
        &self,
        url: &HttpUrl,
        payload: &str,
        router: &OutputRouter,
    ) -> Result<Processed, AppError> {
        let response: T = decode(payload)?;
        let output = (self.handler)(&response)?;
        let routed = router.route(output)?;

        let next = match &self.next_page {
            Some(next_page) => {
                let result = CallResult {
                    url: url.clone(),
                    response,
                    time: Utc::now(),
                    id: Uuid::new_v4(),
                };
                next_page(&result)
            }
            None => None,
        };
        Ok(Processed { routed, next })
    }
}

/// An endpoint with its handler attached, ready to register.
///
/// Cheap to clone; every pending call holds one.
#[derive(Clone)]
pub struct BoundEndpoint {
    descriptor: Arc<Descriptor>,
    processor: Arc<dyn Process>,
    registered_name: Option<Arc<str>>,
}

impl BoundEndpoint {
    /// Name used in logs and failure reports: the name assigned at
    /// registration, else the explicit name, else the default name.
    pub fn name(&self) -> String {
        match (&self.registered_name, &self.descriptor.name) {
            (Some(name), _) => name.to_string(),
            (None, Some(name)) => name.clone(),
            (None, None) => self.default_name(),
        }
    }

    pub(crate) fn with_registered_name(mut self, name: &str) -> Self {
        self.registered_name = Some(Arc::from(name));
        self
    }

    /// The explicit name, if one was given.
    pub fn explicit_name(&self) -> Option<&str> {
        self.descriptor.name.as_deref()
    }

    /// `METHOD path` for literal paths; computed paths are not resolved here.
    pub fn default_name(&self) -> String {
        match &self.descriptor.path {
            Template::Literal(path) => format!("{} {path}", self.descriptor.method),
            Template::Computed(_) => format!("{} <computed path>", self.descriptor.method),
        }
    }

    pub fn method(&self) -> HttpMethod {
        self.descriptor.method
    }

    pub fn interval(&self) -> Option<Duration> {
        self.descriptor.interval
    }

    pub fn has_body(&self) -> bool {
        self.descriptor.body.is_some()
    }

    /// The first URL of a chain: path joined onto `base_url`, plus the query.
    /// Producers run on every call.
    pub fn initial_url(&self, base_url: &str) -> Result<HttpUrl, AppError> {
        let path = self.descriptor.path.resolve();
        let mut url = HttpUrl::join(base_url, &path)?;
        url.add_to_query(
            self.descriptor
                .query
                .iter()
                .map(|(key, value)| (key.clone(), value.resolve())),
        );
        Ok(url)
    }

    /// Apply this endpoint's headers on top of `headers`.
    pub fn apply_headers(&self, headers: &mut Vec<(String, String)>) {
        for (name, value) in &self.descriptor.headers {
            set_header(headers, name.clone(), value.resolve());
        }
    }

    /// Resolve the body template, if any. Producers run on every call.
    pub fn render_body(&self) -> Result<Option<String>, AppError> {
        self.descriptor
            .body
            .as_ref()
            .map(BodyTemplate::render)
            .transpose()
    }

    /// Decode `payload`, run the handler, route its output and ask the
    /// pagination function for the next page.
    pub fn process(
        &self,
        url: &HttpUrl,
        payload: &str,
        router: &OutputRouter,
    ) -> Result<Processed, AppError> {
        self.processor.process(url, payload, router)
    }
}

impl fmt::Debug for BoundEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundEndpoint")
            .field("name", &self.name())
            .field("method", &self.descriptor.method)
            .field("path", &self.descriptor.path)
            .field("interval", &self.descriptor.interval)
            .finish_non_exhaustive()
    }
}
