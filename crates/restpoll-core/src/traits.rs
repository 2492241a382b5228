use std::future::Future;

use crate::error::AppError;
use crate::http::{HttpRequest, HttpResponse};
use crate::output::{Datapoints, Event, Row};

/// Sends a prepared request and returns the raw response.
///
/// Implementations return `Ok` for every response the server produced,
/// whatever its status; the engine decides which statuses are failures.
pub trait HttpClient: Send + Sync + Clone + 'static {
    fn send(
        &self,
        request: &HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, AppError>> + Send;
}

/// Supplies the value of the `Authorization` header.
pub trait AuthProvider: Send + Sync + Clone + 'static {
    /// Whether any auth scheme is configured. The engine only asks for a
    /// header when this is true.
    fn is_configured(&self) -> bool;

    /// Produce a header value such as `Bearer <token>`. Fails when nothing
    /// is configured.
    fn auth_header(&self) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// An auth provider with nothing configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn is_configured(&self) -> bool {
        false
    }

    async fn auth_header(&self) -> Result<String, AppError> {
        Err(AppError::ConfigError("No auth configured".into()))
    }
}

/// Receives event records. Implementations buffer and flush on their own.
pub trait EventSink: Send + Sync {
    fn enqueue(&self, event: Event);
}

/// Receives rows destined for a named database table.
pub trait RawSink: Send + Sync {
    fn enqueue(&self, database: &str, table: &str, row: Row);
}

/// Receives batches of time-series datapoints.
pub trait TimeSeriesSink: Send + Sync {
    fn enqueue(&self, datapoints: Datapoints);
}
