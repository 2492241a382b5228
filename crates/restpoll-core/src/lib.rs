pub mod auth;
pub mod config;
pub mod decode;
pub mod endpoint;
pub mod error;
pub mod extractor;
pub mod http;
pub mod http_url;
pub mod output;
pub mod queue;
pub mod report;
pub mod retry;
pub mod sink;
pub mod template;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use auth::AuthenticationProvider;
pub use config::ExtractorConfig;
pub use endpoint::{BoundEndpoint, CallResult, Endpoint};
pub use error::AppError;
pub use extractor::{Registrar, RestExtractor, RunSummary};
pub use http_url::HttpUrl;
pub use output::{Datapoint, Datapoints, Event, Output, OutputRouter, RawRow, Row};
pub use traits::{AuthProvider, EventSink, HttpClient, NoAuth, RawSink, TimeSeriesSink};
