//! The call scheduler and execution engine.
//!
//! A run turns every registered endpoint into a pending call due now, then
//! a single dispatcher loop feeds due calls to at most `parallelism`
//! concurrent workers. Each worker sends the request (with retries),
//! decodes and handles the response, routes the output and schedules the
//! follow-up call, if any. The run ends when nothing is queued and nothing
//! is executing, or when the cancellation token fires.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::auth::AuthenticationProvider;
use crate::config::ExtractorConfig;
use crate::endpoint::BoundEndpoint;
use crate::error::{AppError, CallFailure, RunFailure};
use crate::http::{HttpRequest, set_header};
use crate::http_url::HttpUrl;
use crate::output::OutputRouter;
use crate::queue::{CallQueue, PendingCall, Pop};
use crate::report::{RunEvent, RunReporter, TracingRunReporter};
use crate::retry::RetryPolicy;
use crate::template::Template;
use crate::traits::{AuthProvider, HttpClient, NoAuth};

/// Totals for a run that finished without call failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Calls that were executed, including abandoned ones.
    pub calls: usize,
    /// Records handed to sinks.
    pub items_routed: usize,
}

// ---------------------------------------------------------------------------
// Registrar
// ---------------------------------------------------------------------------

struct Running {
    queue: CallQueue,
    base_url: String,
    /// Name counts before the run, restored when it ends.
    names_before: HashMap<String, usize>,
}

#[derive(Default)]
struct Admission {
    /// Endpoints registered outside a run; they are replayed by every run.
    endpoints: Vec<BoundEndpoint>,
    /// Times each base name has been handed out.
    names: HashMap<String, usize>,
    running: Option<Running>,
}

impl Admission {
    fn unique_name(&mut self, base: String) -> String {
        let count = self.names.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base
        } else {
            format!("{base}-{count}")
        }
    }
}

/// Handle for registering endpoints, before or during a run.
///
/// Cheap to clone. Handlers that discover new work capture a clone and call
/// [`register`](Self::register) from inside the running extractor; the new
/// endpoint is queued immediately and runs before the run terminates.
#[derive(Clone, Default)]
pub struct Registrar {
    inner: Arc<Mutex<Admission>>,
}

impl Registrar {
    fn lock(&self) -> MutexGuard<'_, Admission> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registrar mutex");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Register an endpoint and return the display name it was given.
    ///
    /// Names are unique per extractor: a repeated name gets a `-2`, `-3`, ...
    /// suffix. During a run, fails if the endpoint's first URL cannot be built.
    ///
    /// A registration made during a run is only executed if the run has not
    /// already drained. Registering from a handler is always in time; one
    /// made from elsewhere may land after the last call finished, in which
    /// case it is dropped when the run ends and logged.
    pub fn register(&self, endpoint: BoundEndpoint) -> Result<String, AppError> {
        let mut admission = self.lock();
        let name = admission.unique_name(endpoint.name());
        let endpoint = endpoint.with_registered_name(&name);

        match &admission.running {
            Some(running) => {
                let url = endpoint.initial_url(&running.base_url)?;
                tracing::debug!(endpoint = %name, %url, "Endpoint admitted during run");
                running.queue.push(PendingCall::now(endpoint, url));
            }
            None => admission.endpoints.push(endpoint),
        }
        Ok(name)
    }

    /// Number of endpoints retained across runs.
    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.lock().running.is_some()
    }

    /// Switch to running and queue every retained endpoint. Endpoints whose
    /// first URL cannot be built are returned as failures.
    fn begin_run(
        &self,
        queue: &CallQueue,
        base_url: &str,
    ) -> Result<(usize, Vec<CallFailure>), AppError> {
        let mut admission = self.lock();
        if admission.running.is_some() {
            return Err(AppError::ConfigError(
                "extractor is already running".into(),
            ));
        }

        let mut failures = Vec::new();
        for endpoint in &admission.endpoints {
            match endpoint.initial_url(base_url) {
                Ok(url) => queue.push(PendingCall::now(endpoint.clone(), url)),
                Err(error) => failures.push(CallFailure {
                    endpoint: endpoint.name(),
                    error,
                }),
            }
        }
        let count = admission.endpoints.len();
        admission.running = Some(Running {
            queue: queue.clone(),
            base_url: base_url.to_string(),
            names_before: admission.names.clone(),
        });
        Ok((count, failures))
    }

    /// Leave the running state and forget names handed out during the run.
    /// Returns the calls still queued, which will never execute.
    fn end_run(&self) -> Vec<PendingCall> {
        let mut admission = self.lock();
        match admission.running.take() {
            Some(running) => {
                admission.names = running.names_before;
                running.queue.drain()
            }
            None => Vec::new(),
        }
    }
}

/// Ends the run on the registrar when dropped, including when the run
/// future itself is dropped before completing.
struct RunGuard<'a> {
    registrar: &'a Registrar,
    cancel: &'a CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let leftover = self.registrar.end_run();
        if leftover.is_empty() {
            return;
        }
        if self.cancel.is_cancelled() {
            tracing::debug!(calls = leftover.len(), "Discarding queued calls after cancellation");
            return;
        }
        for call in &leftover {
            tracing::warn!(
                endpoint = %call.endpoint.name(),
                url = %call.url,
                "Queued call discarded, the run ended before it was dispatched"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// RestExtractor
// ---------------------------------------------------------------------------

/// A polling REST extractor.
///
/// Generic over the HTTP client and the auth provider so tests can swap in
/// mocks; see [`testutil`](crate::testutil).
pub struct RestExtractor<C, A = NoAuth> {
    client: C,
    auth: A,
    config: ExtractorConfig,
    base_url: String,
    headers: Vec<(String, Template<String>)>,
    router: OutputRouter,
    registrar: Registrar,
    reporter: Arc<dyn RunReporter>,
    cancel: CancellationToken,
}

impl<C: HttpClient> RestExtractor<C, NoAuth> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            auth: NoAuth,
            config: ExtractorConfig::default(),
            base_url: String::new(),
            headers: Vec::new(),
            router: OutputRouter::default(),
            registrar: Registrar::default(),
            reporter: Arc::new(TracingRunReporter),
            cancel: CancellationToken::new(),
        }
    }
}

impl<C: HttpClient> RestExtractor<C, AuthenticationProvider<C>> {
    /// Build an extractor whose auth provider comes from `config.source.auth`.
    pub fn from_config(client: C, config: ExtractorConfig) -> Result<Self, AppError> {
        config.validate()?;
        let auth = AuthenticationProvider::new(config.source.auth.clone(), client.clone())?;
        Ok(RestExtractor::new(client).with_config(config).with_auth(auth))
    }
}

impl<C: HttpClient, A: AuthProvider> RestExtractor<C, A> {
    pub fn with_auth<A2: AuthProvider>(self, auth: A2) -> RestExtractor<C, A2> {
        RestExtractor {
            client: self.client,
            auth,
            config: self.config,
            base_url: self.base_url,
            headers: self.headers,
            router: self.router,
            registrar: self.registrar,
            reporter: self.reporter,
            cancel: self.cancel,
        }
    }

    pub fn with_config(mut self, config: ExtractorConfig) -> Self {
        self.config = config;
        self
    }

    /// Base URL that endpoint paths are resolved against.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Header sent with every request; endpoint and config headers override it.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .push((name.into(), Template::Literal(value.into())));
        self
    }

    pub fn with_header_with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.headers.push((name.into(), Template::computed(f)));
        self
    }

    pub fn with_router(mut self, router: OutputRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Token that stops the run. Cancelling is permanent for this token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// A handle for registering endpoints, including from inside handlers.
    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub fn register(&self, endpoint: BoundEndpoint) -> Result<String, AppError> {
        self.registrar.register(endpoint)
    }

    /// Execute every registered endpoint until the queue drains or the run
    /// is cancelled.
    ///
    /// Call failures do not stop other endpoints; they are collected and
    /// returned together as [`AppError::RunFailed`] once the run is over.
    pub async fn run(&self) -> Result<RunSummary, AppError> {
        self.config.validate()?;

        let queue = CallQueue::new();
        let (endpoints, initial_failures) = self.registrar.begin_run(&queue, &self.base_url)?;
        let running = RunGuard {
            registrar: &self.registrar,
            cancel: &self.cancel,
        };
        let parallelism = self.config.parallelism;
        self.reporter.report(RunEvent::Started {
            endpoints,
            parallelism,
        });

        let ctx = Arc::new(CallContext {
            client: self.client.clone(),
            auth: self.auth.clone(),
            router: self.router.clone(),
            retry: self.config.retry_policy(),
            headers: self.headers.clone(),
            source_headers: self.config.source.headers.clone(),
            base_url: self.base_url.clone(),
            queue: queue.clone(),
            reporter: Arc::clone(&self.reporter),
            cancel: self.cancel.clone(),
        });

        let mut state = RunState::default();
        for failure in initial_failures {
            self.reporter.report(RunEvent::CallFailed {
                endpoint: &failure.endpoint,
                error: &failure.error,
            });
            state.failures.push(failure);
        }

        self.dispatch(&ctx, &queue, &mut state).await;
        drop(running);

        self.reporter.report(RunEvent::Finished {
            calls: state.calls,
            items_routed: state.items_routed,
            failures: state.failures.len(),
        });

        if state.failures.is_empty() {
            Ok(RunSummary {
                calls: state.calls,
                items_routed: state.items_routed,
            })
        } else {
            Err(AppError::RunFailed(RunFailure {
                failures: state.failures,
            }))
        }
    }

    async fn dispatch(&self, ctx: &Arc<CallContext<C, A>>, queue: &CallQueue, state: &mut RunState) {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let poll_interval = self.config.poll_interval();
        let mut tasks = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next_with_id() {
                state.reap(joined);
            }

            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let call = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                pop = queue.pop_ready(poll_interval) => match pop {
                    Pop::Ready(call) => call,
                    Pop::Idle => break,
                    Pop::Timeout => continue,
                },
            };

            let guard = queue.in_flight_guard();
            let name = call.endpoint.name();
            let span = tracing::info_span!("call", endpoint = %name);
            let ctx = Arc::clone(ctx);
            let task_name = name.clone();
            let handle = tasks.spawn(
                async move {
                    let _permit = permit;
                    let _guard = guard;
                    let result = ctx.execute(&task_name, call).await;
                    (task_name, result)
                }
                .instrument(span),
            );
            state.names.insert(handle.id(), name);
        }

        if self.cancel.is_cancelled() {
            self.reporter.report(RunEvent::Cancelled);
        }
        while let Some(joined) = tasks.join_next_with_id().await {
            state.reap(joined);
        }
    }
}

type Joined = Result<(tokio::task::Id, (String, Result<usize, AppError>)), JoinError>;

#[derive(Default)]
struct RunState {
    calls: usize,
    items_routed: usize,
    failures: Vec<CallFailure>,
    names: HashMap<tokio::task::Id, String>,
}

impl RunState {
    fn reap(&mut self, joined: Joined) {
        match joined {
            Ok((id, (_, Ok(routed)))) => {
                self.names.remove(&id);
                self.calls += 1;
                self.items_routed += routed;
            }
            Ok((id, (_, Err(AppError::Cancelled)))) => {
                self.names.remove(&id);
                self.calls += 1;
            }
            Ok((id, (endpoint, Err(error)))) => {
                self.names.remove(&id);
                self.calls += 1;
                self.failures.push(CallFailure { endpoint, error });
            }
            Err(e) => {
                let endpoint = self
                    .names
                    .remove(&e.id())
                    .unwrap_or_else(|| "<unknown>".to_string());
                self.calls += 1;
                tracing::error!(%endpoint, error = %e, "Call task panicked");
                self.failures.push(CallFailure {
                    endpoint,
                    error: AppError::HandlerError(format!("call panicked: {e}")),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Call execution
// ---------------------------------------------------------------------------

struct CallContext<C, A> {
    client: C,
    auth: A,
    router: OutputRouter,
    retry: RetryPolicy,
    headers: Vec<(String, Template<String>)>,
    source_headers: BTreeMap<String, String>,
    base_url: String,
    queue: CallQueue,
    reporter: Arc<dyn RunReporter>,
    cancel: CancellationToken,
}

impl<C: HttpClient, A: AuthProvider> CallContext<C, A> {
    /// Execute one call and schedule its follow-up. Returns the number of
    /// records routed.
    async fn execute(&self, name: &str, call: PendingCall) -> Result<usize, AppError> {
        let result = self.execute_inner(name, &call).await;
        match &result {
            Ok(_) => {}
            Err(AppError::Cancelled) => {
                self.reporter.report(RunEvent::CallAbandoned { endpoint: name });
            }
            Err(error) => {
                self.reporter.report(RunEvent::CallFailed {
                    endpoint: name,
                    error,
                });
            }
        }
        result
    }

    async fn execute_inner(&self, name: &str, call: &PendingCall) -> Result<usize, AppError> {
        let endpoint = &call.endpoint;
        let url = call.url.to_string();
        self.reporter.report(RunEvent::CallStarted {
            endpoint: name,
            url: &url,
        });

        let url_text = url.as_str();
        let response = self
            .retry
            .execute(&self.cancel, move |attempt| async move {
                // Headers and body are rebuilt per attempt so producers run again.
                let request = self.prepare_request(endpoint, url_text).await?;
                tracing::debug!(attempt, method = %request.method, url = %url_text, "Sending request");
                let response = self.client.send(&request).await?;
                if !response.is_success() {
                    return Err(AppError::HttpStatus {
                        status: response.status,
                        url: url_text.to_string(),
                    });
                }
                Ok(response)
            })
            .await?;

        let processed = endpoint.process(&call.url, &response.body, &self.router)?;
        self.reporter.report(RunEvent::CallCompleted {
            endpoint: name,
            url: &url,
            routed: processed.routed,
        });

        if !self.cancel.is_cancelled() {
            self.schedule_follow_up(name, endpoint, processed.next)?;
        }
        Ok(processed.routed)
    }

    /// Queue the next page, or the next poll of an interval endpoint.
    fn schedule_follow_up(
        &self,
        name: &str,
        endpoint: &BoundEndpoint,
        next: Option<HttpUrl>,
    ) -> Result<(), AppError> {
        let interval = endpoint.interval();
        let url = match (next, interval) {
            (Some(url), _) => url,
            (None, Some(_)) => endpoint.initial_url(&self.base_url)?,
            (None, None) => return Ok(()),
        };

        self.reporter.report(RunEvent::FollowUpScheduled {
            endpoint: name,
            url: &url.to_string(),
            delay: interval,
        });
        let call = match interval {
            Some(interval) => PendingCall::at(endpoint.clone(), url, Instant::now() + interval),
            None => PendingCall::now(endpoint.clone(), url),
        };
        self.queue.push(call);
        Ok(())
    }

    /// Build the request for one attempt. Headers are applied in order, each
    /// layer overriding the previous: extractor, endpoint, config,
    /// `Authorization`, then `Content-Type` when a body is sent.
    async fn prepare_request(
        &self,
        endpoint: &BoundEndpoint,
        url: &str,
    ) -> Result<HttpRequest, AppError> {
        let mut headers = Vec::new();
        for (name, value) in &self.headers {
            set_header(&mut headers, name.clone(), value.resolve());
        }
        endpoint.apply_headers(&mut headers);
        for (name, value) in &self.source_headers {
            set_header(&mut headers, name.clone(), value.clone());
        }
        if self.auth.is_configured() {
            let value = self.auth.auth_header().await?;
            set_header(&mut headers, "Authorization".to_string(), value);
        }

        let body = endpoint.render_body()?;
        if body.is_some() {
            set_header(
                &mut headers,
                "Content-Type".to_string(),
                "application/json".to_string(),
            );
        }

        Ok(HttpRequest {
            method: endpoint.method(),
            url: url.to_string(),
            headers,
            body,
        })
    }
}
