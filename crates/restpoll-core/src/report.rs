use std::time::Duration;

use crate::error::AppError;

/// Events emitted by the extractor for monitoring/logging.
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    Started {
        endpoints: usize,
        parallelism: usize,
    },
    CallStarted {
        endpoint: &'a str,
        url: &'a str,
    },
    CallCompleted {
        endpoint: &'a str,
        url: &'a str,
        routed: usize,
    },
    CallFailed {
        endpoint: &'a str,
        error: &'a AppError,
    },
    /// A call was abandoned because the run was cancelled mid-retry.
    CallAbandoned {
        endpoint: &'a str,
    },
    FollowUpScheduled {
        endpoint: &'a str,
        url: &'a str,
        delay: Option<Duration>,
    },
    Cancelled,
    Finished {
        calls: usize,
        items_routed: usize,
        failures: usize,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::Started {
                endpoints,
                parallelism,
            } => {
                tracing::info!(%endpoints, %parallelism, "Run started");
            }
            RunEvent::CallStarted { endpoint, url } => {
                tracing::info!(%endpoint, %url, "Calling");
            }
            RunEvent::CallCompleted {
                endpoint,
                url,
                routed,
            } => {
                tracing::debug!(%endpoint, %url, %routed, "Call completed");
            }
            RunEvent::CallFailed { endpoint, error } => {
                tracing::error!(%endpoint, %error, "Call failed");
            }
            RunEvent::CallAbandoned { endpoint } => {
                tracing::info!(%endpoint, "Call abandoned after cancellation");
            }
            RunEvent::FollowUpScheduled {
                endpoint,
                url,
                delay,
            } => {
                let delay_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0);
                tracing::debug!(%endpoint, %url, %delay_ms, "Follow-up scheduled");
            }
            RunEvent::Cancelled => {
                tracing::info!("Run cancelled, waiting for in-flight calls");
            }
            RunEvent::Finished {
                calls,
                items_routed,
                failures,
            } => {
                if failures == 0 {
                    tracing::info!(%calls, %items_routed, "Run finished");
                } else {
                    tracing::warn!(%calls, %items_routed, %failures, "Run finished with failures");
                }
            }
        }
    }
}

/// Reporter that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentRunReporter;

impl RunReporter for SilentRunReporter {}
