use std::time::Duration;

use axum::Router;
use restpoll_core::ExtractorConfig;
use restpoll_core::config::RetryConfig;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test upstream");
    });
    format!("http://{addr}/")
}

/// Config with short retry delays so failure paths finish quickly.
pub fn fast_config() -> ExtractorConfig {
    ExtractorConfig {
        parallelism: 4,
        poll_interval_secs: 0.05,
        retry: RetryConfig {
            tries: 3,
            delay_secs: 0.01,
            max_delay_secs: 0.05,
            backoff: 2.0,
            jitter_secs: 0.0,
        },
        ..Default::default()
    }
}

pub const SHORT: Duration = Duration::from_millis(50);
