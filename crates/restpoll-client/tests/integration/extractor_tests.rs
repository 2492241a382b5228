use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Json;
use restpoll_client::ReqwestClient;
use restpoll_core::config::{AuthConfig, BasicAuthConfig};
use restpoll_core::endpoint::CallResult;
use restpoll_core::sink::MemorySink;
use restpoll_core::{AppError, Endpoint, HttpUrl, OutputRouter, RawRow, RestExtractor, Row};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::common::{SHORT, fast_config, spawn_upstream};

#[derive(Debug, Deserialize)]
struct Page {
    items: Vec<Value>,
    next: Option<String>,
}

fn to_rows(table: &'static str) -> impl Fn(&Page) -> Result<RawRow, AppError> + Send + Sync {
    move |page| {
        let rows = page
            .items
            .iter()
            .map(|item| Row::from_json(item["id"].to_string(), item.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RawRow::many("db", table, rows))
    }
}

fn follow_next(call: &CallResult<Page>) -> Option<HttpUrl> {
    let cursor = call.response.next.as_ref()?;
    let mut url = call.url.clone();
    url.set_query("cursor", cursor.as_str());
    Some(url)
}

fn client() -> ReqwestClient {
    ReqwestClient::with_timeout(Duration::from_secs(5)).unwrap()
}

async fn pages(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    match params.get("cursor").map(String::as_str) {
        None => Json(json!({"items": [{"id": 1}, {"id": 2}], "next": "p2"})),
        Some("p2") => Json(json!({"items": [{"id": 3}], "next": "p3"})),
        Some(_) => Json(json!({"items": [{"id": 4}]})),
    }
}

#[tokio::test]
async fn follows_cursor_pages_over_http() {
    let base = spawn_upstream(Router::new().route("/pages", get(pages))).await;
    let sink = Arc::new(MemorySink::new());
    let extractor = RestExtractor::new(client())
        .with_config(fast_config())
        .with_base_url(base)
        .with_router(OutputRouter::new().with_raw_sink(sink.clone()));
    extractor
        .register(
            Endpoint::<Page>::get("pages")
                .next_page(follow_next)
                .handle(to_rows("pages")),
        )
        .unwrap();

    let summary = extractor.run().await.unwrap();

    assert_eq!(summary.calls, 3);
    assert_eq!(summary.items_routed, 4);
    let keys: Vec<String> = sink
        .rows_for("db", "pages")
        .into_iter()
        .map(|row| row.key)
        .collect();
    assert_eq!(keys.len(), 4);
    for key in ["1", "2", "3", "4"] {
        assert!(keys.iter().any(|k| k == key), "missing row {key}");
    }
}

#[tokio::test]
async fn top_level_list_is_wrapped() {
    let router = Router::new().route(
        "/list",
        get(|| async { Json(json!([{"id": "a"}, {"id": "b"}])) }),
    );
    let base = spawn_upstream(router).await;
    let sink = Arc::new(MemorySink::new());
    let extractor = RestExtractor::new(client())
        .with_config(fast_config())
        .with_base_url(base)
        .with_router(OutputRouter::new().with_raw_sink(sink.clone()));
    extractor
        .register(Endpoint::<Page>::get("list").handle(to_rows("list")))
        .unwrap();

    extractor.run().await.unwrap();
    assert_eq!(sink.rows_for("db", "list").len(), 2);
}

async fn flaky(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, Json<Value>) {
    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "busy"})))
    } else {
        (StatusCode::OK, Json(json!({"items": [{"id": 7}]})))
    }
}

#[tokio::test]
async fn unavailable_upstream_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route("/flaky", get(flaky))
        .with_state(hits.clone());
    let base = spawn_upstream(router).await;
    let sink = Arc::new(MemorySink::new());
    let extractor = RestExtractor::new(client())
        .with_config(fast_config())
        .with_base_url(base)
        .with_router(OutputRouter::new().with_raw_sink(sink.clone()));
    extractor
        .register(Endpoint::<Page>::get("flaky").handle(to_rows("flaky")))
        .unwrap();

    extractor.run().await.unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(sink.rows_for("db", "flaky").len(), 1);
}

#[tokio::test]
async fn persistent_errors_fail_the_run() {
    let router = Router::new().route(
        "/broken",
        get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "nope") }),
    );
    let base = spawn_upstream(router).await;
    let extractor = RestExtractor::new(client())
        .with_config(fast_config())
        .with_base_url(base);
    extractor
        .register(
            Endpoint::<Page>::get("broken")
                .name("broken")
                .handle(to_rows("broken")),
        )
        .unwrap();

    match extractor.run().await {
        Err(AppError::RunFailed(failure)) => {
            assert_eq!(failure.endpoints(), vec!["broken"]);
        }
        other => panic!("expected RunFailed, got {other:?}"),
    }
}

async fn secure(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Basic dXNlcjpwYXNz");
    let source = headers.get("x-source").and_then(|v| v.to_str().ok());
    if !authorized || source != Some("restpoll-tests") {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(json!({"items": [{"id": "secret"}]})))
}

#[tokio::test]
async fn configured_auth_and_headers_are_sent() {
    let base = spawn_upstream(Router::new().route("/secure", get(secure))).await;
    let mut config = fast_config();
    config
        .source
        .headers
        .insert("X-Source".into(), "restpoll-tests".into());
    config.source.auth = Some(AuthConfig {
        basic: Some(BasicAuthConfig {
            username: Some("user".into()),
            password: Some("pass".into()),
        }),
        oauth: None,
    });

    let sink = Arc::new(MemorySink::new());
    let extractor = RestExtractor::from_config(client(), config)
        .unwrap()
        .with_base_url(base)
        .with_router(OutputRouter::new().with_raw_sink(sink.clone()));
    extractor
        .register(Endpoint::<Page>::get("secure").handle(to_rows("secure")))
        .unwrap();

    extractor.run().await.unwrap();
    assert_eq!(sink.rows_for("db", "secure").len(), 1);
}

async fn echo(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({"items": [{"id": "echo", "body": body, "content_type": content_type}]}))
}

#[tokio::test]
async fn post_body_is_sent_as_json() {
    let base = spawn_upstream(Router::new().route("/echo", post(echo))).await;
    let sink = Arc::new(MemorySink::new());
    let extractor = RestExtractor::new(client())
        .with_config(fast_config())
        .with_base_url(base)
        .with_router(OutputRouter::new().with_raw_sink(sink.clone()));
    extractor
        .register(
            Endpoint::<Page>::post("echo", json!({"filter": {"kind": "pump"}, "limit": 10}))
                .handle(to_rows("echo")),
        )
        .unwrap();

    extractor.run().await.unwrap();

    let rows = sink.rows_for("db", "echo");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].columns["body"],
        json!({"filter": {"kind": "pump"}, "limit": 10})
    );
    assert_eq!(rows[0].columns["content_type"], json!("application/json"));
}

#[tokio::test]
async fn interval_endpoint_stops_on_cancel() {
    let hits = Arc::new(AtomicUsize::new(0));
    let router = Router::new()
        .route(
            "/status",
            get(|State(hits): State<Arc<AtomicUsize>>| async move {
                let n = hits.fetch_add(1, Ordering::SeqCst);
                Json(json!({"items": [{"id": n}]}))
            }),
        )
        .with_state(hits.clone());
    let base = spawn_upstream(router).await;
    let sink = Arc::new(MemorySink::new());
    let extractor = RestExtractor::new(client())
        .with_config(fast_config())
        .with_base_url(base)
        .with_router(OutputRouter::new().with_raw_sink(sink.clone()));
    extractor
        .register(
            Endpoint::<Page>::get("status")
                .interval(SHORT)
                .handle(to_rows("status")),
        )
        .unwrap();

    let cancel = extractor.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(SHORT * 5).await;
        cancel.cancel();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), extractor.run())
        .await
        .expect("run should stop after cancellation")
        .unwrap();

    let calls = hits.load(Ordering::SeqCst);
    assert!(calls >= 2, "expected repeated polls, got {calls}");
    assert_eq!(summary.calls, calls);
}
