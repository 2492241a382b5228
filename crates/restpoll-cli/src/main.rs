use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use restpoll_client::ReqwestClient;
use restpoll_core::endpoint::CallResult;
use restpoll_core::sink::JsonLinesSink;
use restpoll_core::{
    AppError, Endpoint, ExtractorConfig, HttpUrl, OutputRouter, RawRow, RestExtractor, Row,
};

#[derive(Parser)]
#[command(name = "restpoll", version, about = "Poll REST APIs and emit rows as JSON lines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll one endpoint and write every element as a raw row
    Poll {
        /// Absolute URL of the endpoint
        #[arg(short, long)]
        url: String,

        /// YAML extractor configuration (parallelism, retry, source headers and auth)
        #[arg(short, long, env = "RESTPOLL_CONFIG")]
        config: Option<PathBuf>,

        /// Re-issue the request every N seconds until Ctrl-C
        #[arg(short, long)]
        interval: Option<f64>,

        /// Response field holding the next-page cursor
        #[arg(long, requires = "cursor_param")]
        cursor_field: Option<String>,

        /// Query parameter the cursor is sent back in
        #[arg(long, requires = "cursor_field")]
        cursor_param: Option<String>,

        /// JSON pointer to the list of elements in each response
        #[arg(long, default_value = "/items")]
        items_pointer: String,

        /// Database name for emitted rows
        #[arg(long, default_value = "restpoll")]
        database: String,

        /// Table name for emitted rows
        #[arg(long, default_value = "items")]
        table: String,

        /// Element field used as the row key (defaults to the element index)
        #[arg(long)]
        key_field: Option<String>,

        /// Extra request header, as NAME:VALUE (repeatable)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
}

/// Options for building rows and pages out of untyped responses.
#[derive(Clone)]
struct PollOptions {
    items_pointer: String,
    database: String,
    table: String,
    key_field: Option<String>,
    cursor: Option<(String, String)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("restpoll=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Poll {
            url,
            config,
            interval,
            cursor_field,
            cursor_param,
            items_pointer,
            database,
            table,
            key_field,
            headers,
        } => {
            let config = match config {
                Some(path) => ExtractorConfig::from_file(&path)
                    .with_context(|| format!("Failed to load config: {}", path.display()))?,
                None => ExtractorConfig::default(),
            };
            let options = PollOptions {
                items_pointer,
                database,
                table,
                key_field,
                cursor: cursor_field.zip(cursor_param),
            };
            cmd_poll(&url, config, interval, headers, options).await?;
        }
    }

    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

async fn cmd_poll(
    url: &str,
    config: ExtractorConfig,
    interval: Option<f64>,
    headers: Vec<(String, String)>,
    options: PollOptions,
) -> Result<()> {
    HttpUrl::parse(url).with_context(|| format!("Invalid --url: {url}"))?;

    let client = ReqwestClient::new().context("Failed to create HTTP client")?;
    let sink = Arc::new(JsonLinesSink::new(std::io::stdout()));

    let mut extractor = RestExtractor::from_config(client, config)
        .context("Invalid extractor configuration")?
        .with_router(OutputRouter::new().with_raw_sink(sink));
    for (name, value) in headers {
        extractor = extractor.with_header(name, value);
    }

    let mut endpoint = Endpoint::<Value>::get(url).name("poll");
    if let Some(secs) = interval {
        let every = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .context("--interval must be a positive number of seconds")?;
        endpoint = endpoint.interval(every);
    }
    if let Some((field, param)) = options.cursor.clone() {
        endpoint = endpoint.next_page(move |call| next_cursor(call, &field, &param));
    }
    let handler_options = options.clone();
    extractor
        .register(endpoint.handle(move |response: &Value| to_rows(response, &handler_options)))
        .map_err(|e| anyhow::anyhow!(e))?;

    let cancel = extractor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping");
            cancel.cancel();
        }
    });

    let summary = extractor.run().await.map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(
        calls = summary.calls,
        rows = summary.items_routed,
        table = %options.table,
        "Poll complete"
    );

    Ok(())
}

/// Next page URL when the response carries a non-empty cursor.
fn next_cursor(call: &CallResult<Value>, field: &str, param: &str) -> Option<HttpUrl> {
    let cursor = match call.response.get(field)? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let mut url = call.url.clone();
    url.set_query(param, cursor);
    Some(url)
}

fn to_rows(response: &Value, options: &PollOptions) -> Result<RawRow, AppError> {
    let elements = match response.pointer(&options.items_pointer) {
        Some(Value::Array(items)) => items.as_slice(),
        Some(other) => std::slice::from_ref(other),
        None => {
            return Err(AppError::handler(format!(
                "no value at {} in response",
                options.items_pointer
            )));
        }
    };

    let rows = elements
        .iter()
        .enumerate()
        .map(|(index, element)| {
            let key = options
                .key_field
                .as_deref()
                .and_then(|field| element.get(field))
                .map(|value| match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| index.to_string());
            let columns = match element {
                Value::Object(_) => element.clone(),
                other => json!({ "value": other }),
            };
            Row::from_json(key, columns)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RawRow::many(&options.database, &options.table, rows))
}
