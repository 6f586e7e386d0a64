//! mealmate - diagnostics CLI for the offline queue and response cache.
//!
//! Runs one command against the same data directory the app uses, so a
//! stuck queue can be inspected, flushed or cleared from a terminal.

use std::io;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mealmate_core::utils::{format_age, format_bytes, truncate_string};
use mealmate_core::{ApiContext, Config, Method, RequestOptions, StaticToken};

// ============================================================================
// Constants
// ============================================================================

/// Overrides `api_base_url` from the config file
const ENV_API_URL: &str = "MEALMATE_API_URL";

/// Bearer token sent with every request
const ENV_TOKEN: &str = "MEALMATE_TOKEN";

/// When set, logs are also written to a daily-rotated file in this directory
const ENV_LOG_DIR: &str = "MEALMATE_LOG_DIR";

/// Width of the URL column in `list` output
const URL_COLUMN_WIDTH: usize = 48;

const USAGE: &str = "\
Usage: mealmate <command>

Commands:
  status                        Show connectivity and pending request count
  list                          List queued requests
  flush                         Replay queued requests now
  clear                         Discard all queued requests
  get <path> [--no-cache]       Fetch a resource
  send <METHOD> <path> [json]   Send a write, queueing it if offline";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "mealmate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(url) = std::env::var(ENV_API_URL) {
        config.api_base_url = url;
    }
    Ok(config)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = load_config()?;
    let mut builder = ApiContext::builder(config);
    if let Ok(token) = std::env::var(ENV_TOKEN) {
        builder = builder.tokens(Arc::new(StaticToken::new(token)));
    }
    let ctx = builder.build()?;
    info!(command = %command, "mealmate starting");

    // A damaged cache must not block `clear` or `flush`.
    if let Err(e) = ctx.cache().hydrate().await {
        warn!(error = %e, "Failed to load response cache, starting empty");
    }
    ctx.connectivity().probe().await;

    match command.as_str() {
        "status" => status(&ctx).await,
        "list" => list(&ctx).await,
        "flush" => print_json(&ctx.retry_offline_requests().await?),
        "clear" => {
            let cleared = ctx.clear_all_offline_requests().await?;
            print_json(&json!({ "cleared": cleared }))
        }
        "get" => {
            let path = args.get(1).context("get requires a path")?;
            let options = if args.iter().any(|a| a == "--no-cache") {
                RequestOptions::new()
            } else {
                RequestOptions::cached()
            };
            print_json(&ctx.request(Method::Get, path, None, options).await)
        }
        "send" => {
            let (Some(method), Some(path)) = (args.get(1), args.get(2)) else {
                bail!("send requires a method and a path");
            };
            let method = Method::from_str(method)?;
            let body = args
                .get(3)
                .map(|raw| serde_json::from_str::<Value>(raw))
                .transpose()
                .context("Body is not valid JSON")?;
            print_json(&ctx.request(method, path, body, RequestOptions::offline()).await)
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }
}

async fn status(ctx: &ApiContext) -> Result<()> {
    let status = ctx.offline_status().await?;
    let state = ctx.connectivity().state();
    print_json(&json!({
        "isOnline": status.is_online,
        "lastCheckedAt": state.last_checked_at,
        "pendingCount": status.pending_count,
        "storageSize": status.storage_size,
        "storageSizeDisplay": format_bytes(status.storage_size),
        "cachedResponses": ctx.cache().len(),
    }))
}

async fn list(ctx: &ApiContext) -> Result<()> {
    let entries = ctx.pending_requests().await?;
    if entries.is_empty() {
        println!("No queued requests.");
        return Ok(());
    }
    let now = chrono::Utc::now();
    for entry in entries {
        println!(
            "{}  {:<6} {:<width$}  {}/{}  {}",
            entry.id,
            entry.method,
            truncate_string(&entry.url, URL_COLUMN_WIDTH),
            entry.attempts,
            entry.max_attempts,
            format_age(entry.created_at, now),
            width = URL_COLUMN_WIDTH,
        );
    }
    Ok(())
}
