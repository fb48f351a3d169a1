//! tourcache - command-line front end for the offline tourist place cache.
//!
//! Works against the on-disk cache in `~/.cache/tourcache/<namespace>` and
//! syncs with `remoteBaseUrl`, or with the bundled dataset under `--demo`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tourcache_core::models::UserContext;
use tourcache_core::{
    BundledRemote, CacheConfig, FileStore, HttpRemote, OfflineService, PersistentStore,
    PreloadStrategy, RemoteDataSource, ResourceType,
};

// ============================================================================
// Constants
// ============================================================================

/// Simulated round trip for the bundled remote in demo mode
const DEMO_LATENCY_MS: u64 = 300;

const USAGE: &str = "\
Usage: tourcache [--demo] [--user <id>] <command>

Commands:
  status                 Cache and sync status
  refresh                Sync every dataset and drain the queue
  get <resource>         Print a dataset (tourist_places, enhanced_places,
                         categories, cities, user_data:<id>)
  preload <strategy>     essential | user-based | location-based | all
  cleanup [--aggressive] Evict least recently used entries
  queue                  Pending sync operations

Environment:
  RUST_LOG               Log filter (default: warn)
  TOURCACHE_LOG_DIR      Also write daily log files here
  TOURCACHE_*            Config overrides (see config.json)";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, filtered by RUST_LOG (default `warn`). When
/// TOURCACHE_LOG_DIR is set they are also written to a daily rolling file;
/// the returned guard must live until exit so buffered lines are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os("TOURCACHE_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tourcache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

struct Args {
    demo: bool,
    user: Option<String>,
    command: String,
    rest: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut demo = false;
    let mut user = None;
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--demo" => demo = true,
            "--user" => {
                user = Some(args.next().context("--user needs a value")?);
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            _ => positional.push(arg),
        }
    }

    if positional.is_empty() {
        bail!("No command given\n\n{}", USAGE);
    }
    let command = positional.remove(0);
    Ok(Args {
        demo,
        user,
        command,
        rest: positional,
    })
}

fn remote_for(config: &CacheConfig, demo: bool) -> Result<Arc<dyn RemoteDataSource>> {
    match (&config.remote_base_url, demo) {
        (Some(url), false) => {
            info!(url = %url, "Using HTTP remote");
            Ok(Arc::new(HttpRemote::new(url.clone(), config)?))
        }
        _ => {
            info!("Using bundled remote");
            let remote = BundledRemote::new()?.with_latency(Duration::from_millis(DEMO_LATENCY_MS));
            Ok(Arc::new(remote))
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();
    let args = parse_args()?;

    let mut config = CacheConfig::load()?;
    config.apply_env()?;
    config.validate()?;

    let cache_dir = config.cache_dir()?;
    let store: Arc<dyn PersistentStore> = Arc::new(
        FileStore::new(cache_dir.clone(), config.namespace.clone())
            .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))?,
    );
    let remote = remote_for(&config, args.demo)?;
    let user = args.user.map(UserContext::new);

    let (service, init) = OfflineService::start(store, remote, config, user).await?;
    info!(
        entries = init.entries_loaded,
        bootstrapped = init.bootstrapped,
        "tourcache starting"
    );

    let outcome = run(&service, &args.command, &args.rest).await;
    service.shutdown().await?;
    outcome
}

async fn run(service: &OfflineService, command: &str, rest: &[String]) -> Result<()> {
    match command {
        "status" => {
            let status = service.cache_status().await;
            let stats = service.get_statistics().await;
            print_json(&json!({ "status": status, "statistics": stats }))
        }

        "refresh" => {
            let result = service.refresh().await;
            print_json(&result)?;
            if !result.success {
                bail!(
                    "Sync incomplete: {} failed, {} requeued",
                    result.failed,
                    result.requeued
                );
            }
            Ok(())
        }

        "get" => {
            let resource: ResourceType = rest
                .first()
                .context("get needs a resource")?
                .parse::<ResourceType>()
                .map_err(anyhow::Error::msg)?;
            let records = service
                .get_records::<serde_json::Value>(&resource, false)
                .await?;
            let age = service.cache().cached_age(&resource.cache_key()).await;
            print_json(&json!({
                "fromCache": records.from_cache,
                "stale": records.stale,
                "needsUpdate": records.needs_update,
                "age": age,
                "metadata": records.metadata,
                "data": records.data,
            }))
        }

        "preload" => {
            let strategy: PreloadStrategy = rest
                .first()
                .map(String::as_str)
                .unwrap_or("essential")
                .parse::<PreloadStrategy>()?;
            print_json(&service.preload(strategy).await?)
        }

        "cleanup" => {
            let aggressive = rest.iter().any(|a| a == "--aggressive");
            print_json(&service.cleanup(aggressive).await?)
        }

        "queue" => {
            let engine = service.engine();
            print_json(&json!({
                "pending": engine.queue_snapshot().await,
                "manualConflicts": engine.manual_conflicts().await,
            }))
        }

        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}
