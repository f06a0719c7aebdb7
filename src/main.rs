//! Changelog Gateway - cached commit history for the site changelog
//!
//! # Usage
//! ```bash
//! changelog-gateway serve --settings changelog.json          # Start server
//! changelog-gateway fetch --settings changelog.json --page 2 # Print one page
//! changelog-gateway test-source --settings changelog.json    # Check the source
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use axum::Router;
use clap::{Args, Parser, Subcommand};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use changelog_gateway::cache::{CacheStore, FileCacheStore, FileLockStore, LockStore, MemoryCacheStore, MemoryLockStore};
use changelog_gateway::routes::{self, AppState};
use changelog_gateway::security::UrlPolicy;
use changelog_gateway::{ChangelogGateway, GatewayOptions, ProviderContext, SettingsMap};

/// Changelog Gateway - Cached, single-flight commit history
#[derive(Parser)]
#[command(name = "changelog-gateway")]
#[command(about = "Cached commit history from GitHub or a local git repository", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the changelog API
    Serve {
        #[command(flatten)]
        common: CommonArgs,

        /// Port to run the server on
        #[arg(short, long, default_value = "3001")]
        port: u16,
    },
    /// Fetch one page and print it as JSON
    Fetch {
        #[command(flatten)]
        common: CommonArgs,

        /// Page number (1-based)
        #[arg(long, default_value = "1")]
        page: u32,

        /// Include merge commits
        #[arg(long)]
        include_merges: bool,

        /// Filter as key=value (author, since, until, path, search)
        #[arg(long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },
    /// Build the provider and fetch the newest commit, bypassing the cache
    TestSource {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// JSON file holding the source settings map
    #[arg(short, long, value_name = "FILE")]
    settings: PathBuf,

    /// Directory shared by every gateway process for cache entries and locks
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Keep cache and locks in this process only
    #[arg(long, conflicts_with = "cache_dir")]
    memory_cache: bool,

    /// Longest wait for another caller's lock before serving stale data
    #[arg(long, default_value = "2000")]
    lock_wait_ms: u64,

    /// API host suffix the GitHub provider may call (repeatable, default api.github.com)
    #[arg(long = "allow-host", value_name = "HOST")]
    allow_hosts: Vec<String>,
}

fn read_settings(path: &Path) -> anyhow::Result<SettingsMap> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Settings file {} is not valid JSON", path.display()))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("Settings file {} must contain a JSON object", path.display()),
    }
}

fn parse_filters(raw: &[String]) -> anyhow::Result<HashMap<String, String>> {
    raw.iter()
        .map(|f| match f.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
            _ => bail!("Invalid filter {:?}, expected KEY=VALUE", f),
        })
        .collect()
}

async fn build_gateway(common: &CommonArgs) -> anyhow::Result<ChangelogGateway> {
    let (cache, locks): (Arc<dyn CacheStore>, Arc<dyn LockStore>) = if common.memory_cache {
        (Arc::new(MemoryCacheStore::default()), Arc::new(MemoryLockStore::new()))
    } else {
        let dir = common
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("changelog-gateway"));
        tracing::info!("Using cache directory {}", dir.display());
        let cache = FileCacheStore::open(&dir)
            .await
            .with_context(|| format!("Failed to open cache directory {}", dir.display()))?;
        let locks = FileLockStore::open(&dir)
            .await
            .with_context(|| format!("Failed to open lock directory {}", dir.display()))?;
        (Arc::new(cache), Arc::new(locks))
    };

    let options = GatewayOptions {
        lock_wait: Duration::from_millis(common.lock_wait_ms),
        ..GatewayOptions::default()
    };
    let ctx = ProviderContext {
        url_policy: UrlPolicy::allowlist(common.allow_hosts.iter().cloned()),
        ..ProviderContext::default()
    };
    Ok(ChangelogGateway::new(cache, locks, ctx).with_options(options))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing (quieter for production)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Fetch {
            common,
            page,
            include_merges,
            filters,
        } => {
            let settings = read_settings(&common.settings)?;
            let filters = parse_filters(&filters)?;
            let gateway = build_gateway(&common).await?;
            let page = gateway
                .fetch_page(&settings, page, include_merges, &filters)
                .await
                .map_err(|e| anyhow::anyhow!("{} ({})", e, e.kind()))?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            Ok(())
        }
        Commands::TestSource { common } => {
            let settings = read_settings(&common.settings)?;
            let gateway = build_gateway(&common).await?;
            let check = gateway.test_source(&settings).await;
            println!("{}", serde_json::to_string_pretty(&check)?);
            if !check.ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Serve { common, port } => serve(common, port).await,
    }
}

async fn serve(common: CommonArgs, port: u16) -> anyhow::Result<()> {
    let settings = read_settings(&common.settings)?;
    let gateway = build_gateway(&common).await?;

    // Fail at startup on unusable settings rather than on the first request.
    if let Err(e) = gateway.build_provider(&settings) {
        eprintln!("✗ Invalid changelog settings: {}", e);
        std::process::exit(1);
    }

    let state = Arc::new(AppState { gateway, settings });
    let app = Router::new()
        .merge(routes::create_router(state))
        .layer(TraceLayer::new_for_http());

    let addr = format!("127.0.0.1:{}", port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("✗ Failed to bind to port {}: {}", port, e);
            eprintln!("  Try a different port with --port <PORT>");
            std::process::exit(1);
        }
    };

    println!();
    println!("  Changelog gateway");
    println!("  Settings: {}", common.settings.display());
    println!("  Server:   http://{}/api/v1/changelog", addr);
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        println!("\n  Shutting down...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
