//! defib - command-line front end for the GitHub access layer.

mod config;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use defibrillator::{Freshness, GitHubClient, RequestSpec};
use serde::Deserialize;
use tabled::Tabled;
use tabled::settings::Style;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "defib")]
#[command(version)]
#[command(about = "Rate-limit aware, cached GitHub API fetcher")]
#[command(
    long_about = "defib issues GitHub REST calls through a shared access layer that \
tracks rate limits, revalidates cached responses with ETags, follows \
Link-header pagination, and retries transient failures with backoff."
)]
#[command(after_long_help = r#"EXAMPLES
    Fetch a repository:
        $ defib get /repos/rust-lang/rust

    Search issues, two pages of 50:
        $ defib paginate /search/issues -p q="repo:rust-lang/rust is:open" \
              -p per_page=50 --item-key items --limit-pages 2

    Show remaining quota per resource:
        $ defib limits

    Force a fresh fetch of a cached resource:
        $ defib get /repos/rust-lang/rust --refresh

CONFIGURATION
    defib reads configuration from:
      1. ~/.config/defibrillator/config.toml (or $XDG_CONFIG_HOME/...)
      2. ./defibrillator.toml
      3. Environment variables (DEFIB_* prefix, e.g. DEFIB_GITHUB_TOKEN)

ENVIRONMENT VARIABLES
    DEFIB_GITHUB_TOKEN    GitHub personal access token
    GITHUB_TOKEN          Fallback token source
    GH_TOKEN              Fallback token source
"#)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a single resource and print the JSON payload
    Get {
        /// API path, e.g. /repos/rust-lang/rust
        path: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Drop any cached entry first, forcing a full fetch
        #[arg(long)]
        refresh: bool,
    },
    /// Walk a paginated listing and print the items as a JSON array
    Paginate {
        /// API path, e.g. /orgs/rust-lang/repos
        path: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
        /// Field holding the item array for object-shaped payloads
        #[arg(long)]
        item_key: Option<String>,
        /// Stop after this many pages
        #[arg(long)]
        limit_pages: Option<u32>,
    },
    /// Show current rate-limit status per resource
    Limits {
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Inspect or edit the conditional cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Drop the cached entry for one request
    Invalidate {
        /// API path the entry was cached under
        path: String,
        /// Query parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,
    },
    /// Drop every cached entry
    Clear,
    /// Print the cache file location
    Path,
}

/// Output format for rate limit display.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Display as a formatted table (default)
    #[default]
    Table,
    /// Display as JSON
    Json,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "defibrillator=debug,defibrillator_cli=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = config::Config::load();
    let client = GitHubClient::new(settings.client_config())?;

    match cli.command {
        Commands::Get {
            path,
            params,
            refresh,
        } => handle_get(&client, &path, params, refresh).await,
        Commands::Paginate {
            path,
            params,
            item_key,
            limit_pages,
        } => handle_paginate(&client, &path, params, item_key, limit_pages).await,
        Commands::Limits { output } => handle_limits(&client, output).await,
        Commands::Cache { action } => handle_cache(&client, action),
    }
}

async fn handle_get(
    client: &GitHubClient,
    path: &str,
    params: Vec<(String, String)>,
    refresh: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = RequestSpec::get(path).queries(params);
    if refresh {
        let _ = client.invalidate(&spec);
    }

    let fetched = client.execute(&spec).await?;
    if fetched.freshness == Freshness::Cached {
        tracing::debug!(url = %fetched.url, "served from cache (304)");
    }

    let value: serde_json::Value = fetched.json()?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn handle_paginate(
    client: &GitHubClient,
    path: &str,
    params: Vec<(String, String)>,
    item_key: Option<String>,
    limit_pages: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = RequestSpec::get(path).queries(params);

    let mut paginator = client.paginate(spec);
    if let Some(key) = item_key {
        paginator = paginator.item_key(key);
    }
    if let Some(limit) = limit_pages {
        paginator = paginator.limit_pages(limit);
    }

    let mut items: Vec<serde_json::Value> = Vec::new();
    let mut pages = 0u32;
    while let Some(mut page) = paginator.next_page::<serde_json::Value>().await? {
        pages += 1;
        tracing::debug!(page = pages, count = page.items.len(), "fetched page");
        items.append(&mut page.items);
    }

    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

/// Per-resource quota as reported by `/rate_limit`.
#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: BTreeMap<String, ResourceQuota>,
}

#[derive(Debug, Deserialize)]
struct ResourceQuota {
    limit: u64,
    #[serde(default)]
    used: u64,
    remaining: u64,
    reset: i64,
}

/// Rate limit information for display.
#[derive(Debug, Clone, serde::Serialize, Tabled)]
struct RateLimitDisplay {
    #[tabled(rename = "Resource")]
    #[serde(rename = "resource")]
    resource: String,
    #[tabled(rename = "Limit")]
    limit: u64,
    #[tabled(rename = "Used")]
    used: u64,
    #[tabled(rename = "Remaining")]
    remaining: u64,
    #[tabled(rename = "Usage %")]
    usage_percent: String,
    #[tabled(rename = "Resets At")]
    reset_at: String,
    #[tabled(rename = "Resets In")]
    reset_in: String,
}

async fn handle_limits(
    client: &GitHubClient,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response: RateLimitResponse = client.get_json(&RequestSpec::get("/rate_limit")).await?;

    let now = Utc::now();
    let rows: Vec<RateLimitDisplay> = response
        .resources
        .into_iter()
        .map(|(resource, quota)| {
            let usage = if quota.limit > 0 {
                (quota.used as f64 / quota.limit as f64) * 100.0
            } else {
                0.0
            };
            let reset_at = DateTime::from_timestamp(quota.reset, 0).unwrap_or(now);
            RateLimitDisplay {
                resource,
                limit: quota.limit,
                used: quota.used,
                remaining: quota.remaining,
                usage_percent: format!("{usage:.1}"),
                reset_at: reset_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                reset_in: humanize_seconds((reset_at - now).num_seconds().max(0)),
            }
        })
        .collect();

    match output {
        OutputFormat::Table => {
            let mut table = tabled::Table::new(&rows);
            let _ = table.with(Style::sharp());
            println!("{table}");
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

fn handle_cache(
    client: &GitHubClient,
    action: CacheAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        CacheAction::Invalidate { path, params } => {
            let spec = RequestSpec::get(&path).queries(params);
            if client.invalidate(&spec) {
                println!("invalidated {}", spec.cache_key());
            } else {
                println!("no cached entry for {}", spec.cache_key());
            }
        }
        CacheAction::Clear => {
            let count = client.cache().len();
            client.cache().clear();
            println!("cleared {count} cached entries");
        }
        CacheAction::Path => match client.cache().path() {
            Some(path) => println!("{}", path.display()),
            None => println!("(in-memory cache, persistence disabled)"),
        },
    }
    Ok(())
}

fn humanize_seconds(total: i64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
