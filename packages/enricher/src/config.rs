use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Per-process connection cap. Kept small so the cluster-wide total
    /// across all scraper servers stays under the database's own ceiling.
    pub db_max_connections: u32,
    pub claim_batch_size: i64,
    /// Stop after this many leads in one run (`None` = drain the backlog).
    pub run_row_limit: Option<u64>,
    /// Identity reported to the server registry. Defaults to `host-pid`.
    pub server_name: String,
    /// Pause before retrying after a failed claim attempt.
    pub claim_retry_delay: Duration,
    /// Page-load budget for a single fetch.
    pub fetch_timeout: Duration,
    pub pool: PoolConfig,
    pub browser: BrowserLaunchConfig,
}

/// Bounds and health thresholds for the browser pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    pub acquire_timeout: Duration,
    /// Memory ceiling per instance, in megabytes.
    pub max_memory_mb: f64,
    pub max_open_pages: usize,
    /// An instance with this many recent errors is retired.
    pub max_error_count: u32,
    /// Instances are rotated out past this age even if otherwise healthy.
    pub max_lifetime: Duration,
    pub maintenance_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 1,
            max_instances: 3,
            acquire_timeout: Duration::from_secs(30),
            max_memory_mb: 1024.0,
            max_open_pages: 5,
            max_error_count: 3,
            max_lifetime: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// How Chromium instances are launched.
#[derive(Debug, Clone)]
pub struct BrowserLaunchConfig {
    pub headless: bool,
    /// Explicit executable path; otherwise well-known locations are probed.
    pub executable: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for BrowserLaunchConfig {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            extra_args: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 5)?,
            claim_batch_size: parse_var("CLAIM_BATCH_SIZE", 20)?,
            run_row_limit: match env::var("RUN_ROW_LIMIT") {
                Ok(v) => Some(v.parse().context("RUN_ROW_LIMIT must be a number")?),
                Err(_) => None,
            },
            server_name: env::var("SERVER_NAME").unwrap_or_else(|_| default_server_name()),
            claim_retry_delay: Duration::from_secs(parse_var("CLAIM_RETRY_DELAY_SECS", 5)?),
            fetch_timeout: Duration::from_secs(parse_var("FETCH_TIMEOUT_SECS", 30)?),
            pool: PoolConfig {
                min_instances: parse_var("POOL_MIN_INSTANCES", 1)?,
                max_instances: parse_var("POOL_MAX_INSTANCES", 3)?,
                acquire_timeout: Duration::from_secs(parse_var("POOL_ACQUIRE_TIMEOUT_SECS", 30)?),
                max_memory_mb: parse_var("BROWSER_MAX_MEMORY_MB", 1024.0)?,
                max_open_pages: parse_var("BROWSER_MAX_OPEN_PAGES", 5)?,
                max_error_count: parse_var("BROWSER_MAX_ERRORS", 3)?,
                max_lifetime: Duration::from_secs(parse_var("BROWSER_MAX_LIFETIME_SECS", 1800)?),
                maintenance_interval: Duration::from_secs(parse_var(
                    "POOL_MAINTENANCE_INTERVAL_SECS",
                    60,
                )?),
            },
            browser: BrowserLaunchConfig {
                headless: parse_var("BROWSER_HEADLESS", true)?,
                executable: env::var("BROWSER_EXECUTABLE").ok().map(PathBuf::from),
                extra_args: Vec::new(),
            },
        })
    }
}

fn default_server_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}-{}", host, std::process::id())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{} must be a valid value", name)),
        Err(_) => Ok(default),
    }
}
