//! Server registry: each running scraper process advertises itself and its
//! throughput so the dashboard can see the fleet.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{debug, info};

/// Point-in-time run counters reported on each heartbeat.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub per_minute: f64,
}

pub struct ServerRegistry {
    pool: PgPool,
    name: String,
}

impl ServerRegistry {
    pub fn new(pool: PgPool, name: String) -> Self {
        Self { pool, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Announce this process. Re-registering under the same name (a restart)
    /// resets the counters and start time.
    pub async fn register(&self) -> Result<()> {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        sqlx::query(
            r#"
            INSERT INTO scraper_servers
                (name, host, pid, started_at, last_seen_at,
                 leads_processed, leads_succeeded, leads_failed, leads_per_minute)
            VALUES ($1, $2, $3, NOW(), NOW(), 0, 0, 0, 0)
            ON CONFLICT (name) DO UPDATE SET
                host = EXCLUDED.host,
                pid = EXCLUDED.pid,
                started_at = NOW(),
                last_seen_at = NOW(),
                leads_processed = 0,
                leads_succeeded = 0,
                leads_failed = 0,
                leads_per_minute = 0
            "#,
        )
        .bind(&self.name)
        .bind(&host)
        .bind(std::process::id() as i32)
        .execute(&self.pool)
        .await
        .context("Failed to register server")?;

        info!(server = %self.name, host = %host, "registered scraper server");
        Ok(())
    }

    pub async fn heartbeat(&self, stats: &ServerStats) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scraper_servers SET
                last_seen_at = NOW(),
                leads_processed = $2,
                leads_succeeded = $3,
                leads_failed = $4,
                leads_per_minute = $5
            WHERE name = $1
            "#,
        )
        .bind(&self.name)
        .bind(stats.processed as i64)
        .bind(stats.succeeded as i64)
        .bind(stats.failed as i64)
        .bind(stats.per_minute)
        .execute(&self.pool)
        .await
        .context("Failed to send server heartbeat")?;

        debug!(
            server = %self.name,
            processed = stats.processed,
            per_minute = stats.per_minute,
            "heartbeat"
        );
        Ok(())
    }

    /// Remove this process from the registry on clean shutdown.
    pub async fn deregister(&self) -> Result<()> {
        sqlx::query("DELETE FROM scraper_servers WHERE name = $1")
            .bind(&self.name)
            .execute(&self.pool)
            .await
            .context("Failed to deregister server")?;

        info!(server = %self.name, "deregistered scraper server");
        Ok(())
    }
}
