//! Per-process scrape loop: claim a batch, fetch and extract each lead with
//! a pooled browser, write the batch back, repeat until the backlog is
//! drained or a limit is hit.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, warn};

use enricher::extract::{ContactExtractor, ExtractedContacts};
use enricher::pool::{BrowserDriver, BrowserPool};
use enricher::registry::{ServerRegistry, ServerStats};
use enricher::types::{ContactRecord, ScrapeStatus, WorkItem};
use enricher::{Config, ResultSink, WorkClaimCoordinator};

/// Consecutive claim failures tolerated before the run aborts. A database
/// that stays unreachable past this is fatal to the process.
const MAX_CLAIM_FAILURES: u32 = 5;

/// Totals for one orchestrator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
}

pub struct Orchestrator<D: BrowserDriver, E: ContactExtractor> {
    config: Config,
    coordinator: WorkClaimCoordinator,
    sink: ResultSink,
    registry: ServerRegistry,
    pool: Arc<BrowserPool<D>>,
    extractor: E,
    shutdown: watch::Receiver<bool>,
}

impl<D: BrowserDriver, E: ContactExtractor> Orchestrator<D, E> {
    pub fn new(
        config: Config,
        db: PgPool,
        driver: D,
        extractor: E,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pool = Arc::new(BrowserPool::new(driver, config.pool.clone()));
        Self {
            coordinator: WorkClaimCoordinator::new(db.clone()),
            sink: ResultSink::new(db.clone()),
            registry: ServerRegistry::new(db, config.server_name.clone()),
            pool,
            extractor,
            shutdown,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<BrowserPool<D>> {
        &self.pool
    }

    /// Run the scrape loop to completion.
    ///
    /// Claimed rows are released (the claim transaction commits) only after
    /// their results are durable in the sink, so a crash mid-batch returns
    /// the whole batch to the backlog.
    pub async fn run(self) -> Result<RunSummary> {
        self.registry.register().await?;
        self.pool.ensure_min().await;
        let maintenance = self.pool.spawn_maintenance();

        let mut summary = RunSummary::default();
        let result = self.drain(&mut summary).await;

        maintenance.abort();
        self.pool.shutdown().await;
        if let Err(err) = self.registry.deregister().await {
            warn!(error = %err, "deregister failed");
        }
        result?;

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            batches = summary.batches,
            "run finished"
        );
        Ok(summary)
    }

    async fn drain(&self, summary: &mut RunSummary) -> Result<()> {
        let started = Instant::now();
        let mut claim_failures = 0u32;

        loop {
            if *self.shutdown.borrow() {
                info!("shutdown requested, stopping before next claim");
                return Ok(());
            }

            let batch = match self
                .coordinator
                .claim_batch(self.config.claim_batch_size)
                .await
            {
                Ok(batch) => {
                    claim_failures = 0;
                    batch
                }
                Err(err) => {
                    claim_failures += 1;
                    if claim_failures >= MAX_CLAIM_FAILURES {
                        return Err(err.context("giving up after repeated claim failures"));
                    }
                    warn!(
                        failures = claim_failures,
                        error = %err,
                        "claim failed, backing off"
                    );
                    tokio::time::sleep(self.config.claim_retry_delay).await;
                    continue;
                }
            };

            if batch.is_empty() {
                batch.rollback().await?;
                info!("backlog drained");
                return Ok(());
            }

            info!(batch_size = batch.len(), "claimed batch");
            // items start in ascending id order; real concurrency is capped
            // twice, by the buffer width here and by pool acquisition
            let records: Vec<ContactRecord> = stream::iter(batch.items())
                .map(|item| self.process_item(item))
                .buffered(self.config.pool.max_instances.max(1))
                .collect()
                .await;

            let report = self.sink.upsert_batch(&records).await;
            batch.commit().await?;

            summary.batches += 1;
            summary.processed += records.len() as u64;
            summary.succeeded += records
                .iter()
                .filter(|r| r.status == ScrapeStatus::Success)
                .count() as u64;
            summary.failed += records
                .iter()
                .filter(|r| r.status == ScrapeStatus::Failed)
                .count() as u64;

            info!(
                written = report.written,
                dropped = report.failed,
                processed = summary.processed,
                "batch complete"
            );

            let elapsed_minutes = started.elapsed().as_secs_f64() / 60.0;
            let stats = ServerStats {
                processed: summary.processed,
                succeeded: summary.succeeded,
                failed: summary.failed,
                per_minute: if elapsed_minutes > 0.0 {
                    summary.processed as f64 / elapsed_minutes
                } else {
                    0.0
                },
            };
            if let Err(err) = self.registry.heartbeat(&stats).await {
                warn!(error = %err, "heartbeat failed");
            }

            if let Some(limit) = self.config.run_row_limit {
                if summary.processed >= limit {
                    info!(limit, "run row limit reached");
                    return Ok(());
                }
            }
        }
    }

    /// Scrape one lead. Never fails the loop: any error becomes a
    /// failed-status record so the lead is not retried forever.
    async fn process_item(&self, item: &WorkItem) -> ContactRecord {
        let item_started = Instant::now();

        let mut handle = match self.pool.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    lead_id = item.id,
                    place_id = %item.place_id,
                    error = %err,
                    "no browser instance available"
                );
                return ContactRecord::failed(
                    &item.place_id,
                    err.to_string(),
                    item_started.elapsed().as_secs_f64(),
                );
            }
        };

        let fetched = handle
            .fetch_page(&item.website, self.config.fetch_timeout)
            .await;

        let record = match fetched {
            Ok(page) => {
                let contacts = self.extractor.extract(&page.html, &item.website);
                let mut record = ContactRecord::new(&item.place_id);
                apply_contacts(&mut record, contacts);
                record.was_redirected = is_redirect(item.website.as_str(), &page.final_url);
                record.final_url = Some(page.final_url);
                record.pages_scraped = 1;
                record.processing_time_seconds = item_started.elapsed().as_secs_f64();
                record
            }
            Err(err) => {
                warn!(
                    lead_id = item.id,
                    place_id = %item.place_id,
                    url = %item.website,
                    error = %err,
                    "fetch failed"
                );
                ContactRecord::failed(
                    &item.place_id,
                    err.to_string(),
                    item_started.elapsed().as_secs_f64(),
                )
            }
        };

        self.pool.release(handle).await;
        record
    }
}

fn apply_contacts(record: &mut ContactRecord, contacts: ExtractedContacts) {
    record.emails = contacts.emails;
    record.phones = contacts.phones;
    record.whatsapp = contacts.whatsapp;
    record.facebook = contacts.facebook;
    record.instagram = contacts.instagram;
    record.linkedin = contacts.linkedin;
    record.twitter = contacts.twitter;
    record.tiktok = contacts.tiktok;
    record.youtube = contacts.youtube;
}

/// A bare trailing-slash difference is URL normalization, not a redirect.
fn is_redirect(requested: &str, final_url: &str) -> bool {
    requested.trim_end_matches('/') != final_url.trim_end_matches('/')
}
