use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{error, warn};

use crate::error::{classify, retry_transient, DbWriteError};
use crate::types::ContactRecord;

/// Durable, idempotent write-back of scrape results, keyed by `place_id`.
///
/// Merge policy on conflict, preserved from the historical behavior:
/// - `emails` and `whatsapp` are concatenated onto the existing arrays.
///   Duplicates across repeated scrapes are expected and kept.
/// - `facebook`/`instagram`/`linkedin`/`twitter` fill in only if null.
/// - everything else (phones, tiktok, youtube, status, error, timing, page
///   counts, validation blobs) is overwritten by the newest scrape.
/// - `scrape_count` increments by exactly one per successful write.
pub struct ResultSink {
    pool: PgPool,
}

/// Outcome of a batch write after any per-record fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriteReport {
    pub written: usize,
    pub failed: usize,
}

const INSERT_PREFIX: &str = "\
    INSERT INTO lead_contacts (\
        place_id, emails, phones, whatsapp, \
        facebook, instagram, linkedin, twitter, tiktok, youtube, \
        validated_emails, validated_whatsapp, \
        final_url, was_redirected, status, error, \
        processing_time_seconds, pages_scraped, \
        email_count, phone_count, scrape_count, updated_at) ";

const ON_CONFLICT_SUFFIX: &str = "\
    ON CONFLICT (place_id) DO UPDATE SET \
        emails = lead_contacts.emails || EXCLUDED.emails, \
        whatsapp = lead_contacts.whatsapp || EXCLUDED.whatsapp, \
        phones = EXCLUDED.phones, \
        facebook = COALESCE(lead_contacts.facebook, EXCLUDED.facebook), \
        instagram = COALESCE(lead_contacts.instagram, EXCLUDED.instagram), \
        linkedin = COALESCE(lead_contacts.linkedin, EXCLUDED.linkedin), \
        twitter = COALESCE(lead_contacts.twitter, EXCLUDED.twitter), \
        tiktok = EXCLUDED.tiktok, \
        youtube = EXCLUDED.youtube, \
        validated_emails = EXCLUDED.validated_emails, \
        validated_whatsapp = EXCLUDED.validated_whatsapp, \
        final_url = EXCLUDED.final_url, \
        was_redirected = EXCLUDED.was_redirected, \
        status = EXCLUDED.status, \
        error = EXCLUDED.error, \
        processing_time_seconds = EXCLUDED.processing_time_seconds, \
        pages_scraped = EXCLUDED.pages_scraped, \
        email_count = COALESCE(cardinality(lead_contacts.emails || EXCLUDED.emails), 0), \
        phone_count = COALESCE(cardinality(EXCLUDED.phones), 0), \
        scrape_count = lead_contacts.scrape_count + 1, \
        updated_at = NOW()";

impl ResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-or-merge a single record, retrying transient failures.
    pub async fn upsert(&self, record: &ContactRecord) -> Result<(), DbWriteError> {
        retry_transient("contact upsert", || self.insert_rows(std::slice::from_ref(record))).await
    }

    /// Write a whole batch with one multi-row statement.
    ///
    /// The statement succeeds or fails as a unit; on failure (after the
    /// transient retries) each record is re-attempted individually so one
    /// poison record costs only itself.
    pub async fn upsert_batch(&self, records: &[ContactRecord]) -> BatchWriteReport {
        if records.is_empty() {
            return BatchWriteReport::default();
        }

        match retry_transient("contact batch upsert", || self.insert_rows(records)).await {
            Ok(()) => BatchWriteReport {
                written: records.len(),
                failed: 0,
            },
            Err(err) => {
                warn!(
                    records = records.len(),
                    error = %err,
                    "batch upsert failed, falling back to per-record writes"
                );
                self.upsert_individually(records).await
            }
        }
    }

    async fn upsert_individually(&self, records: &[ContactRecord]) -> BatchWriteReport {
        let mut report = BatchWriteReport::default();
        for record in records {
            match self.upsert(record).await {
                Ok(()) => report.written += 1,
                Err(DbWriteError::Integrity(err)) => {
                    error!(place_id = %record.place_id, error = %err, "constraint violation, record dropped");
                    report.failed += 1;
                }
                Err(err) => {
                    error!(place_id = %record.place_id, error = %err, "contact write failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn insert_rows(&self, records: &[ContactRecord]) -> Result<(), DbWriteError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_PREFIX);
        builder.push_values(records, |mut row, r| {
            row.push_bind(&r.place_id)
                .push_bind(&r.emails)
                .push_bind(&r.phones)
                .push_bind(&r.whatsapp)
                .push_bind(&r.facebook)
                .push_bind(&r.instagram)
                .push_bind(&r.linkedin)
                .push_bind(&r.twitter)
                .push_bind(&r.tiktok)
                .push_bind(&r.youtube)
                .push_bind(&r.validated_emails)
                .push_bind(&r.validated_whatsapp)
                .push_bind(&r.final_url)
                .push_bind(r.was_redirected)
                .push_bind(r.status.as_str())
                .push_bind(&r.error)
                .push_bind(r.processing_time_seconds)
                .push_bind(r.pages_scraped)
                .push_bind(r.email_count())
                .push_bind(r.phone_count())
                .push("1")
                .push("NOW()");
        });
        builder.push(ON_CONFLICT_SUFFIX);

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }
}
