use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use crate::types::WorkItem;

/// Hands out disjoint batches of backlog leads across concurrently running
/// server processes.
///
/// Mutual exclusion comes from `pg_try_advisory_xact_lock` evaluated inside
/// the claim query's `WHERE` clause: rows already locked by another in-flight
/// transaction fail the try-lock and are silently excluded, so competing
/// claimers never wait on each other. The locks live exactly as long as the
/// claim transaction, which [`ClaimedBatch`] owns.
///
/// The lock keyspace is namespaced with `hashtext('leads')` as the class key
/// so backlog ids cannot collide with other advisory-lock users in the same
/// database.
pub struct WorkClaimCoordinator {
    pool: PgPool,
}

/// A claimed batch of leads plus the transaction that holds their locks.
///
/// The batch must be treated as one scoped unit of work: process the items,
/// then [`commit`](ClaimedBatch::commit) (or roll back) before claiming
/// again. Dropping the batch rolls the transaction back, so locks can never
/// outlive it.
pub struct ClaimedBatch {
    tx: Transaction<'static, Postgres>,
    items: Vec<WorkItem>,
}

impl ClaimedBatch {
    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// An empty batch means the filtered backlog is exhausted.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// End the unit of work, releasing all row locks.
    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("failed to commit claim transaction")
    }

    /// Release the locks without finishing the batch (e.g. on shutdown).
    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back claim transaction")
    }
}

// The materialized CTE fixes the id order; the outer query must not re-sort.
// A Sort node above the lock filter would evaluate the try-lock, and take
// the lock, on every candidate row before LIMIT applies.
const CLAIM_SQL: &str = r#"
    WITH candidates AS MATERIALIZED (
        SELECT l.id, l.payload
        FROM leads l
        LEFT JOIN lead_contacts c ON c.place_id = l.payload->>'place_id'
        WHERE c.place_id IS NULL
          AND COALESCE(l.payload->>'website', '') <> ''
        ORDER BY l.id
    )
    SELECT id, payload
    FROM candidates
    WHERE pg_try_advisory_xact_lock(hashtext('leads'), id)
    LIMIT $1
"#;

impl WorkClaimCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim up to `size` leads that have no contact record yet and a
    /// non-empty website URL, in ascending `id` order.
    ///
    /// Rows with an unparsable payload are skipped and logged, not claimed.
    /// On a database error the claim transaction is dropped (rolled back),
    /// which releases any locks the statement already took; the caller may
    /// retry after a short delay.
    pub async fn claim_batch(&self, size: i64) -> Result<ClaimedBatch> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open claim transaction")?;

        let rows = sqlx::query(CLAIM_SQL)
            .bind(size)
            .fetch_all(&mut *tx)
            .await
            .context("claim query failed")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i32 = row.get("id");
            let payload: serde_json::Value = row.get("payload");
            match WorkItem::from_row(id, payload) {
                Ok(item) => items.push(item),
                Err(err) => {
                    warn!(lead_id = id, error = %err, "skipping unscrapeable backlog row");
                }
            }
        }

        debug!(claimed = items.len(), requested = size, "claimed lead batch");
        Ok(ClaimedBatch { tx, items })
    }

    /// Leads with a website URL and no contact record yet.
    pub async fn pending_count(&self) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM leads l
            LEFT JOIN lead_contacts c ON c.place_id = l.payload->>'place_id'
            WHERE c.place_id IS NULL
              AND COALESCE(l.payload->>'website', '') <> ''
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to count pending leads")?;
        Ok(row.get("n"))
    }

    pub async fn total_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM leads")
            .fetch_one(&self.pool)
            .await
            .context("failed to count leads")?;
        Ok(row.get("n"))
    }

    /// Leads that already have a contact record.
    pub async fn completed_count(&self) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM leads l
            JOIN lead_contacts c ON c.place_id = l.payload->>'place_id'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("failed to count completed leads")?;
        Ok(row.get("n"))
    }
}
