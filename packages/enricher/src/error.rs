use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// A database write failure, classed by how the caller should react.
///
/// Transient failures (lost connections, pool exhaustion, server shutdown)
/// are retried with backoff. Integrity failures (constraint violations) are
/// never retried. Everything else is a hard failure for the current unit.
#[derive(Debug, Error)]
pub enum DbWriteError {
    #[error("transient database error: {0}")]
    Transient(#[source] sqlx::Error),
    #[error("constraint violation: {0}")]
    Integrity(#[source] sqlx::Error),
    #[error("database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl DbWriteError {
    pub fn should_retry(&self) -> bool {
        matches!(self, DbWriteError::Transient(_))
    }
}

/// Classify a sqlx error by SQLSTATE class.
///
/// Class 08 = connection exception, 53 = insufficient resources, 57 =
/// operator intervention (e.g. database shutdown); all are worth retrying.
/// Class 23 = integrity constraint violation.
pub fn classify(err: sqlx::Error) -> DbWriteError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DbWriteError::Transient(err)
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) if code.starts_with("08") || code.starts_with("53") || code.starts_with("57") => {
                DbWriteError::Transient(err)
            }
            Some(code) if code.starts_with("23") => DbWriteError::Integrity(err),
            _ => DbWriteError::Other(err),
        },
        _ => DbWriteError::Other(err),
    }
}

/// Retries after the initial attempt: delays of 1s, 2s, 4s.
pub const MAX_WRITE_RETRIES: u32 = 3;

fn backoff_delay(retry: u32) -> Duration {
    Duration::from_secs(1u64 << retry)
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Non-transient failures return immediately.
pub async fn retry_transient<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, DbWriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbWriteError>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.should_retry() && retry < MAX_WRITE_RETRIES => {
                let delay = backoff_delay(retry);
                warn!(
                    op = op_name,
                    retry = retry + 1,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "transient database failure, backing off"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
