//! Retry helpers for database operations.
//!
//! The operation name passed to [`retry_on_sqlite_busy`] is the store's
//! named-query label: it is attached to every log line and, when statement
//! tracing is enabled, to a `db.query` span covering the operation.

use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::{debug, Instrument};

use crate::{Error, Result};

const SQLITE_BUSY_MAX_RETRIES: usize = 12;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 2000;

/// Process-wide toggle for `db.query` span instrumentation.
static STATEMENT_TRACING: AtomicBool = AtomicBool::new(false);

/// Enable or disable `db.query` spans around store operations.
pub fn set_statement_tracing(enabled: bool) {
    STATEMENT_TRACING.store(enabled, Ordering::Relaxed);
}

fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Run a store operation, retrying on SQLITE_BUSY with exponential backoff
/// and jitter. `op_name` labels the operation in logs and spans.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let run = async {
        let mut attempt = 0usize;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_sqlite_busy_error(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                        return Err(err);
                    }

                    let exp_backoff_ms = SQLITE_BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt);
                    let capped_ms = exp_backoff_ms.min(SQLITE_BUSY_MAX_DELAY_MS);
                    let jitter_ms =
                        (random::<u64>() % (capped_ms / 4 + 1)).min(SQLITE_BUSY_MAX_DELAY_MS);
                    let delay = Duration::from_millis(
                        (capped_ms + jitter_ms).min(SQLITE_BUSY_MAX_DELAY_MS),
                    );

                    debug!(
                        "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                        op_name,
                        delay,
                        attempt + 1,
                        SQLITE_BUSY_MAX_RETRIES
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    };

    if STATEMENT_TRACING.load(Ordering::Relaxed) {
        run.instrument(tracing::debug_span!("db.query", query = op_name))
            .await
    } else {
        run.await
    }
}
