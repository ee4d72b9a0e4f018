use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, warn};

/// key: onboarding-sweeper -> ttl cleanup for signup sessions

const COMMITTED_RETENTION_HOURS: i64 = 24;

pub fn spawn(pool: PgPool, interval_secs: u64) {
    let interval = TokioDuration::from_secs(interval_secs);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match sweep(&pool, Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "onboarding sweep removed sessions"),
                Err(err) => warn!(?err, "onboarding sweep failed"),
            }
        }
    });
}

/// Delete expired sessions and committed sessions past the retention window.
pub async fn sweep(pool: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let expired = sqlx::query(
        "DELETE FROM onboarding_sessions WHERE committed_at IS NULL AND expires_at <= $1",
    )
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();

    let stale_committed = sqlx::query(
        "DELETE FROM onboarding_sessions WHERE committed_at IS NOT NULL AND committed_at <= $1",
    )
    .bind(now - Duration::hours(COMMITTED_RETENTION_HOURS))
    .execute(pool)
    .await?
    .rows_affected();

    Ok(expired + stale_committed)
}
