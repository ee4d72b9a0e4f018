use anyhow::Result;
use chrono::{Months, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{RecurringExpense, TYPE_RECURRING};
use super::status::RecurringStatus;

/// key: occurrence-generator -> backfill and scheduled tick

/// Naive calendar step: chrono clamps month-end (Jan 31 + 1 month = Feb 28).
pub fn next_occurrence(date: NaiveDate, frequency: &str) -> NaiveDate {
    match frequency {
        "daily" => date + chrono::Duration::days(1),
        "weekly" => date + chrono::Duration::days(7),
        "yearly" => date
            .checked_add_months(Months::new(12))
            .unwrap_or(date),
        _ => date.checked_add_months(Months::new(1)).unwrap_or(date),
    }
}

/// Insert one occurrence inside the caller's transaction. The unique index
/// on `(recurring_expense_id, occurred_on)` makes replays a no-op.
async fn insert_occurrence(
    tx: &mut Transaction<'_, Postgres>,
    template: &RecurringExpense,
    occurred_on: NaiveDate,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO expenses \
         (id, business_id, recurring_expense_id, amount, currency, occurred_on, category, expense_type, note) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (recurring_expense_id, occurred_on) WHERE recurring_expense_id IS NOT NULL \
         DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(template.business_id)
    .bind(template.id)
    .bind(template.amount)
    .bind(&template.currency)
    .bind(occurred_on)
    .bind(&template.category)
    .bind(TYPE_RECURRING)
    .bind(&template.note)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Historical occurrences from the start date up to today (or the end date),
/// leaving the cursor on the first step strictly after today. Runs in the
/// caller's transaction so a failed create stages nothing.
pub async fn backfill(
    tx: &mut Transaction<'_, Postgres>,
    template: &RecurringExpense,
    today: NaiveDate,
) -> Result<u64> {
    let mut emitted = 0u64;
    let mut step = template.recurring_start_date;
    while step <= today {
        if let Some(end) = template.recurring_end_date {
            if step > end {
                break;
            }
        }
        if insert_occurrence(tx, template, step).await? {
            emitted += 1;
        }
        step = next_occurrence(step, &template.frequency);
    }

    sqlx::query("UPDATE recurring_expenses SET next_recurring_date = $2, updated_at = NOW() WHERE id = $1")
        .bind(template.id)
        .bind(step)
        .execute(&mut **tx)
        .await?;

    Ok(emitted)
}

/// One scheduler tick: emit every due occurrence and advance cursors. A
/// template whose cursor passes its end date is marked ended.
pub async fn emit_due(pool: &PgPool, today: NaiveDate) -> Result<u64> {
    let due = sqlx::query_as::<_, RecurringExpense>(
        "SELECT * FROM recurring_expenses WHERE status = $1 AND next_recurring_date <= $2 \
         ORDER BY next_recurring_date ASC",
    )
    .bind(RecurringStatus::Active.as_str())
    .bind(today)
    .fetch_all(pool)
    .await?;

    let mut emitted = 0u64;
    for template in due {
        let mut tx = pool.begin().await?;
        let mut cursor = template.next_recurring_date;
        while cursor <= today {
            let past_end = template
                .recurring_end_date
                .map(|end| cursor > end)
                .unwrap_or(false);
            if past_end {
                break;
            }
            if insert_occurrence(&mut tx, &template, cursor).await? {
                emitted += 1;
            } else {
                debug!(template = %template.id, %cursor, "occurrence already emitted");
            }
            cursor = next_occurrence(cursor, &template.frequency);
        }

        let ended = template
            .recurring_end_date
            .map(|end| cursor > end)
            .unwrap_or(false);
        if ended {
            sqlx::query(
                "UPDATE recurring_expenses \
                 SET next_recurring_date = $2, status = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(template.id)
            .bind(cursor)
            .bind(RecurringStatus::Ended.as_str())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE recurring_expenses SET next_recurring_date = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(template.id)
            .bind(cursor)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
    }

    if emitted > 0 {
        info!(emitted, "recurring tick emitted expenses");
    }
    Ok(emitted)
}

pub fn spawn(pool: PgPool, interval_secs: u64) {
    let interval = TokioDuration::from_secs(interval_secs);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let today = Utc::now().date_naive();
            if let Err(err) = emit_due(&pool, today).await {
                warn!(?err, "recurring tick failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_and_weekly_step_by_days() {
        assert_eq!(next_occurrence(date(2025, 1, 1), "daily"), date(2025, 1, 2));
        assert_eq!(next_occurrence(date(2025, 1, 1), "weekly"), date(2025, 1, 8));
    }

    #[test]
    fn monthly_clamps_month_end() {
        assert_eq!(
            next_occurrence(date(2025, 1, 31), "monthly"),
            date(2025, 2, 28)
        );
        assert_eq!(
            next_occurrence(date(2024, 1, 31), "monthly"),
            date(2024, 2, 29)
        );
    }

    #[test]
    fn yearly_handles_leap_day() {
        assert_eq!(
            next_occurrence(date(2024, 2, 29), "yearly"),
            date(2025, 2, 28)
        );
        assert_eq!(
            next_occurrence(date(2025, 3, 1), "yearly"),
            date(2026, 3, 1)
        );
    }

    #[test]
    fn unknown_frequency_defaults_to_monthly() {
        assert_eq!(next_occurrence(date(2025, 4, 15), "bogus"), date(2025, 5, 15));
    }

    // The cursor walk used by backfill, checked without a database: steps
    // from the start date never skip and never emit past today or the end.
    #[test]
    fn backfill_step_walk_is_bounded() {
        let start = date(2025, 1, 10);
        let today = date(2025, 3, 20);
        let mut step = start;
        let mut steps = Vec::new();
        while step <= today {
            steps.push(step);
            step = next_occurrence(step, "monthly");
        }
        assert_eq!(steps, vec![date(2025, 1, 10), date(2025, 2, 10), date(2025, 3, 10)]);
        // first step strictly after today becomes the cursor
        assert_eq!(step, date(2025, 4, 10));
    }
}
