use std::str::FromStr;

use chrono::{Duration, NaiveDate, Utc};
use kyora::accounting::fees::handle_order_payment;
use kyora::accounting::generator::emit_due;
use kyora::accounting::service::{AccountingService, CreateRecurringInput};
use kyora::accounting::summary::compute_summary;
use kyora::tenancy::Business;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

// key: accounting-tests -> backfill, tick idempotency, fees, safe-to-draw

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

async fn seed_business(pool: &PgPool, fee_percent: &str, fee_fixed: &str) -> Business {
    let workspace_id = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id, name) VALUES ($1, 'Atelier')")
        .bind(workspace_id)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query_as::<_, Business>(
        "INSERT INTO businesses \
         (id, workspace_id, descriptor, name, currency, fee_percent, fee_fixed) \
         VALUES ($1, $2, 'atelier', 'Atelier', 'USD', $3, $4) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(dec(fee_percent))
    .bind(dec(fee_fixed))
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn backfill_mints_history_and_parks_cursor(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;
    let service = AccountingService::new(pool.clone());

    let today = Utc::now().date_naive();
    let start = today - Duration::days(70);
    let template = service
        .create_recurring(
            &business,
            CreateRecurringInput {
                amount: dec("120.00"),
                currency: None,
                category: "rent".into(),
                frequency: "monthly".into(),
                recurring_start_date: start,
                recurring_end_date: None,
                note: Some("studio rent".into()),
                auto_create_historical_expenses: true,
            },
        )
        .await
        .unwrap();

    let occurrences: Vec<(NaiveDate,)> = sqlx::query_as(
        "SELECT occurred_on FROM expenses WHERE recurring_expense_id = $1 ORDER BY occurred_on",
    )
    .bind(template.id)
    .fetch_all(&pool)
    .await
    .unwrap();
    // 70 days back, monthly: three occurrences land on or before today.
    assert_eq!(occurrences.len(), 3);
    assert_eq!(occurrences[0].0, start);
    assert!(template.next_recurring_date > today);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn create_without_backfill_skips_history(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;
    let service = AccountingService::new(pool.clone());

    let today = Utc::now().date_naive();
    let template = service
        .create_recurring(
            &business,
            CreateRecurringInput {
                amount: dec("45.00"),
                currency: None,
                category: "utilities".into(),
                frequency: "weekly".into(),
                recurring_start_date: today - Duration::days(30),
                recurring_end_date: None,
                note: None,
                auto_create_historical_expenses: false,
            },
        )
        .await
        .unwrap();

    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM expenses WHERE recurring_expense_id = $1")
            .bind(template.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count.0, 0);
    assert!(template.next_recurring_date > today);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rejects_bad_amount_and_date_range(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;
    let service = AccountingService::new(pool.clone());
    let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();

    let err = service
        .create_recurring(
            &business,
            CreateRecurringInput {
                amount: dec("0"),
                currency: None,
                category: "rent".into(),
                frequency: "monthly".into(),
                recurring_start_date: start,
                recurring_end_date: None,
                note: None,
                auto_create_historical_expenses: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "accounting.invalid_amount");

    let err = service
        .create_recurring(
            &business,
            CreateRecurringInput {
                amount: dec("10"),
                currency: None,
                category: "rent".into(),
                frequency: "monthly".into(),
                recurring_start_date: start,
                recurring_end_date: Some(start),
                note: None,
                auto_create_historical_expenses: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "accounting.invalid_date_range");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn status_machine_round_trip(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;
    let service = AccountingService::new(pool.clone());

    let template = service
        .create_recurring(
            &business,
            CreateRecurringInput {
                amount: dec("10"),
                currency: None,
                category: "rent".into(),
                frequency: "monthly".into(),
                recurring_start_date: Utc::now().date_naive(),
                recurring_end_date: None,
                note: None,
                auto_create_historical_expenses: false,
            },
        )
        .await
        .unwrap();

    let template = service
        .update_status(business.id, template.id, "ended")
        .await
        .unwrap();
    assert_eq!(template.status, "ended");

    // ended -> paused is not in the matrix
    let err = service
        .update_status(business.id, template.id, "paused")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "recurring_expense.invalid_transition");

    let template = service
        .update_status(business.id, template.id, "active")
        .await
        .unwrap();
    assert_eq!(template.status, "active");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn tick_emits_once_and_advances(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;

    let today = Utc::now().date_naive();
    let template_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO recurring_expenses \
         (id, business_id, amount, currency, category, frequency, recurring_start_date, \
          next_recurring_date, status) \
         VALUES ($1, $2, $3, 'USD', 'rent', 'daily', $4, $4, 'active')",
    )
    .bind(template_id)
    .bind(business.id)
    .bind(dec("15.00"))
    .bind(today - Duration::days(2))
    .execute(&pool)
    .await
    .unwrap();

    let emitted = emit_due(&pool, today).await.unwrap();
    assert_eq!(emitted, 3, "two missed days plus today");

    // Replay: the unique occurrence index makes the tick a no-op.
    let emitted_again = emit_due(&pool, today).await.unwrap();
    assert_eq!(emitted_again, 0);

    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM expenses WHERE recurring_expense_id = $1")
            .bind(template_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count.0, 3);

    let cursor: (NaiveDate,) =
        sqlx::query_as("SELECT next_recurring_date FROM recurring_expenses WHERE id = $1")
            .bind(template_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(cursor.0, today + Duration::days(1));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn tick_marks_template_ended_past_end_date(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;

    let today = Utc::now().date_naive();
    let template_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO recurring_expenses \
         (id, business_id, amount, currency, category, frequency, recurring_start_date, \
          recurring_end_date, next_recurring_date, status) \
         VALUES ($1, $2, $3, 'USD', 'rent', 'daily', $4, $5, $6, 'active')",
    )
    .bind(template_id)
    .bind(business.id)
    .bind(dec("15.00"))
    .bind(today - Duration::days(10))
    .bind(today - Duration::days(4))
    .bind(today - Duration::days(5))
    .execute(&pool)
    .await
    .unwrap();

    emit_due(&pool, today).await.unwrap();

    let status: (String,) =
        sqlx::query_as("SELECT status FROM recurring_expenses WHERE id = $1")
            .bind(template_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status.0, "ended");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn transaction_fee_is_idempotent_per_order(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0.029", "0.30").await;

    let order_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO orders (id, business_id, total, cost_of_goods, currency, status, occurred_on) \
         VALUES ($1, $2, $3, 0, 'USD', 'paid', $4)",
    )
    .bind(order_id)
    .bind(business.id)
    .bind(dec("100.00"))
    .bind(Utc::now().date_naive())
    .execute(&pool)
    .await
    .unwrap();

    let today = Utc::now().date_naive();
    handle_order_payment(&pool, business.id, order_id, dec("100.00"), today)
        .await
        .unwrap();
    // Same event delivered twice.
    handle_order_payment(&pool, business.id, order_id, dec("100.00"), today)
        .await
        .unwrap();

    let fees: Vec<(Decimal,)> = sqlx::query_as(
        "SELECT amount FROM expenses \
         WHERE business_id = $1 AND order_id = $2 AND category = 'transaction_fee'",
    )
    .bind(business.id)
    .bind(order_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(fees.len(), 1, "exactly one fee per order");
    assert_eq!(fees[0].0, dec("3.20"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn zero_fee_configuration_is_a_noop(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;

    let order_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO orders (id, business_id, total, cost_of_goods, currency, status, occurred_on) \
         VALUES ($1, $2, $3, 0, 'USD', 'paid', $4)",
    )
    .bind(order_id)
    .bind(business.id)
    .bind(dec("100.00"))
    .bind(Utc::now().date_naive())
    .execute(&pool)
    .await
    .unwrap();

    handle_order_payment(&pool, business.id, order_id, dec("100.00"), Utc::now().date_naive())
        .await
        .unwrap();

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM expenses WHERE business_id = $1")
        .bind(business.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn summary_defaults_buffer_to_trailing_expenses(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;

    let from = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2025, 1, 31).unwrap();

    sqlx::query(
        "INSERT INTO orders (id, business_id, total, cost_of_goods, currency, status, occurred_on) \
         VALUES ($1, $2, $3, $4, 'USD', 'paid', $5)",
    )
    .bind(Uuid::new_v4())
    .bind(business.id)
    .bind(dec("2000.00"))
    .bind(dec("300.00"))
    .bind(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap())
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO expenses (id, business_id, amount, currency, occurred_on, category, expense_type) \
         VALUES ($1, $2, $3, 'USD', $4, 'rent', 'one_time')",
    )
    .bind(Uuid::new_v4())
    .bind(business.id)
    .bind(dec("500.00"))
    .bind(NaiveDate::from_ymd_opt(2025, 1, 20).unwrap())
    .execute(&pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO withdrawals (id, business_id, amount, currency, occurred_on) \
         VALUES ($1, $2, $3, 'USD', $4)",
    )
    .bind(Uuid::new_v4())
    .bind(business.id)
    .bind(dec("200.00"))
    .bind(NaiveDate::from_ymd_opt(2025, 1, 22).unwrap())
    .execute(&pool)
    .await
    .unwrap();

    let bundle = compute_summary(&pool, &business, Some(from), Some(to))
        .await
        .unwrap();
    // buffer defaults to the trailing-30-day expense sum (500), so
    // 2000 - 300 - 500 - 200 - 500 = 500
    assert_eq!(bundle.safe_to_draw_amount, dec("500.00"));
    assert_eq!(bundle.total_expenses, dec("500.00"));
    assert_eq!(bundle.total_withdrawals, dec("200.00"));
    assert_eq!(bundle.currency, "USD");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn summary_prefers_configured_buffer(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let business = seed_business(&pool, "0", "0").await;
    sqlx::query("UPDATE businesses SET safety_buffer = $2 WHERE id = $1")
        .bind(business.id)
        .bind(dec("100.00"))
        .execute(&pool)
        .await
        .unwrap();
    let business = sqlx::query_as::<_, Business>("SELECT * FROM businesses WHERE id = $1")
        .bind(business.id)
        .fetch_one(&pool)
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO orders (id, business_id, total, cost_of_goods, currency, status, occurred_on) \
         VALUES ($1, $2, $3, 0, 'USD', 'paid', $4)",
    )
    .bind(Uuid::new_v4())
    .bind(business.id)
    .bind(dec("1000.00"))
    .bind(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap())
    .execute(&pool)
    .await
    .unwrap();

    let bundle = compute_summary(
        &pool,
        &business,
        Some(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
        Some(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()),
    )
    .await
    .unwrap();
    assert_eq!(bundle.safe_to_draw_amount, dec("900.00"));
}
