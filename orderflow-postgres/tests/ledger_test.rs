mod common;

use common::{new_order, unique_user, PostgresTestFixture};
use orderflow::{LedgerError, OrderLedger, OrderQuery, OrderStatus, Timestamp};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

#[tokio::test]
async fn created_order_reads_back_identically() {
    // Given: a migrated ledger
    let fixture = PostgresTestFixture::new().await;
    let user = unique_user("readback");

    // When: creating a discounted two-line order
    let created = fixture
        .ledger
        .create(new_order("readback-1", user, 1_000))
        .await
        .expect("create should succeed");

    // Then: reading it back returns the same order, line items in order
    let fetched = fixture.ledger.get(created.id).await.expect("get should succeed");
    assert_eq!(fetched, created);
    assert_eq!(fetched.items[0].product_name.as_ref(), "Keyboard");
    assert_eq!(fetched.items[1].product_name.as_ref(), "Mouse");
    assert_eq!(fetched.total().to_cents(), 10_998);
}

#[tokio::test]
async fn concurrent_creates_with_one_key_store_one_order() {
    // Given: two creates racing on the same idempotency key
    let fixture = PostgresTestFixture::new().await;
    let user = unique_user("race");
    let first = fixture.ledger.clone();
    let second = fixture.ledger.clone();
    let a = new_order("race-key", user.clone(), 0);
    let b = new_order("race-key", user.clone(), 0);

    // When: both run at once
    let (a, b) = tokio::join!(first.create(a), second.create(b));

    // Then: exactly one wins and the loser names the winner
    let (winner, loser) = match (a, b) {
        (Ok(order), Err(error)) | (Err(error), Ok(order)) => (order, error),
        other => panic!("expected one success and one duplicate, got {other:?}"),
    };
    assert_eq!(
        loser,
        LedgerError::DuplicateIdempotencyKey {
            key: winner.idempotency_key.clone(),
            existing: winner.id,
        }
    );
    let page = fixture
        .ledger
        .list(&OrderQuery {
            user_id: Some(user),
            ..OrderQuery::default()
        })
        .await
        .expect("list should succeed");
    assert_eq!(page.pagination.total_items, 1);
}

#[tokio::test]
async fn schema_rejects_totals_that_do_not_add_up() {
    // Given: a direct connection bypassing the ledger's own checks
    let fixture = PostgresTestFixture::new().await;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&fixture.connection_string)
        .await
        .expect("should connect");

    // When: inserting an order whose total is not subtotal minus discount
    let result = sqlx::query(
        "INSERT INTO orders (id, idempotency_key, user_id, subtotal, discount_amount, total, \
         shipping_address, payment_transaction, created_at, updated_at) \
         VALUES ($1, 'bad-key', 'u', 100, 10, 95, 'addr', 'TXN_X', now(), now())",
    )
    .bind(Uuid::now_v7())
    .execute(&pool)
    .await;

    // Then: the check constraint refuses the row
    let error = result.expect_err("constraint should reject the row");
    let code = error
        .as_database_error()
        .and_then(|db| db.code().map(|code| code.into_owned()));
    assert_eq!(code.as_deref(), Some("23514"));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn status_changes_persist_and_follow_the_lifecycle() {
    // Given: a stored order
    let fixture = PostgresTestFixture::new().await;
    let order = fixture
        .ledger
        .create(new_order("lifecycle-1", unique_user("lifecycle"), 0))
        .await
        .expect("create should succeed");

    // When: cancelling it
    let cancelled = fixture
        .ledger
        .update_status(order.id, OrderStatus::Cancelled)
        .await
        .expect("cancel should succeed");

    // Then: the change is stored and the order is terminal
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.updated_at >= order.updated_at);
    let stored = fixture.ledger.get(order.id).await.expect("get should succeed");
    assert_eq!(stored.status, OrderStatus::Cancelled);
    assert!(matches!(
        fixture
            .ledger
            .update_status(order.id, OrderStatus::Shipped)
            .await,
        Err(LedgerError::InvalidTransition { .. })
    ));

    // And: the write path is logged
    assert!(logs_contain("[postgres.create] order stored"));
    assert!(logs_contain("[postgres.update_status] status changed"));
}

#[tokio::test]
async fn stats_sum_totals_and_discounts() {
    // Given: a fresh database with two orders
    let fixture = PostgresTestFixture::new().await;
    let user = unique_user("stats");
    fixture
        .ledger
        .create(new_order("stats-1", user.clone(), 0))
        .await
        .expect("create should succeed");
    fixture
        .ledger
        .create(new_order("stats-2", user, 1_998))
        .await
        .expect("create should succeed");

    // When: computing stats for today
    let stats = fixture
        .ledger
        .stats(Timestamp::now().date())
        .await
        .expect("stats should succeed");

    // Then: counts and sums cover both orders
    assert_eq!(stats.total_orders, 2);
    assert_eq!(stats.orders_today, 2);
    assert_eq!(stats.total_revenue.to_cents(), 11_998 + 10_000);
    assert_eq!(stats.total_discount.to_cents(), 1_998);
}

#[tokio::test]
async fn ping_reports_reachability() {
    // Given: a running database
    let fixture = PostgresTestFixture::new().await;

    // When/Then: ping succeeds
    fixture.ledger.ping().await.expect("ping should succeed");
}
