//! PostgreSQL order ledger for `orderflow`
//!
//! Orders live in an `orders` table with their line items in `order_items`.
//! The idempotency key is unique, so a concurrent duplicate create resolves
//! to the order that committed first.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, SubsecRound, Utc};
use nutype::nutype;
use orderflow::{
    IdempotencyKey, ImageRef, LedgerError, LedgerOperation, LineItem, Money, NewOrder, Order,
    OrderId, OrderLedger, OrderQuery, OrderStats, OrderStatus, OrderTotals, Page, Pagination,
    ProductId, ProductName, PromoCode, Quantity, ShippingAddress, Timestamp, TransactionRef,
    UserId,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, Executor, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const ORDER_COLUMNS: &str = "id, idempotency_key, user_id, subtotal, discount_code, \
     discount_amount, total, status, shipping_address, payment_transaction, created_at, updated_at";

const ITEM_COLUMNS: &str = "order_id, product_id, product_name, image_ref, unit_price, quantity";

/// Errors setting up the ledger.
#[derive(Debug, Error)]
pub enum PostgresLedgerError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// Schema migrations failed.
    #[error("failed to run postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Must be at least 1, enforced by the `NonZeroU32` inner type.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Order ledger backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresOrderLedger {
    pool: Pool<Postgres>,
}

impl PostgresOrderLedger {
    /// Connects with default pool settings.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresLedgerError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with custom pool settings.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresLedgerError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresLedgerError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Creates or upgrades the schema.
    pub async fn migrate(&self) -> Result<(), PostgresLedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresLedgerError::MigrationFailed)
    }

    async fn fetch_order(&self, id: OrderId) -> Result<Order, LedgerError> {
        let operation = LedgerOperation::Read;
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = query(&sql)
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?
            .ok_or(LedgerError::NotFound(id))?;
        let mut items = load_items(&self.pool, vec![id.into_inner()], operation).await?;
        decode_order(&row, items.remove(&id.into_inner()).unwrap_or_default(), operation)
    }
}

#[async_trait]
impl OrderLedger for PostgresOrderLedger {
    #[instrument(name = "postgres.create", skip_all, fields(idempotency_key = %order.idempotency_key()))]
    async fn create(&self, order: NewOrder) -> Result<Order, LedgerError> {
        let operation = LedgerOperation::Create;
        // stored with microsecond precision
        let created_at = Timestamp::new(Utc::now().trunc_subsecs(6));
        let order = order.into_order(OrderId::generate(), created_at);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

        let inserted = query(
            "INSERT INTO orders (id, idempotency_key, user_id, subtotal, discount_code, \
             discount_amount, total, status, shipping_address, payment_transaction, created_at, \
             updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(order.id.into_inner())
        .bind(text(&order.idempotency_key))
        .bind(text(&order.user_id))
        .bind(order.totals.subtotal().amount())
        .bind(order.discount_code.as_ref().map(text))
        .bind(order.totals.discount_amount().amount())
        .bind(order.totals.total().amount())
        .bind(order.status.as_str())
        .bind(text(&order.shipping_address))
        .bind(text(&order.payment_transaction))
        .bind(*order.created_at.as_datetime())
        .bind(*order.updated_at.as_datetime())
        .execute(&mut *tx)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?;

        if inserted.rows_affected() == 0 {
            let existing: Uuid = query("SELECT id FROM orders WHERE idempotency_key = $1")
                .bind(text(&order.idempotency_key))
                .fetch_one(&mut *tx)
                .await
                .and_then(|row| row.try_get("id"))
                .map_err(|error| map_sqlx_error(error, operation))?;
            tx.rollback()
                .await
                .map_err(|error| map_sqlx_error(error, operation))?;
            warn!(
                existing = %existing,
                "[postgres.create] idempotency key already used"
            );
            return Err(LedgerError::DuplicateIdempotencyKey {
                key: order.idempotency_key,
                existing: OrderId::new(existing),
            });
        }

        for (position, item) in order.items.iter().enumerate() {
            let position = i32::try_from(position)
                .map_err(|error| LedgerError::InvariantViolated(error.to_string()))?;
            let quantity = i32::try_from(item.quantity.into_inner())
                .map_err(|error| LedgerError::InvariantViolated(error.to_string()))?;
            query(
                "INSERT INTO order_items (order_id, position, product_id, product_name, \
                 image_ref, unit_price, quantity) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(order.id.into_inner())
            .bind(position)
            .bind(text(&item.product_id))
            .bind(text(&item.product_name))
            .bind(text(&item.image_ref))
            .bind(item.unit_price.amount())
            .bind(quantity)
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

        info!(
            order_id = %order.id,
            items = order.items.len(),
            "[postgres.create] order stored"
        );
        Ok(order)
    }

    #[instrument(name = "postgres.get", skip(self))]
    async fn get(&self, id: OrderId) -> Result<Order, LedgerError> {
        self.fetch_order(id).await
    }

    #[instrument(name = "postgres.find_by_idempotency_key", skip_all)]
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, LedgerError> {
        let id: Option<Uuid> = query("SELECT id FROM orders WHERE idempotency_key = $1")
            .bind(text(key))
            .fetch_optional(&self.pool)
            .await
            .and_then(|row| row.map(|row| row.try_get("id")).transpose())
            .map_err(|error| map_sqlx_error(error, LedgerOperation::Read))?;
        match id {
            Some(id) => self.fetch_order(OrderId::new(id)).await.map(Some),
            None => Ok(None),
        }
    }

    #[instrument(name = "postgres.list", skip_all, fields(page = query.page.number()))]
    async fn list(&self, query: &OrderQuery) -> Result<Page<Order>, LedgerError> {
        let operation = LedgerOperation::Read;
        let status = query.status.map(OrderStatus::as_str);
        let user_id = query.user_id.as_ref().map(|user| text(user).to_owned());
        let filter = "($1::text IS NULL OR status = $1) AND ($2::text IS NULL OR user_id = $2)";

        let count_sql = format!("SELECT COUNT(*) AS total FROM orders WHERE {filter}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(status)
            .bind(user_id.clone())
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|error| map_sqlx_error(error, operation))?;

        let page_sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE {filter} \
             ORDER BY created_at DESC, id DESC LIMIT $3 OFFSET $4"
        );
        let offset = i64::try_from(query.page.offset()).unwrap_or(i64::MAX);
        let rows = sqlx::query(&page_sql)
            .bind(status)
            .bind(user_id)
            .bind(i64::from(query.page.size()))
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

        let ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| map_sqlx_error(error, operation))?;
        let mut items = load_items(&self.pool, ids.clone(), operation).await?;
        let orders = rows
            .iter()
            .zip(ids)
            .map(|(row, id)| decode_order(row, items.remove(&id).unwrap_or_default(), operation))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items: orders,
            pagination: Pagination::new(query.page, u64::try_from(total).unwrap_or_default()),
        })
    }

    #[instrument(name = "postgres.update_status", skip(self))]
    async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order, LedgerError> {
        let operation = LedgerOperation::UpdateStatus;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        let row = query(&sql)
            .bind(id.into_inner())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?
            .ok_or(LedgerError::NotFound(id))?;
        let mut items = load_items(&mut *tx, vec![id.into_inner()], operation).await?;
        let mut order = decode_order(&row, items.remove(&id.into_inner()).unwrap_or_default(), operation)?;

        order.transition(status, Timestamp::new(Utc::now().trunc_subsecs(6)))?;

        query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id.into_inner())
            .bind(order.status.as_str())
            .bind(*order.updated_at.as_datetime())
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, operation))?;

        info!(order_id = %id, status = %order.status, "[postgres.update_status] status changed");
        Ok(order)
    }

    #[instrument(name = "postgres.stats", skip(self))]
    async fn stats(&self, today: NaiveDate) -> Result<OrderStats, LedgerError> {
        let operation = LedgerOperation::Stats;
        let start = today.and_time(NaiveTime::MIN).and_utc();
        let end = start + chrono::Duration::days(1);

        let row = query(
            "SELECT COUNT(*) AS total_orders, \
             COALESCE(SUM(total), 0) AS total_revenue, \
             COALESCE(SUM(discount_amount), 0) AS total_discount, \
             COUNT(*) FILTER (WHERE created_at >= $1 AND created_at < $2) AS orders_today \
             FROM orders",
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?;

        let count = |column: &str| -> Result<u64, LedgerError> {
            let value: i64 = row
                .try_get(column)
                .map_err(|error| map_sqlx_error(error, operation))?;
            Ok(u64::try_from(value).unwrap_or_default())
        };
        let sum = |column: &str| -> Result<Money, LedgerError> {
            let value: Decimal = row
                .try_get(column)
                .map_err(|error| map_sqlx_error(error, operation))?;
            Money::new(value.min(Money::MAX_AMOUNT)).map_err(|error| unreadable(operation, error))
        };

        Ok(OrderStats {
            total_orders: count("total_orders")?,
            total_revenue: sum("total_revenue")?,
            total_discount: sum("total_discount")?,
            orders_today: count("orders_today")?,
        })
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|error| map_sqlx_error(error, LedgerOperation::Read))
    }
}

fn text(value: &impl AsRef<str>) -> &str {
    value.as_ref()
}

async fn load_items<'c, E>(
    executor: E,
    order_ids: Vec<Uuid>,
    operation: LedgerOperation,
) -> Result<HashMap<Uuid, Vec<LineItem>>, LedgerError>
where
    E: Executor<'c, Database = Postgres>,
{
    let mut items: HashMap<Uuid, Vec<LineItem>> = HashMap::new();
    if order_ids.is_empty() {
        return Ok(items);
    }
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ANY($1) \
         ORDER BY order_id, position"
    );
    let rows = query(&sql)
        .bind(order_ids)
        .fetch_all(executor)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?;
    for row in rows {
        let (order_id, item) = decode_item(&row, operation)?;
        items.entry(order_id).or_default().push(item);
    }
    Ok(items)
}

fn decode_item(row: &PgRow, operation: LedgerOperation) -> Result<(Uuid, LineItem), LedgerError> {
    let column = |error| map_sqlx_error(error, operation);
    let order_id: Uuid = row.try_get("order_id").map_err(column)?;
    let product_id: String = row.try_get("product_id").map_err(column)?;
    let product_name: String = row.try_get("product_name").map_err(column)?;
    let image_ref: String = row.try_get("image_ref").map_err(column)?;
    let unit_price: Decimal = row.try_get("unit_price").map_err(column)?;
    let quantity: i32 = row.try_get("quantity").map_err(column)?;

    let item = LineItem {
        product_id: ProductId::try_new(product_id).map_err(|e| unreadable(operation, e))?,
        product_name: ProductName::try_new(product_name).map_err(|e| unreadable(operation, e))?,
        image_ref: ImageRef::try_new(image_ref).map_err(|e| unreadable(operation, e))?,
        unit_price: Money::new(unit_price).map_err(|e| unreadable(operation, e))?,
        quantity: u32::try_from(quantity)
            .map_err(|e| unreadable(operation, e))
            .and_then(|quantity| {
                Quantity::try_new(quantity).map_err(|e| unreadable(operation, e))
            })?,
    };
    Ok((order_id, item))
}

fn decode_order(
    row: &PgRow,
    items: Vec<LineItem>,
    operation: LedgerOperation,
) -> Result<Order, LedgerError> {
    let column = |error| map_sqlx_error(error, operation);
    let id: Uuid = row.try_get("id").map_err(column)?;
    let idempotency_key: String = row.try_get("idempotency_key").map_err(column)?;
    let user_id: String = row.try_get("user_id").map_err(column)?;
    let subtotal: Decimal = row.try_get("subtotal").map_err(column)?;
    let discount_code: Option<String> = row.try_get("discount_code").map_err(column)?;
    let discount_amount: Decimal = row.try_get("discount_amount").map_err(column)?;
    let total: Decimal = row.try_get("total").map_err(column)?;
    let status: String = row.try_get("status").map_err(column)?;
    let shipping_address: String = row.try_get("shipping_address").map_err(column)?;
    let payment_transaction: String = row.try_get("payment_transaction").map_err(column)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(column)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(column)?;

    let money = |value: Decimal| Money::new(value).map_err(|e| unreadable(operation, e));
    let totals = OrderTotals::from_parts(money(subtotal)?, money(discount_amount)?, money(total)?)?;

    Ok(Order {
        id: OrderId::new(id),
        idempotency_key: IdempotencyKey::try_new(idempotency_key)
            .map_err(|e| unreadable(operation, e))?,
        user_id: UserId::try_new(user_id).map_err(|e| unreadable(operation, e))?,
        items,
        totals,
        discount_code: discount_code
            .map(PromoCode::try_new)
            .transpose()
            .map_err(|e| unreadable(operation, e))?,
        status: status
            .parse::<OrderStatus>()
            .map_err(|e| unreadable(operation, e))?,
        shipping_address: ShippingAddress::try_new(shipping_address)
            .map_err(|e| unreadable(operation, e))?,
        payment_transaction: TransactionRef::try_new(payment_transaction)
            .map_err(|e| unreadable(operation, e))?,
        created_at: Timestamp::new(created_at),
        updated_at: Timestamp::new(updated_at),
    })
}

fn unreadable(operation: LedgerOperation, detail: impl fmt::Display) -> LedgerError {
    error!(
        operation = %operation,
        detail = %detail,
        "[postgres.decode] stored row failed validation"
    );
    LedgerError::store(operation, format!("stored row failed validation: {detail}"))
}

fn map_sqlx_error(error: sqlx::Error, operation: LedgerOperation) -> LedgerError {
    if let sqlx::Error::Database(db_error) = &error {
        let code = db_error.code();
        // 23514: check constraint (ledger invariants)
        // 23505: unique constraint
        if matches!(code.as_deref(), Some("23514" | "23505")) {
            warn!(
                error = %db_error,
                "[postgres.constraint_violation] ledger constraint rejected the write"
            );
            return LedgerError::InvariantViolated(db_error.to_string());
        }
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    LedgerError::store(operation, error.to_string())
}
