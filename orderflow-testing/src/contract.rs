use std::fmt;
use std::time::Duration;

use orderflow::{
    ImageRef, IdempotencyKey, LedgerError, LineItem, Money, NewOrder, OrderId, OrderLedger,
    OrderQuery, OrderStatus, OrderTotals, PageRequest, ProductId, ProductName, PromoCode,
    Quantity, ShippingAddress, Timestamp, TransactionRef, UserId,
};
use uuid::Uuid;

/// A contract scenario that did not hold.
#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn fixture(scenario: &'static str, what: &'static str, error: impl fmt::Display) -> Self {
        Self::new(scenario, format!("unable to build {what}: {error}"))
    }

    fn ledger_error(scenario: &'static str, operation: &'static str, error: LedgerError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

/// Outcome of one contract scenario.
pub type ContractTestResult = Result<(), ContractTestFailure>;

fn contract_user(scenario: &'static str) -> Result<UserId, ContractTestFailure> {
    // unique per run so suites can share one database
    UserId::try_new(format!("contract-{}", Uuid::now_v7().simple()))
        .map_err(|error| ContractTestFailure::fixture(scenario, "user id", error))
}

fn contract_key(scenario: &'static str, label: &str) -> Result<IdempotencyKey, ContractTestFailure> {
    let raw = format!("contract::{scenario}::{label}::{}", Uuid::now_v7());
    IdempotencyKey::try_new(raw)
        .map_err(|error| ContractTestFailure::fixture(scenario, "idempotency key", error))
}

fn contract_order(
    scenario: &'static str,
    key: IdempotencyKey,
    user_id: UserId,
    unit_cents: u64,
    discount_cents: u64,
) -> Result<NewOrder, ContractTestFailure> {
    let unit_price = Money::from_cents(unit_cents)
        .map_err(|error| ContractTestFailure::fixture(scenario, "unit price", error))?;
    let quantity = Quantity::try_new(2)
        .map_err(|error| ContractTestFailure::fixture(scenario, "quantity", error))?;
    let item = LineItem {
        product_id: ProductId::try_new("contract-sku")
            .map_err(|error| ContractTestFailure::fixture(scenario, "product id", error))?,
        product_name: ProductName::try_new("Contract widget")
            .map_err(|error| ContractTestFailure::fixture(scenario, "product name", error))?,
        image_ref: ImageRef::try_new("https://img.example/widget.png")
            .map_err(|error| ContractTestFailure::fixture(scenario, "image ref", error))?,
        unit_price,
        quantity,
    };
    let subtotal = item
        .line_total()
        .map_err(|error| ContractTestFailure::fixture(scenario, "subtotal", error))?;
    let discount = Money::from_cents(discount_cents)
        .map_err(|error| ContractTestFailure::fixture(scenario, "discount", error))?;
    let totals = OrderTotals::new(subtotal, discount)
        .map_err(|error| ContractTestFailure::fixture(scenario, "totals", error))?;
    let discount_code = if discount.is_zero() {
        None
    } else {
        Some(
            PromoCode::try_new("CONTRACT10")
                .map_err(|error| ContractTestFailure::fixture(scenario, "promo code", error))?,
        )
    };
    let address = ShippingAddress::try_new("1 Contract Way, Testville")
        .map_err(|error| ContractTestFailure::fixture(scenario, "address", error))?;
    let transaction = TransactionRef::try_new(format!("TXN_{}", Uuid::now_v7().simple()))
        .map_err(|error| ContractTestFailure::fixture(scenario, "transaction", error))?;

    NewOrder::new(
        key,
        user_id,
        vec![item],
        totals,
        discount_code,
        address,
        transaction,
    )
    .map_err(|error| ContractTestFailure::fixture(scenario, "order", error))
}

/// A created order reads back by id and by idempotency key, unchanged.
pub async fn test_create_and_read_back<F, L>(make_ledger: F) -> ContractTestResult
where
    F: Fn() -> L + Send + Sync + Clone + 'static,
    L: OrderLedger + 'static,
{
    const SCENARIO: &str = "create_and_read_back";

    let ledger = make_ledger();
    let key = contract_key(SCENARIO, "single")?;
    let new_order = contract_order(SCENARIO, key.clone(), contract_user(SCENARIO)?, 2_500, 500)?;
    let expected_totals = new_order.totals();

    let created = ledger
        .create(new_order)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "create", error))?;

    if created.status != OrderStatus::Preparing {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("new order should be preparing, observed {}", created.status),
        ));
    }
    if created.totals != expected_totals {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "totals changed on create: expected total {}, observed {}",
                expected_totals.total(),
                created.total()
            ),
        ));
    }

    let fetched = ledger
        .get(created.id)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "get", error))?;
    if fetched.id != created.id || fetched.items != created.items || fetched.totals != created.totals
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "order read back by id differs from the created order",
        ));
    }

    let by_key = ledger
        .find_by_idempotency_key(&key)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "find_by_idempotency_key", error))?;
    match by_key {
        Some(order) if order.id == created.id => Ok(()),
        Some(order) => Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("key lookup returned order {} instead of {}", order.id, created.id),
        )),
        None => Err(ContractTestFailure::assertion(
            SCENARIO,
            "key lookup found nothing for a created order",
        )),
    }
}

/// A second create with a used key fails and names the existing order.
pub async fn test_duplicate_idempotency_key<F, L>(make_ledger: F) -> ContractTestResult
where
    F: Fn() -> L + Send + Sync + Clone + 'static,
    L: OrderLedger + 'static,
{
    const SCENARIO: &str = "duplicate_idempotency_key";

    let ledger = make_ledger();
    let key = contract_key(SCENARIO, "shared")?;
    let user = contract_user(SCENARIO)?;

    let first = ledger
        .create(contract_order(SCENARIO, key.clone(), user.clone(), 1_000, 0)?)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "create", error))?;

    match ledger
        .create(contract_order(SCENARIO, key, user.clone(), 1_000, 0)?)
        .await
    {
        Err(LedgerError::DuplicateIdempotencyKey { existing, .. }) if existing == first.id => {}
        Err(LedgerError::DuplicateIdempotencyKey { existing, .. }) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("duplicate reported order {existing} instead of {}", first.id),
            ));
        }
        Err(other) => {
            return Err(ContractTestFailure::ledger_error(SCENARIO, "create", other));
        }
        Ok(order) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("second create with the same key stored order {}", order.id),
            ));
        }
    }

    let page = ledger
        .list(&OrderQuery {
            user_id: Some(user),
            ..OrderQuery::default()
        })
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "list", error))?;
    if page.pagination.total_items != 1 {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!(
                "expected exactly one stored order, observed {}",
                page.pagination.total_items
            ),
        ));
    }

    Ok(())
}

/// Unknown ids and keys are reported as missing.
pub async fn test_missing_order<F, L>(make_ledger: F) -> ContractTestResult
where
    F: Fn() -> L + Send + Sync + Clone + 'static,
    L: OrderLedger + 'static,
{
    const SCENARIO: &str = "missing_order";

    let ledger = make_ledger();
    let missing = OrderId::generate();

    match ledger.get(missing).await {
        Err(LedgerError::NotFound(id)) if id == missing => {}
        Err(other) => return Err(ContractTestFailure::ledger_error(SCENARIO, "get", other)),
        Ok(order) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("get returned order {} for an unknown id", order.id),
            ));
        }
    }

    match ledger
        .update_status(missing, OrderStatus::Shipped)
        .await
    {
        Err(LedgerError::NotFound(_)) => {}
        Err(other) => {
            return Err(ContractTestFailure::ledger_error(SCENARIO, "update_status", other));
        }
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "update_status succeeded for an unknown id",
            ));
        }
    }

    let key = contract_key(SCENARIO, "unknown")?;
    let found = ledger
        .find_by_idempotency_key(&key)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "find_by_idempotency_key", error))?;
    if found.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "key lookup found an order for an unused key",
        ));
    }

    Ok(())
}

/// Status changes follow the lifecycle graph; rejected changes leave the order as is.
pub async fn test_status_transitions<F, L>(make_ledger: F) -> ContractTestResult
where
    F: Fn() -> L + Send + Sync + Clone + 'static,
    L: OrderLedger + 'static,
{
    const SCENARIO: &str = "status_transitions";

    let ledger = make_ledger();
    let order = ledger
        .create(contract_order(
            SCENARIO,
            contract_key(SCENARIO, "lifecycle")?,
            contract_user(SCENARIO)?,
            1_999,
            0,
        )?)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "create", error))?;

    let shipped = ledger
        .update_status(order.id, OrderStatus::Shipped)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "update_status", error))?;
    if shipped.status != OrderStatus::Shipped {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected shipped, observed {}", shipped.status),
        ));
    }

    match ledger
        .update_status(order.id, OrderStatus::Preparing)
        .await
    {
        Err(LedgerError::InvalidTransition { from, to, .. })
            if from == OrderStatus::Shipped && to == OrderStatus::Preparing => {}
        Err(other) => {
            return Err(ContractTestFailure::ledger_error(SCENARIO, "update_status", other));
        }
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "shipped order moved back to preparing",
            ));
        }
    }

    ledger
        .update_status(order.id, OrderStatus::Delivered)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "update_status", error))?;

    if ledger
        .update_status(order.id, OrderStatus::Cancelled)
        .await
        .is_ok()
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "delivered order accepted a further transition",
        ));
    }

    let stored = ledger
        .get(order.id)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "get", error))?;
    if stored.status != OrderStatus::Delivered {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("rejected transition changed status to {}", stored.status),
        ));
    }

    Ok(())
}

/// Listing is newest first, paginated and filterable by user and status.
pub async fn test_list_newest_first<F, L>(make_ledger: F) -> ContractTestResult
where
    F: Fn() -> L + Send + Sync + Clone + 'static,
    L: OrderLedger + 'static,
{
    const SCENARIO: &str = "list_newest_first";

    let ledger = make_ledger();
    let user = contract_user(SCENARIO)?;
    let mut created = Vec::new();
    for label in ["first", "second", "third"] {
        let order = ledger
            .create(contract_order(
                SCENARIO,
                contract_key(SCENARIO, label)?,
                user.clone(),
                1_000,
                0,
            )?)
            .await
            .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "create", error))?;
        created.push(order.id);
        // distinct creation timestamps
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first_page = ledger
        .list(&OrderQuery {
            user_id: Some(user.clone()),
            page: PageRequest::new(Some(1), Some(2), 20, 100),
            ..OrderQuery::default()
        })
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "list", error))?;

    let ids: Vec<OrderId> = first_page.items.iter().map(|order| order.id).collect();
    if ids != [created[2], created[1]] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected the two newest orders first, observed {ids:?}"),
        ));
    }
    let pagination = first_page.pagination;
    if pagination.total_items != 3 || pagination.total_pages != 2 || !pagination.has_next {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unexpected pagination on first page: {pagination:?}"),
        ));
    }

    let second_page = ledger
        .list(&OrderQuery {
            user_id: Some(user.clone()),
            page: PageRequest::new(Some(2), Some(2), 20, 100),
            ..OrderQuery::default()
        })
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "list", error))?;
    let ids: Vec<OrderId> = second_page.items.iter().map(|order| order.id).collect();
    if ids != [created[0]] || second_page.pagination.has_next || !second_page.pagination.has_prev {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("unexpected second page: {ids:?} {:?}", second_page.pagination),
        ));
    }

    ledger
        .update_status(created[1], OrderStatus::Cancelled)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "update_status", error))?;
    let cancelled = ledger
        .list(&OrderQuery {
            user_id: Some(user),
            status: Some(OrderStatus::Cancelled),
            ..OrderQuery::default()
        })
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "list", error))?;
    let ids: Vec<OrderId> = cancelled.items.iter().map(|order| order.id).collect();
    if ids != [created[1]] {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("status filter returned {ids:?}"),
        ));
    }

    Ok(())
}

/// Stats grow with every created order.
pub async fn test_stats_count_created_orders<F, L>(make_ledger: F) -> ContractTestResult
where
    F: Fn() -> L + Send + Sync + Clone + 'static,
    L: OrderLedger + 'static,
{
    const SCENARIO: &str = "stats_count_created_orders";

    let ledger = make_ledger();
    let today = Timestamp::now().date();
    let before = ledger
        .stats(today)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "stats", error))?;

    let user = contract_user(SCENARIO)?;
    for (label, discount) in [("plain", 0), ("discounted", 300)] {
        ledger
            .create(contract_order(
                SCENARIO,
                contract_key(SCENARIO, label)?,
                user.clone(),
                1_500,
                discount,
            )?)
            .await
            .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "create", error))?;
    }

    let after = ledger
        .stats(today)
        .await
        .map_err(|error| ContractTestFailure::ledger_error(SCENARIO, "stats", error))?;

    // other suites may write to the same store concurrently, so only lower
    // bounds hold
    if after.total_orders < before.total_orders + 2 || after.orders_today < before.orders_today + 2
    {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("order counts did not grow by two: before {before:?}, after {after:?}"),
        ));
    }
    let added_revenue = Money::from_cents(5_700)
        .map_err(|error| ContractTestFailure::fixture(SCENARIO, "revenue", error))?;
    let added_discount = Money::from_cents(300)
        .map_err(|error| ContractTestFailure::fixture(SCENARIO, "discount", error))?;
    let revenue_floor = before
        .total_revenue
        .checked_add(added_revenue)
        .map_err(|error| ContractTestFailure::fixture(SCENARIO, "revenue", error))?;
    let discount_floor = before
        .total_discount
        .checked_add(added_discount)
        .map_err(|error| ContractTestFailure::fixture(SCENARIO, "discount", error))?;
    if after.total_revenue < revenue_floor || after.total_discount < discount_floor {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("sums did not grow: before {before:?}, after {after:?}"),
        ));
    }

    Ok(())
}

/// Generates a module of tokio tests running every ledger contract against
/// ledgers built by `make_ledger`.
#[macro_export]
macro_rules! order_ledger_contract_tests {
    (suite = $suite:ident, make_ledger = $make_ledger:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_create_and_read_back, test_duplicate_idempotency_key, test_list_newest_first,
                test_missing_order, test_stats_count_created_orders, test_status_transitions,
            };

            #[tokio::test(flavor = "multi_thread")]
            async fn create_and_read_back_contract() {
                test_create_and_read_back($make_ledger)
                    .await
                    .expect("order ledger contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn duplicate_idempotency_key_contract() {
                test_duplicate_idempotency_key($make_ledger)
                    .await
                    .expect("order ledger contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn missing_order_contract() {
                test_missing_order($make_ledger)
                    .await
                    .expect("order ledger contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn status_transitions_contract() {
                test_status_transitions($make_ledger)
                    .await
                    .expect("order ledger contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn list_newest_first_contract() {
                test_list_newest_first($make_ledger)
                    .await
                    .expect("order ledger contract failed");
            }

            #[tokio::test(flavor = "multi_thread")]
            async fn stats_count_created_orders_contract() {
                test_stats_count_created_orders($make_ledger)
                    .await
                    .expect("order ledger contract failed");
            }
        }
    };
}

pub use order_ledger_contract_tests;
