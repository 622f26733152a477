use orderflow::{
    EventId, FulfillmentEvent, FulfillmentPublisher, IdempotencyKey, ImageRef, LedgerError,
    LedgerOperation, LineItem, Money, NewOrder, OrderId, OrderLedger, OrderTotals, ProductId,
    ProductName, PublishError, Quantity, ShippingAddress, StockLine, Timestamp, TransactionRef,
    UserId,
};
use orderflow_memory::InMemoryOrderLedger;
use orderflow_testing::chaos::{ChaosConfig, ChaosLedgerExt, ChaosPublisherExt};
use orderflow_testing::EventCollector;

fn new_order(key: &str) -> NewOrder {
    let item = LineItem {
        product_id: ProductId::try_new("sku-1").expect("valid product id"),
        product_name: ProductName::try_new("Desk lamp").expect("valid product name"),
        image_ref: ImageRef::try_new("").expect("valid image ref"),
        unit_price: Money::from_cents(4_500).expect("valid price"),
        quantity: Quantity::try_new(1).expect("valid quantity"),
    };
    let totals =
        OrderTotals::new(item.unit_price, Money::ZERO).expect("totals without a discount");
    NewOrder::new(
        IdempotencyKey::try_new(key).expect("valid key"),
        UserId::try_new("chaos-user").expect("valid user id"),
        vec![item],
        totals,
        None,
        ShippingAddress::try_new("1 Main St").expect("valid address"),
        TransactionRef::try_new("TXN_CHAOS").expect("valid transaction"),
    )
    .expect("valid order")
}

fn event() -> FulfillmentEvent {
    FulfillmentEvent {
        event_id: EventId::generate(),
        order_id: OrderId::generate(),
        user_id: UserId::try_new("chaos-user").expect("valid user id"),
        total: Money::from_cents(4_500).expect("valid total"),
        items: vec![StockLine {
            product_id: ProductId::try_new("sku-1").expect("valid product id"),
            quantity: Quantity::try_new(1).expect("valid quantity"),
        }],
        occurred_at: Timestamp::now(),
    }
}

#[tokio::test]
async fn chaos_mode_can_force_create_failure() {
    // Given: deterministic chaos forcing every write to fail
    let base = InMemoryOrderLedger::new();
    let ledger = base
        .clone()
        .with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));

    // When: creating an order through the chaos-enabled ledger
    let error = match ledger.create(new_order("chaos-create")).await {
        Ok(_) => panic!("expected chaos-enabled create to fail"),
        Err(err) => err,
    };

    // Then: the failure surfaces as a store failure and nothing was written
    assert!(matches!(
        error,
        LedgerError::StoreFailure {
            operation: LedgerOperation::Create,
            ..
        }
    ));
    assert!(base.is_empty());
}

#[tokio::test]
async fn chaos_mode_can_force_read_failure() {
    // Given: an order stored before chaos is switched on for reads
    let base = InMemoryOrderLedger::new();
    let order = base
        .create(new_order("chaos-read"))
        .await
        .expect("plain create succeeds");
    let ledger = base.with_chaos(ChaosConfig::deterministic().with_read_failure_probability(1.0));

    // When: reading it back through the chaos-enabled ledger
    let result = ledger.get(order.id).await;

    // Then: the read fails while writes would still pass
    assert!(matches!(
        result,
        Err(LedgerError::StoreFailure {
            operation: LedgerOperation::Read,
            ..
        })
    ));
}

#[tokio::test]
async fn chaos_mode_with_zero_probability_is_transparent() {
    // Given: chaos configured to never inject
    let ledger = InMemoryOrderLedger::new().with_chaos(ChaosConfig::deterministic());

    // When: creating and reading an order
    let created = ledger
        .create(new_order("chaos-transparent"))
        .await
        .expect("create passes through");
    let fetched = ledger.get(created.id).await.expect("get passes through");

    // Then: the wrapped ledger answers as usual
    assert_eq!(created, fetched);
}

#[tokio::test]
async fn chaos_publisher_can_force_broadcast_failure() {
    // Given: a collector behind a publisher that always fails
    let collector = EventCollector::new();
    let publisher = collector
        .clone()
        .with_publish_chaos(ChaosConfig::deterministic().with_failure_probability(1.0));

    // When: broadcasting an event
    let result = publisher.broadcast(&event()).await;

    // Then: the broadcast fails and the collector saw nothing
    assert!(matches!(result, Err(PublishError::Failed { .. })));
    assert!(collector.events().is_empty());
}

orderflow_testing::order_ledger_contract_tests!(
    suite = chaos_passthrough,
    make_ledger = || InMemoryOrderLedger::new().with_chaos(ChaosConfig::deterministic()),
);
