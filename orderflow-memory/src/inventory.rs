use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use orderflow::{
    CollaboratorError, DecrementOutcome, EventId, ProductId, ProductName, StockCheck,
    StockDecrement, StockLine, StockPreflight,
};
use parking_lot::Mutex;
use tracing::{instrument, warn};

#[derive(Debug, Clone)]
struct ProductStock {
    name: ProductName,
    on_hand: i64,
}

#[derive(Default)]
struct InventoryState {
    products: HashMap<ProductId, ProductStock>,
    processed: HashSet<EventId>,
}

/// In-memory catalog stock.
///
/// Serves as both the stock preflight collaborator and the store behind the
/// stock decrement consumer. Decrements are deduplicated per event and may
/// drive stock negative, since the preflight does not reserve.
#[derive(Clone, Default)]
pub struct InMemoryInventory {
    state: Arc<Mutex<InventoryState>>,
}

impl InMemoryInventory {
    /// Creates an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a product or replaces its stock level.
    pub fn set_stock(&self, product_id: ProductId, name: ProductName, on_hand: i64) {
        self.state
            .lock()
            .products
            .insert(product_id, ProductStock { name, on_hand });
    }

    /// Current stock of a product.
    pub fn stock_of(&self, product_id: &ProductId) -> Option<i64> {
        self.state
            .lock()
            .products
            .get(product_id)
            .map(|product| product.on_hand)
    }

    /// Number of distinct events applied.
    pub fn processed_events(&self) -> usize {
        self.state.lock().processed.len()
    }
}

#[async_trait]
impl StockPreflight for InMemoryInventory {
    async fn check(&self, lines: &[StockLine]) -> Result<StockCheck, CollaboratorError> {
        let state = self.state.lock();
        for line in lines {
            let requested = i64::from(line.quantity.into_inner());
            let Some(product) = state.products.get(&line.product_id) else {
                return Ok(StockCheck::Rejected {
                    product_id: line.product_id.clone(),
                    reason: format!("product {} not found", line.product_id),
                });
            };
            if product.on_hand < requested {
                return Ok(StockCheck::Rejected {
                    product_id: line.product_id.clone(),
                    reason: format!(
                        "insufficient stock for {} (available: {}, requested: {requested})",
                        product.name,
                        product.on_hand.max(0)
                    ),
                });
            }
        }
        Ok(StockCheck::Available)
    }
}

#[async_trait]
impl StockDecrement for InMemoryInventory {
    #[instrument(name = "memory.inventory.apply_decrement", skip_all, fields(event_id = %event_id))]
    async fn apply_decrement(
        &self,
        event_id: EventId,
        lines: &[StockLine],
    ) -> Result<DecrementOutcome, CollaboratorError> {
        let mut state = self.state.lock();
        if !state.processed.insert(event_id) {
            return Ok(DecrementOutcome::AlreadyApplied);
        }
        for line in lines {
            let quantity = i64::from(line.quantity.into_inner());
            match state.products.get_mut(&line.product_id) {
                Some(product) => {
                    product.on_hand -= quantity;
                    if product.on_hand < 0 {
                        warn!(
                            product_id = %line.product_id,
                            on_hand = product.on_hand,
                            "[memory.inventory.apply_decrement] stock went negative"
                        );
                    }
                }
                None => warn!(
                    product_id = %line.product_id,
                    "[memory.inventory.apply_decrement] unknown product skipped"
                ),
            }
        }
        Ok(DecrementOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow::Quantity;
    use proptest::prelude::*;

    fn product(id: &str) -> ProductId {
        ProductId::try_new(id).unwrap()
    }

    fn line(id: &str, quantity: u32) -> StockLine {
        StockLine {
            product_id: product(id),
            quantity: Quantity::try_new(quantity).unwrap(),
        }
    }

    fn inventory() -> InMemoryInventory {
        let inventory = InMemoryInventory::new();
        inventory.set_stock(product("sku-1"), ProductName::try_new("Desk lamp").unwrap(), 5);
        inventory.set_stock(product("sku-2"), ProductName::try_new("Chair").unwrap(), 1);
        inventory
    }

    #[tokio::test]
    async fn preflight_accepts_when_every_line_fits() {
        let check = inventory()
            .check(&[line("sku-1", 5), line("sku-2", 1)])
            .await
            .unwrap();
        assert_eq!(check, StockCheck::Available);
    }

    #[tokio::test]
    async fn one_short_line_rejects_the_request() {
        let check = inventory()
            .check(&[line("sku-1", 1), line("sku-2", 2)])
            .await
            .unwrap();
        match check {
            StockCheck::Rejected { product_id, reason } => {
                assert_eq!(product_id, product("sku-2"));
                assert!(reason.contains("Chair"));
            }
            StockCheck::Available => panic!("expected rejection"),
        }
    }

    #[tokio::test]
    async fn unknown_product_is_rejected() {
        let check = inventory().check(&[line("missing", 1)]).await.unwrap();
        assert!(matches!(check, StockCheck::Rejected { .. }));
    }

    #[tokio::test]
    async fn preflight_does_not_reserve() {
        let inventory = inventory();
        inventory.check(&[line("sku-1", 5)]).await.unwrap();
        assert_eq!(inventory.stock_of(&product("sku-1")), Some(5));
    }

    #[tokio::test]
    async fn decrement_is_applied_once_per_event() {
        let inventory = inventory();
        let event_id = EventId::generate();
        let lines = [line("sku-1", 2)];

        let first = inventory.apply_decrement(event_id, &lines).await.unwrap();
        let second = inventory.apply_decrement(event_id, &lines).await.unwrap();

        assert_eq!(first, DecrementOutcome::Applied);
        assert_eq!(second, DecrementOutcome::AlreadyApplied);
        assert_eq!(inventory.stock_of(&product("sku-1")), Some(3));
        assert_eq!(inventory.processed_events(), 1);
    }

    #[tokio::test]
    async fn decrement_may_drive_stock_negative() {
        let inventory = inventory();
        inventory
            .apply_decrement(EventId::generate(), &[line("sku-2", 3)])
            .await
            .unwrap();
        assert_eq!(inventory.stock_of(&product("sku-2")), Some(-2));
    }

    proptest! {
        #[test]
        fn prop_redelivered_decrements_apply_once(
            deliveries in prop::collection::vec((1u32..20, 1usize..4), 1..12),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let inventory = InMemoryInventory::new();
                inventory.set_stock(product("sku-1"), ProductName::try_new("Desk lamp").unwrap(), 100);

                let mut expected = 100;
                for (quantity, times) in &deliveries {
                    let event_id = EventId::generate();
                    for _ in 0..*times {
                        inventory
                            .apply_decrement(event_id, &[line("sku-1", *quantity)])
                            .await
                            .unwrap();
                    }
                    expected -= i64::from(*quantity);
                }

                prop_assert_eq!(inventory.stock_of(&product("sku-1")), Some(expected));
                prop_assert_eq!(inventory.processed_events(), deliveries.len());
                Ok(())
            })?;
        }
    }
}
