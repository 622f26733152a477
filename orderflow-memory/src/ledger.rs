use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use orderflow::{
    IdempotencyKey, LedgerError, NewOrder, Order, OrderId, OrderLedger, OrderQuery, OrderStats,
    OrderStatus, Page, Pagination, Timestamp,
};
use parking_lot::RwLock;
use tracing::{debug, instrument};

#[derive(Default)]
struct LedgerState {
    // insertion order is creation order
    orders: Vec<Order>,
    by_id: HashMap<OrderId, usize>,
    by_key: HashMap<IdempotencyKey, OrderId>,
}

/// Thread-safe in-memory order ledger.
#[derive(Clone, Default)]
pub struct InMemoryOrderLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryOrderLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    pub fn len(&self) -> usize {
        self.state.read().orders.len()
    }

    /// True when no orders are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored order, oldest first.
    pub fn orders(&self) -> Vec<Order> {
        self.state.read().orders.clone()
    }
}

#[async_trait]
impl OrderLedger for InMemoryOrderLedger {
    #[instrument(name = "memory.ledger.create", skip_all, fields(idempotency_key = %order.idempotency_key()))]
    async fn create(&self, order: NewOrder) -> Result<Order, LedgerError> {
        let mut state = self.state.write();
        if let Some(existing) = state.by_key.get(order.idempotency_key()) {
            return Err(LedgerError::DuplicateIdempotencyKey {
                key: order.idempotency_key().clone(),
                existing: *existing,
            });
        }

        let order = order.into_order(OrderId::generate(), Timestamp::now());
        let index = state.orders.len();
        state.by_id.insert(order.id, index);
        state
            .by_key
            .insert(order.idempotency_key.clone(), order.id);
        state.orders.push(order.clone());
        debug!(order_id = %order.id, "[memory.ledger.create] order stored");
        Ok(order)
    }

    async fn get(&self, id: OrderId) -> Result<Order, LedgerError> {
        let state = self.state.read();
        state
            .by_id
            .get(&id)
            .map(|index| state.orders[*index].clone())
            .ok_or(LedgerError::NotFound(id))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, LedgerError> {
        let state = self.state.read();
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.by_id.get(id))
            .map(|index| state.orders[*index].clone()))
    }

    async fn list(&self, query: &OrderQuery) -> Result<Page<Order>, LedgerError> {
        let state = self.state.read();
        let matching: Vec<&Order> = state
            .orders
            .iter()
            .rev()
            .filter(|order| query.matches(order))
            .collect();
        let total_items = matching.len() as u64;
        let offset = usize::try_from(query.page.offset()).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(query.page.size() as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            pagination: Pagination::new(query.page, total_items),
        })
    }

    #[instrument(name = "memory.ledger.update_status", skip(self))]
    async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order, LedgerError> {
        let mut state = self.state.write();
        let index = *state.by_id.get(&id).ok_or(LedgerError::NotFound(id))?;
        let order = &mut state.orders[index];
        order.transition(status, Timestamp::now())?;
        Ok(order.clone())
    }

    async fn stats(&self, today: NaiveDate) -> Result<OrderStats, LedgerError> {
        Ok(OrderStats::from_orders(&self.state.read().orders, today))
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderflow::{
        ImageRef, LineItem, Money, OrderTotals, PageRequest, ProductId, ProductName, Quantity,
        ShippingAddress, TransactionRef, UserId,
    };

    fn new_order(key: &str, user: &str, cents: u64) -> NewOrder {
        let item = LineItem {
            product_id: ProductId::try_new("sku-1").unwrap(),
            product_name: ProductName::try_new("Desk lamp").unwrap(),
            image_ref: ImageRef::try_new("").unwrap(),
            unit_price: Money::from_cents(cents).unwrap(),
            quantity: Quantity::try_new(1).unwrap(),
        };
        NewOrder::new(
            IdempotencyKey::try_new(key).unwrap(),
            UserId::try_new(user).unwrap(),
            vec![item],
            OrderTotals::new(Money::from_cents(cents).unwrap(), Money::ZERO).unwrap(),
            None,
            ShippingAddress::try_new("1 Main St").unwrap(),
            TransactionRef::try_new(format!("TXN_{key}")).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_get() {
        let ledger = InMemoryOrderLedger::new();
        let order = ledger.create(new_order("k1", "u1", 1_000)).await.unwrap();

        assert_eq!(order.status, OrderStatus::Preparing);
        assert_eq!(ledger.get(order.id).await.unwrap(), order);
        assert_eq!(
            ledger
                .find_by_idempotency_key(&order.idempotency_key)
                .await
                .unwrap(),
            Some(order)
        );
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_is_rejected() {
        let ledger = InMemoryOrderLedger::new();
        let first = ledger.create(new_order("k1", "u1", 1_000)).await.unwrap();

        let error = ledger.create(new_order("k1", "u1", 1_000)).await.unwrap_err();

        assert!(matches!(
            error,
            LedgerError::DuplicateIdempotencyKey { existing, .. } if existing == first.id
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let ledger = InMemoryOrderLedger::new();
        let id = OrderId::generate();
        assert_eq!(ledger.get(id).await.unwrap_err(), LedgerError::NotFound(id));
    }

    #[tokio::test]
    async fn list_is_newest_first_filtered_and_paginated() {
        let ledger = InMemoryOrderLedger::new();
        for i in 0..5 {
            let user = if i % 2 == 0 { "even" } else { "odd" };
            ledger
                .create(new_order(&format!("k{i}"), user, 1_000 + i))
                .await
                .unwrap();
        }

        let page = ledger
            .list(&OrderQuery {
                page: PageRequest::for_orders(Some(1), Some(2)),
                ..OrderQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].idempotency_key.as_ref(), "k4");
        assert_eq!(page.pagination.total_items, 5);
        assert_eq!(page.pagination.total_pages, 3);
        assert!(page.pagination.has_next);

        let evens = ledger
            .list(&OrderQuery {
                user_id: Some(UserId::try_new("even").unwrap()),
                ..OrderQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(evens.pagination.total_items, 3);
    }

    #[tokio::test]
    async fn status_transitions_are_enforced() {
        let ledger = InMemoryOrderLedger::new();
        let order = ledger.create(new_order("k1", "u1", 1_000)).await.unwrap();

        let shipped = ledger
            .update_status(order.id, OrderStatus::Shipped)
            .await
            .unwrap();
        assert_eq!(shipped.status, OrderStatus::Shipped);

        let error = ledger
            .update_status(order.id, OrderStatus::Preparing)
            .await
            .unwrap_err();
        assert!(matches!(error, LedgerError::InvalidTransition { .. }));

        let shipped_only = ledger
            .list(&OrderQuery {
                status: Some(OrderStatus::Shipped),
                ..OrderQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(shipped_only.items.len(), 1);
    }

    #[tokio::test]
    async fn stats_aggregate_totals() {
        let ledger = InMemoryOrderLedger::new();
        ledger.create(new_order("k1", "u1", 1_000)).await.unwrap();
        ledger.create(new_order("k2", "u1", 2_500)).await.unwrap();

        let stats = ledger.stats(Timestamp::now().date()).await.unwrap();
        assert_eq!(stats.total_orders, 2);
        assert_eq!(stats.total_revenue, Money::from_cents(3_500).unwrap());
        assert_eq!(stats.total_discount, Money::ZERO);
        assert_eq!(stats.orders_today, 2);
    }
}
