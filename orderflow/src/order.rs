//! The order aggregate and its invariants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, ValidationError};
use crate::types::{
    IdempotencyKey, ImageRef, Money, OrderId, ProductId, ProductName, PromoCode, Quantity,
    ShippingAddress, Timestamp, TransactionRef, UserId,
};

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created, awaiting shipment.
    Preparing,
    /// Handed to the carrier.
    Shipped,
    /// Received by the customer.
    Delivered,
    /// Cancelled by an operator.
    Cancelled,
}

impl OrderStatus {
    /// All statuses.
    pub const ALL: [Self; 4] = [
        Self::Preparing,
        Self::Shipped,
        Self::Delivered,
        Self::Cancelled,
    ];

    /// Whether an order may move from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Shipped | Self::Cancelled)
                | (Self::Shipped, Self::Delivered | Self::Cancelled)
        )
    }

    /// No transitions leave a terminal status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Stable name used on the wire and in storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "Preparing",
            Self::Shipped => "Shipped",
            Self::Delivered => "Delivered",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::field("status", format!("unknown status {s:?}")))
    }
}

/// Point-in-time snapshot of a purchased product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product reference.
    pub product_id: ProductId,
    /// Display name at checkout.
    pub product_name: ProductName,
    /// Image reference at checkout.
    pub image_ref: ImageRef,
    /// Unit price at checkout.
    pub unit_price: Money,
    /// Units bought.
    pub quantity: Quantity,
}

impl LineItem {
    /// `unit_price × quantity`.
    pub fn line_total(&self) -> Result<Money, ValidationError> {
        self.unit_price.times(self.quantity)
    }
}

/// Sum of line totals.
pub fn subtotal_of(items: &[LineItem]) -> Result<Money, ValidationError> {
    items
        .iter()
        .try_fold(Money::ZERO, |sum, item| sum.checked_add(item.line_total()?))
}

/// Order amounts satisfying `total = subtotal - discount_amount` and
/// `discount_amount <= subtotal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTotals")]
pub struct OrderTotals {
    subtotal: Money,
    discount_amount: Money,
    total: Money,
}

#[derive(Deserialize)]
struct RawTotals {
    subtotal: Money,
    discount_amount: Money,
    total: Money,
}

impl TryFrom<RawTotals> for OrderTotals {
    type Error = LedgerError;

    fn try_from(raw: RawTotals) -> Result<Self, Self::Error> {
        Self::from_parts(raw.subtotal, raw.discount_amount, raw.total)
    }
}

impl OrderTotals {
    /// Derives the total from a subtotal and discount.
    pub fn new(subtotal: Money, discount_amount: Money) -> Result<Self, LedgerError> {
        let total = subtotal.checked_sub(discount_amount).map_err(|_| {
            LedgerError::InvariantViolated(format!(
                "discount {discount_amount} exceeds subtotal {subtotal}"
            ))
        })?;
        Ok(Self {
            subtotal,
            discount_amount,
            total,
        })
    }

    /// Rebuilds totals read back from storage, checking the invariants.
    pub fn from_parts(
        subtotal: Money,
        discount_amount: Money,
        total: Money,
    ) -> Result<Self, LedgerError> {
        let totals = Self::new(subtotal, discount_amount)?;
        if totals.total != total {
            return Err(LedgerError::InvariantViolated(format!(
                "total {total} is not subtotal {subtotal} minus discount {discount_amount}"
            )));
        }
        Ok(totals)
    }

    /// Sum of line totals before discount.
    pub const fn subtotal(&self) -> Money {
        self.subtotal
    }

    /// Discount applied.
    pub const fn discount_amount(&self) -> Money {
        self.discount_amount
    }

    /// Amount charged.
    pub const fn total(&self) -> Money {
        self.total
    }
}

/// An order ready to be written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    idempotency_key: IdempotencyKey,
    user_id: UserId,
    items: Vec<LineItem>,
    totals: OrderTotals,
    discount_code: Option<PromoCode>,
    shipping_address: ShippingAddress,
    payment_transaction: TransactionRef,
}

impl NewOrder {
    /// Checks that the order has items and that the subtotal matches them.
    pub fn new(
        idempotency_key: IdempotencyKey,
        user_id: UserId,
        items: Vec<LineItem>,
        totals: OrderTotals,
        discount_code: Option<PromoCode>,
        shipping_address: ShippingAddress,
        payment_transaction: TransactionRef,
    ) -> Result<Self, LedgerError> {
        if items.is_empty() {
            return Err(LedgerError::InvariantViolated(
                "order must contain at least one line item".to_string(),
            ));
        }
        let computed =
            subtotal_of(&items).map_err(|error| LedgerError::InvariantViolated(error.to_string()))?;
        if computed != totals.subtotal() {
            return Err(LedgerError::InvariantViolated(format!(
                "subtotal {} does not match line items {computed}",
                totals.subtotal()
            )));
        }
        if discount_code.is_none() && !totals.discount_amount().is_zero() {
            return Err(LedgerError::InvariantViolated(
                "discount applied without a discount code".to_string(),
            ));
        }

        Ok(Self {
            idempotency_key,
            user_id,
            items,
            totals,
            discount_code,
            shipping_address,
            payment_transaction,
        })
    }

    /// Idempotency key of the checkout.
    pub const fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    /// Owning user.
    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Line items.
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    /// Amounts.
    pub const fn totals(&self) -> OrderTotals {
        self.totals
    }

    /// Applied discount code.
    pub const fn discount_code(&self) -> Option<&PromoCode> {
        self.discount_code.as_ref()
    }

    /// Shipping address.
    pub const fn shipping_address(&self) -> &ShippingAddress {
        &self.shipping_address
    }

    /// Captured payment.
    pub const fn payment_transaction(&self) -> &TransactionRef {
        &self.payment_transaction
    }

    /// Materializes the order with its ledger-assigned identity and timestamp.
    pub fn into_order(self, id: OrderId, created_at: Timestamp) -> Order {
        Order {
            id,
            idempotency_key: self.idempotency_key,
            user_id: self.user_id,
            items: self.items,
            totals: self.totals,
            discount_code: self.discount_code,
            status: OrderStatus::Preparing,
            shipping_address: self.shipping_address,
            payment_transaction: self.payment_transaction,
            created_at,
            updated_at: created_at,
        }
    }
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Identity.
    pub id: OrderId,
    /// Idempotency key of the checkout that created it.
    pub idempotency_key: IdempotencyKey,
    /// Owning user.
    pub user_id: UserId,
    /// Line items in checkout order.
    pub items: Vec<LineItem>,
    /// Amounts.
    #[serde(flatten)]
    pub totals: OrderTotals,
    /// Applied discount code.
    pub discount_code: Option<PromoCode>,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Shipping address.
    pub shipping_address: ShippingAddress,
    /// Captured payment.
    pub payment_transaction: TransactionRef,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last status change.
    pub updated_at: Timestamp,
}

impl Order {
    /// Moves the order to `next` if the transition is allowed.
    pub fn transition(&mut self, next: OrderStatus, at: Timestamp) -> Result<(), LedgerError> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                order_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Amount charged.
    pub const fn total(&self) -> Money {
        self.totals.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn item(price_cents: u64, quantity: u32) -> LineItem {
        LineItem {
            product_id: ProductId::try_new("sku-1").unwrap(),
            product_name: ProductName::try_new("Keyboard").unwrap(),
            image_ref: ImageRef::try_new("").unwrap(),
            unit_price: Money::from_cents(price_cents).unwrap(),
            quantity: Quantity::try_new(quantity).unwrap(),
        }
    }

    fn new_order(items: Vec<LineItem>, totals: OrderTotals, code: Option<&str>) -> Result<NewOrder, LedgerError> {
        NewOrder::new(
            IdempotencyKey::try_new("key-1").unwrap(),
            UserId::try_new("user-1").unwrap(),
            items,
            totals,
            code.map(|c| PromoCode::try_new(c).unwrap()),
            ShippingAddress::try_new("1 Main St").unwrap(),
            TransactionRef::try_new("TXN_1").unwrap(),
        )
    }

    #[test]
    fn status_transitions() {
        use OrderStatus::{Cancelled, Delivered, Preparing, Shipped};

        assert!(Preparing.can_transition_to(Shipped));
        assert!(Preparing.can_transition_to(Cancelled));
        assert!(Shipped.can_transition_to(Delivered));
        assert!(Shipped.can_transition_to(Cancelled));

        assert!(!Preparing.can_transition_to(Delivered));
        assert!(!Shipped.can_transition_to(Preparing));
        for next in OrderStatus::ALL {
            assert!(!Delivered.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("shipped".parse::<OrderStatus>().unwrap(), OrderStatus::Shipped);
        assert_eq!(" Cancelled ".parse::<OrderStatus>().unwrap(), OrderStatus::Cancelled);
        assert!("lost".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn totals_reject_discount_above_subtotal() {
        let subtotal = Money::new(dec!(100)).unwrap();
        let discount = Money::new(dec!(101)).unwrap();
        assert!(matches!(
            OrderTotals::new(subtotal, discount),
            Err(LedgerError::InvariantViolated(_))
        ));
    }

    #[test]
    fn totals_from_parts_check_equation() {
        let subtotal = Money::new(dec!(200)).unwrap();
        let discount = Money::new(dec!(50)).unwrap();
        assert!(OrderTotals::from_parts(subtotal, discount, Money::new(dec!(150)).unwrap()).is_ok());
        assert!(OrderTotals::from_parts(subtotal, discount, Money::new(dec!(200)).unwrap()).is_err());
    }

    #[test]
    fn totals_deserialization_validates() {
        let json = r#"{"subtotal":"200.00","discount_amount":"50.00","total":"175.00"}"#;
        assert!(serde_json::from_str::<OrderTotals>(json).is_err());
    }

    #[test]
    fn new_order_requires_items_matching_subtotal() {
        let totals = OrderTotals::new(Money::from_cents(2_000).unwrap(), Money::ZERO).unwrap();
        assert!(new_order(vec![], totals, None).is_err());
        assert!(new_order(vec![item(1_000, 1)], totals, None).is_err());
        assert!(new_order(vec![item(1_000, 2)], totals, None).is_ok());
    }

    #[test]
    fn discount_requires_code() {
        let totals =
            OrderTotals::new(Money::from_cents(2_000).unwrap(), Money::from_cents(500).unwrap()).unwrap();
        assert!(new_order(vec![item(1_000, 2)], totals, None).is_err());
        assert!(new_order(vec![item(1_000, 2)], totals, Some("save5")).is_ok());
    }

    #[test]
    fn order_transition_updates_status_and_timestamp() {
        let totals = OrderTotals::new(Money::from_cents(1_000).unwrap(), Money::ZERO).unwrap();
        let created = Timestamp::now();
        let mut order = new_order(vec![item(1_000, 1)], totals, None)
            .unwrap()
            .into_order(OrderId::generate(), created);
        assert_eq!(order.status, OrderStatus::Preparing);

        let later = Timestamp::now();
        order.transition(OrderStatus::Shipped, later).unwrap();
        assert_eq!(order.status, OrderStatus::Shipped);
        assert_eq!(order.updated_at, later);

        order.transition(OrderStatus::Delivered, later).unwrap();
        assert!(matches!(
            order.transition(OrderStatus::Cancelled, later),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn order_json_flattens_totals() {
        let totals =
            OrderTotals::new(Money::from_cents(20_000).unwrap(), Money::from_cents(5_000).unwrap()).unwrap();
        let order = new_order(vec![item(10_000, 2)], totals, Some("fixed50"))
            .unwrap()
            .into_order(OrderId::generate(), Timestamp::now());
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(json["subtotal"], "200.00");
        assert_eq!(json["discount_amount"], "50.00");
        assert_eq!(json["total"], "150.00");
        assert_eq!(json["status"], "Preparing");
        assert_eq!(json["discount_code"], "FIXED50");

        let back: Order = serde_json::from_value(json).unwrap();
        assert_eq!(back, order);
    }

    proptest! {
        #[test]
        fn prop_totals_invariant(subtotal_cents in 0u64..10_000_000_000, discount_cents in 0u64..10_000_000_000) {
            let subtotal = Money::from_cents(subtotal_cents).unwrap();
            let discount = Money::from_cents(discount_cents).unwrap();
            match OrderTotals::new(subtotal, discount) {
                Ok(totals) => {
                    prop_assert!(totals.discount_amount() <= totals.subtotal());
                    prop_assert_eq!(
                        totals.total().to_cents() + totals.discount_amount().to_cents(),
                        totals.subtotal().to_cents()
                    );
                }
                Err(_) => prop_assert!(discount > subtotal),
            }
        }
    }
}
