//! Narrow interfaces to the services order placement coordinates.
//!
//! Each trait is object-safe so the orchestrator can hold collaborators as
//! `Arc<dyn Trait>` and swap in-memory, scripted or networked implementations.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::discount::{DiscountCode, RedemptionRecord};
use crate::errors::{CollaboratorError, LedgerError, PublishError, RedemptionError};
use crate::fulfillment::FulfillmentEvent;
use crate::order::{LineItem, NewOrder, Order, OrderStatus};
use crate::query::{OrderQuery, OrderStats, Page};
use crate::request::PaymentInstrument;
use crate::types::{
    DiscountCodeId, IdempotencyKey, Money, OrderId, ProductId, PromoCode, Quantity,
    TransactionRef, UserId,
};

/// A product and quantity, as checked by inventory and broadcast to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockLine {
    /// Product reference.
    pub product_id: ProductId,
    /// Units.
    pub quantity: Quantity,
}

impl From<&LineItem> for StockLine {
    fn from(item: &LineItem) -> Self {
        Self {
            product_id: item.product_id.clone(),
            quantity: item.quantity,
        }
    }
}

/// Result of a stock preflight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StockCheck {
    /// Every line can be fulfilled right now.
    Available,
    /// At least one line cannot; the first failing line is reported.
    Rejected {
        /// Failing product.
        product_id: ProductId,
        /// Human-readable reason.
        reason: String,
    },
}

/// Non-reserving, point-in-time stock check.
#[async_trait]
pub trait StockPreflight: Send + Sync {
    /// Whether every line can be fulfilled now.
    async fn check(&self, lines: &[StockLine]) -> Result<StockCheck, CollaboratorError>;
}

/// A request to authorize and capture a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentAuthorization {
    /// Checkout key; repeated authorizations with the same key must not
    /// capture twice.
    pub idempotency_key: IdempotencyKey,
    /// Card details.
    pub instrument: PaymentInstrument,
    /// Post-discount total.
    pub amount: Money,
}

/// Result of a payment authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Captured.
    Approved {
        /// Capture reference, used to void.
        transaction: TransactionRef,
        /// Amount the processor captured.
        amount: Money,
    },
    /// Refused.
    Declined {
        /// Payment collaborator's reason.
        reason: String,
    },
}

/// Payment authorization and compensation.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Authorizes and captures `request.amount`.
    async fn authorize(
        &self,
        request: &PaymentAuthorization,
    ) -> Result<PaymentOutcome, CollaboratorError>;

    /// Reverses a capture.
    async fn void(&self, transaction: &TransactionRef) -> Result<(), CollaboratorError>;
}

/// A redemption to record with a compare-and-swap on the code version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionRequest {
    /// Code being redeemed.
    pub code_id: DiscountCodeId,
    /// Version the caller evaluated against.
    pub expected_version: u64,
    /// Redeeming user.
    pub user_id: UserId,
    /// Order the discount was applied to.
    pub order_id: OrderId,
    /// Discount applied.
    pub amount: Money,
}

/// Discount code lookup and redemption.
#[async_trait]
pub trait Promotions: Send + Sync {
    /// Case-insensitive lookup by code string.
    async fn find_code(&self, code: &PromoCode) -> Result<Option<DiscountCode>, CollaboratorError>;

    /// Redemptions of `code_id` by `user_id`.
    async fn redemptions(
        &self,
        user_id: &UserId,
        code_id: DiscountCodeId,
    ) -> Result<Vec<RedemptionRecord>, CollaboratorError>;

    /// Records a redemption if the code is still at `expected_version`.
    ///
    /// Increments the code's redemption count and version atomically with
    /// inserting the record.
    async fn redeem(&self, request: RedemptionRequest) -> Result<RedemptionRecord, RedemptionError>;
}

/// Durable order storage.
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Persists a new order with status `Preparing`.
    ///
    /// Fails with [`LedgerError::DuplicateIdempotencyKey`] if the key already
    /// produced an order.
    async fn create(&self, order: NewOrder) -> Result<Order, LedgerError>;

    /// Loads one order.
    async fn get(&self, id: OrderId) -> Result<Order, LedgerError>;

    /// Order previously created with `key`, if any.
    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, LedgerError>;

    /// Filtered page of orders, newest first.
    async fn list(&self, query: &OrderQuery) -> Result<Page<Order>, LedgerError>;

    /// Moves an order to `status` if the transition is allowed.
    async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order, LedgerError>;

    /// Aggregate statistics; `today` selects the day counted as today.
    async fn stats(&self, today: NaiveDate) -> Result<OrderStats, LedgerError>;

    /// Reachability check.
    async fn ping(&self) -> Result<(), LedgerError>;
}

/// Broadcasts fulfillment events to every bound consumer.
#[async_trait]
pub trait FulfillmentPublisher: Send + Sync {
    /// Publishes `event` without waiting for consumers.
    async fn broadcast(&self, event: &FulfillmentEvent) -> Result<(), PublishError>;
}
