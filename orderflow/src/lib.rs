//! `orderflow` - order placement orchestration
//!
//! Turns a checkout into a durable order while coordinating inventory,
//! payment and promotions, then broadcasts a fulfillment event to every
//! downstream consumer. Collaborators sit behind the traits in
//! [`collaborators`]; [`placement::OrderPlacement`] drives the state machine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod discount;
pub mod errors;
pub mod fulfillment;
pub mod order;
pub mod placement;
pub mod query;
pub mod request;
pub mod types;

pub use collaborators::{
    FulfillmentPublisher, OrderLedger, PaymentAuthorization, PaymentGateway, PaymentOutcome,
    Promotions, RedemptionRequest, StockCheck, StockLine, StockPreflight,
};
pub use config::{CollaboratorTimeoutMs, PlacementConfig, RedemptionAttempts};
pub use discount::{
    evaluate, AppliedDiscount, DiscountCode, DiscountCodeUpdate, DiscountEvaluation, DiscountKind,
    DiscountRejection, DiscountUsage, NewDiscountCode, RedemptionRecord,
};
pub use errors::{
    BusinessRejection, Collaborator, CollaboratorError, Compensation, ConfigError, ErrorKind,
    HandlerError, LedgerError, LedgerOperation, PlacementError, PublishError, RedemptionError,
    ValidationError,
};
pub use fulfillment::{
    DecrementOutcome, FulfillmentEvent, FulfillmentHandler, Notification, NotificationConsumer,
    Notifier, StockDecrement, StockDecrementConsumer, FULFILLMENT_EXCHANGE, NOTIFICATION_QUEUE,
    STOCK_QUEUE,
};
pub use order::{LineItem, NewOrder, Order, OrderStatus, OrderTotals};
pub use placement::{
    Collaborators, EventDelivery, OrderPlacement, PlacementReceipt, PlacementState,
    RedemptionStatus,
};
pub use query::{OrderQuery, OrderStats, Page, PageRequest, Pagination};
pub use request::{
    CardExpiry, CardNumber, Cvv, OrderRequestBody, PaymentInstrument, PlaceOrderRequest,
    QuotedTotals,
};
pub use types::{
    Clock, DiscountCodeId, EventId, FixedClock, IdempotencyKey, ImageRef, Money, OrderId,
    ProductId, ProductName, PromoCode, Quantity, RedemptionId, ShippingAddress, SystemClock,
    Timestamp, TransactionRef, UserId,
};
