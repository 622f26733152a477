//! Error types for order placement and its collaborators.
//!
//! Each subsystem owns one error enum. [`PlacementError`] is the top-level
//! classification returned by the orchestrator.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::discount::DiscountRejection;
use crate::order::OrderStatus;
use crate::types::{EventId, IdempotencyKey, Money, OrderId, ProductId, TransactionRef};

/// A collaborator the orchestrator talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    /// Stock preflight and decrement.
    Inventory,
    /// Payment authorization and void.
    Payment,
    /// Discount code lookup and redemption.
    Promotions,
    /// Durable order storage.
    Ledger,
    /// Fan-out event broker.
    Broker,
    /// Customer notification channel.
    Notification,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inventory => "inventory",
            Self::Payment => "payment",
            Self::Promotions => "promotions",
            Self::Ledger => "ledger",
            Self::Broker => "broker",
            Self::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Errors raised while parsing an order request into domain types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A field failed its smart-constructor validation.
    #[error("{field} is invalid: {reason}")]
    InvalidField {
        /// Request field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A monetary amount was negative, too precise, or out of range.
    #[error("invalid money amount: {0}")]
    InvalidMoney(String),

    /// The order had no line items.
    #[error("order must contain at least one line item")]
    EmptyOrder,

    /// A client-quoted amount disagrees with the server computation.
    #[error("quoted {field} {quoted} does not match computed {computed}")]
    QuoteMismatch {
        /// Which amount disagreed.
        field: &'static str,
        /// Amount the client sent.
        quoted: Money,
        /// Amount the server computed.
        computed: Money,
    },

    /// An idempotency key was reused by a different user.
    #[error("idempotency key {0} belongs to another user")]
    IdempotencyKeyConflict(IdempotencyKey),
}

impl ValidationError {
    /// Wraps a smart-constructor error for the named field.
    pub fn field(field: &'static str, error: impl fmt::Display) -> Self {
        Self::InvalidField {
            field,
            reason: error.to_string(),
        }
    }
}

/// Errors from a collaborator call that are not business outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached or failed internally.
    #[error("{collaborator} unavailable: {detail}")]
    Unavailable {
        /// Which collaborator failed.
        collaborator: Collaborator,
        /// Failure detail.
        detail: String,
    },

    /// The collaborator did not answer within the configured bound.
    #[error("{collaborator} timed out after {after:?}")]
    TimedOut {
        /// Which collaborator timed out.
        collaborator: Collaborator,
        /// The bound that elapsed.
        after: Duration,
    },
}

impl CollaboratorError {
    /// Shorthand for [`CollaboratorError::Unavailable`].
    pub fn unavailable(collaborator: Collaborator, detail: impl Into<String>) -> Self {
        Self::Unavailable {
            collaborator,
            detail: detail.into(),
        }
    }

    /// Which collaborator failed.
    pub const fn collaborator(&self) -> Collaborator {
        match self {
            Self::Unavailable { collaborator, .. } | Self::TimedOut { collaborator, .. } => {
                *collaborator
            }
        }
    }
}

/// A well-formed request refused on business grounds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusinessRejection {
    /// Stock preflight rejected a line.
    #[error("insufficient stock for product {product_id}: {reason}")]
    InsufficientStock {
        /// First line that could not be fulfilled.
        product_id: ProductId,
        /// Inventory's reason.
        reason: String,
    },

    /// Payment was declined.
    #[error("payment declined: {reason}")]
    PaymentDeclined {
        /// Payment collaborator's reason.
        reason: String,
    },

    /// Payment approved a capture for a different amount than the order
    /// total. The capture is left untouched: it may belong to another
    /// attempt with the same key.
    #[error("payment {transaction} approved {approved} but the order total is {expected}")]
    PaymentAmountMismatch {
        /// Capture returned by the payment collaborator.
        transaction: TransactionRef,
        /// Amount the capture holds.
        approved: Money,
        /// Order total the capture was requested for.
        expected: Money,
    },

    /// The discount code did not validate.
    #[error("discount code rejected: {0}")]
    Discount(DiscountRejection),
}

/// Operations performed against the order ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOperation {
    /// Creating an order.
    Create,
    /// Reading orders.
    Read,
    /// Changing an order's status.
    UpdateStatus,
    /// Aggregating statistics.
    Stats,
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::UpdateStatus => "update_status",
            Self::Stats => "stats",
        };
        f.write_str(name)
    }
}

/// Errors from the order ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// No order with this identity exists.
    #[error("order {0} not found")]
    NotFound(OrderId),

    /// Another order was already created with this idempotency key.
    #[error("idempotency key {key} already produced order {existing}")]
    DuplicateIdempotencyKey {
        /// The reused key.
        key: IdempotencyKey,
        /// The order the key already produced.
        existing: OrderId,
    },

    /// An order aggregate invariant would be broken.
    #[error("order invariant violated: {0}")]
    InvariantViolated(String),

    /// The requested status transition is not allowed.
    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The order.
        order_id: OrderId,
        /// Current status.
        from: OrderStatus,
        /// Requested status.
        to: OrderStatus,
    },

    /// The backing store failed.
    #[error("ledger {operation} failed: {detail}")]
    StoreFailure {
        /// Operation that failed.
        operation: LedgerOperation,
        /// Failure detail.
        detail: String,
    },
}

impl LedgerError {
    /// Shorthand for [`LedgerError::StoreFailure`].
    pub fn store(operation: LedgerOperation, detail: impl Into<String>) -> Self {
        Self::StoreFailure {
            operation,
            detail: detail.into(),
        }
    }
}

/// Errors from recording a discount redemption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedemptionError {
    /// The code changed since it was read.
    #[error("discount code version changed (expected {expected}, found {actual})")]
    VersionConflict {
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The code has no redemptions left.
    #[error("discount code has reached its redemption limit")]
    LimitReached,

    /// The user already redeemed this code.
    #[error("discount code already used by this customer")]
    AlreadyRedeemed,

    /// The code no longer exists.
    #[error("discount code not found")]
    UnknownCode,

    /// The promotions collaborator failed.
    #[error(transparent)]
    Unavailable(#[from] CollaboratorError),
}

/// Errors from broadcasting a fulfillment event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// The exchange refused or failed the broadcast.
    #[error("broadcast of event {event_id} to {exchange} failed: {detail}")]
    Failed {
        /// Exchange name.
        exchange: String,
        /// Event that was not delivered.
        event_id: EventId,
        /// Failure detail.
        detail: String,
    },

    /// The exchange has been shut down.
    #[error("exchange {0} is closed")]
    Closed(String),
}

/// Errors from a fulfillment consumer handling one event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{consumer} failed to handle event {event_id}: {detail}")]
pub struct HandlerError {
    /// Consumer name.
    pub consumer: &'static str,
    /// Event being handled.
    pub event_id: EventId,
    /// Failure detail.
    pub detail: String,
}

/// Errors loading configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value was not an integer.
    #[error("{key} must be an integer, got {value:?}")]
    NotANumber {
        /// Environment variable.
        key: &'static str,
        /// Raw value.
        value: String,
    },

    /// A value was outside its allowed range.
    #[error("{key} is out of range: {detail}")]
    OutOfRange {
        /// Environment variable.
        key: &'static str,
        /// Validation detail.
        detail: String,
    },
}

/// Outcome of voiding a captured payment after a later step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// The capture was voided.
    Voided,
    /// The void failed; the charge is orphaned.
    VoidFailed(String),
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voided => f.write_str("payment voided"),
            Self::VoidFailed(detail) => write!(f, "void failed, charge orphaned: {detail}"),
        }
    }
}

/// Coarse classification of a placement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request.
    Validation,
    /// Refused on business grounds.
    BusinessRejection,
    /// A collaborator failed or timed out.
    CollaboratorUnavailable,
    /// Payment captured but the order was not persisted.
    PersistenceFailure,
}

/// Errors returned by [`crate::placement::OrderPlacement::place`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    /// Malformed request.
    #[error("invalid order request: {0}")]
    Validation(#[from] ValidationError),

    /// Refused on business grounds.
    #[error("order rejected: {0}")]
    Rejected(#[from] BusinessRejection),

    /// A collaborator failed or timed out.
    #[error(transparent)]
    CollaboratorUnavailable(#[from] CollaboratorError),

    /// The ledger write failed after payment capture.
    #[error("payment {transaction} captured but order was not persisted: {detail} ({compensation})")]
    Persistence {
        /// The captured transaction.
        transaction: TransactionRef,
        /// Ledger failure detail.
        detail: String,
        /// Whether the capture was voided.
        compensation: Compensation,
    },
}

impl PlacementError {
    /// Taxonomy bucket for this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Rejected(_) => ErrorKind::BusinessRejection,
            Self::CollaboratorUnavailable(_) => ErrorKind::CollaboratorUnavailable,
            Self::Persistence { .. } => ErrorKind::PersistenceFailure,
        }
    }

    /// HTTP status code a request surface should answer with.
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Validation(ValidationError::IdempotencyKeyConflict(_)) => 409,
            Self::Validation(_) | Self::Rejected(_) => 400,
            Self::CollaboratorUnavailable(_) => 502,
            Self::Persistence { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_follows_taxonomy() {
        let validation = PlacementError::from(ValidationError::EmptyOrder);
        assert_eq!(validation.http_status(), 400);
        assert_eq!(validation.kind(), ErrorKind::Validation);

        let rejected = PlacementError::from(BusinessRejection::PaymentDeclined {
            reason: "insufficient funds".to_string(),
        });
        assert_eq!(rejected.http_status(), 400);

        let unavailable = PlacementError::from(CollaboratorError::TimedOut {
            collaborator: Collaborator::Inventory,
            after: Duration::from_millis(100),
        });
        assert_eq!(unavailable.http_status(), 502);

        let persistence = PlacementError::Persistence {
            transaction: TransactionRef::try_new("TXN_1").unwrap(),
            detail: "disk full".to_string(),
            compensation: Compensation::Voided,
        };
        assert_eq!(persistence.http_status(), 500);
        assert_eq!(persistence.kind(), ErrorKind::PersistenceFailure);

        let conflict = PlacementError::from(ValidationError::IdempotencyKeyConflict(
            IdempotencyKey::try_new("key-1").unwrap(),
        ));
        assert_eq!(conflict.http_status(), 409);
    }

    #[test]
    fn persistence_failure_message_names_transaction_and_compensation() {
        let error = PlacementError::Persistence {
            transaction: TransactionRef::try_new("TXN_42").unwrap(),
            detail: "connection reset".to_string(),
            compensation: Compensation::VoidFailed("gateway down".to_string()),
        };
        let message = error.to_string();
        assert!(message.contains("TXN_42"));
        assert!(message.contains("charge orphaned"));
    }

    #[test]
    fn collaborator_error_names_collaborator() {
        let error = CollaboratorError::unavailable(Collaborator::Payment, "connection refused");
        assert_eq!(error.collaborator(), Collaborator::Payment);
        assert_eq!(error.to_string(), "payment unavailable: connection refused");
    }
}
