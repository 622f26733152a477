//! The order placement orchestrator.
//!
//! A placement moves strictly forward through
//! `Validating → StockChecked → PaymentAuthorized → Persisted → EventPublished`
//! and may abort from any non-terminal state. Each collaborator call is bounded
//! by [`PlacementConfig::collaborator_timeout`]; nothing is retried except the
//! redemption compare-and-swap.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{
    FulfillmentPublisher, OrderLedger, PaymentAuthorization, PaymentGateway, PaymentOutcome,
    Promotions, RedemptionRequest, StockCheck, StockPreflight,
};
use crate::config::PlacementConfig;
use crate::discount::{self, AppliedDiscount, DiscountEvaluation};
use crate::errors::{
    BusinessRejection, Collaborator, CollaboratorError, Compensation, ErrorKind, LedgerError,
    LedgerOperation, PlacementError, RedemptionError, ValidationError,
};
use crate::fulfillment::FulfillmentEvent;
use crate::order::{NewOrder, Order, OrderTotals};
use crate::request::{PlaceOrderRequest, QuotedTotals};
use crate::types::{
    Clock, EventId, Money, OrderId, PromoCode, RedemptionId, SystemClock, TransactionRef, UserId,
};

/// A state of the placement state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementState {
    /// Parsing, replay detection and discount evaluation.
    Validating,
    /// Inventory accepted every line.
    StockChecked,
    /// Payment captured.
    PaymentAuthorized(TransactionRef),
    /// Order committed to the ledger.
    Persisted(OrderId),
    /// Fulfillment event broadcast attempted. Terminal.
    EventPublished(OrderId),
    /// Placement stopped. Terminal.
    Aborted(String),
}

impl PlacementState {
    /// No transitions leave a terminal state.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::EventPublished(_) | Self::Aborted(_))
    }
}

impl fmt::Display for PlacementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validating => f.write_str("Validating"),
            Self::StockChecked => f.write_str("StockChecked"),
            Self::PaymentAuthorized(transaction) => write!(f, "PaymentAuthorized({transaction})"),
            Self::Persisted(order_id) => write!(f, "Persisted({order_id})"),
            Self::EventPublished(order_id) => write!(f, "EventPublished({order_id})"),
            Self::Aborted(reason) => write!(f, "Aborted({reason})"),
        }
    }
}

/// What happened to the fulfillment event of a new order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDelivery {
    /// Handed to the exchange.
    Published(EventId),
    /// The broadcast failed; the order still stands.
    Failed {
        /// Event that was not delivered.
        event_id: EventId,
        /// Failure detail.
        reason: String,
    },
}

/// What happened to the discount redemption of a new order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedemptionStatus {
    /// No discount code was applied.
    NotApplicable,
    /// Redemption recorded.
    Recorded(RedemptionId),
    /// Recording failed; the order still stands.
    Failed(String),
}

/// Result of a successful placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementReceipt {
    /// The persisted order.
    pub order: Order,
    /// True when the idempotency key had already produced this order.
    pub replayed: bool,
    /// Event outcome; `None` for replays.
    pub event_delivery: Option<EventDelivery>,
    /// Redemption outcome.
    pub redemption: RedemptionStatus,
    /// States visited, in order.
    pub path: Vec<PlacementState>,
}

impl PlacementReceipt {
    fn replay(order: Order, path: Vec<PlacementState>) -> Self {
        Self {
            order,
            replayed: true,
            event_delivery: None,
            redemption: RedemptionStatus::NotApplicable,
            path,
        }
    }
}

/// The collaborators a placement coordinates.
#[derive(Clone)]
pub struct Collaborators {
    /// Stock preflight.
    pub stock: Arc<dyn StockPreflight>,
    /// Payment authorization.
    pub payments: Arc<dyn PaymentGateway>,
    /// Discount codes.
    pub promotions: Arc<dyn Promotions>,
    /// Order storage.
    pub ledger: Arc<dyn OrderLedger>,
    /// Fulfillment broadcast.
    pub publisher: Arc<dyn FulfillmentPublisher>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Turns checkout requests into persisted orders.
#[derive(Clone)]
pub struct OrderPlacement {
    collaborators: Collaborators,
    config: PlacementConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for OrderPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderPlacement")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OrderPlacement {
    /// Creates an orchestrator using the system clock.
    pub fn new(collaborators: Collaborators, config: PlacementConfig) -> Self {
        Self {
            collaborators,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for discount windows and event timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The collaborators this orchestrator was built with.
    pub const fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Places an order.
    ///
    /// Replaying an idempotency key that already produced an order returns
    /// that order without charging or broadcasting again.
    #[instrument(
        name = "placement.place",
        skip_all,
        fields(idempotency_key = %request.idempotency_key, user_id = %request.user_id)
    )]
    pub async fn place(&self, request: PlaceOrderRequest) -> Result<PlacementReceipt, PlacementError> {
        let mut path = vec![PlacementState::Validating];
        match self.run(&request, &mut path).await {
            Ok(receipt) => {
                info!(
                    order_id = %receipt.order.id,
                    total = %receipt.order.total(),
                    replayed = receipt.replayed,
                    "[placement.place] order placed"
                );
                Ok(receipt)
            }
            Err(failure) => {
                path.push(PlacementState::Aborted(failure.to_string()));
                let from = path
                    .iter()
                    .rev()
                    .nth(1)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                if failure.kind() == ErrorKind::PersistenceFailure {
                    error!(from = %from, error = %failure, "[placement.place] aborted");
                } else {
                    warn!(from = %from, error = %failure, "[placement.place] aborted");
                }
                Err(failure)
            }
        }
    }

    async fn run(
        &self,
        request: &PlaceOrderRequest,
        path: &mut Vec<PlacementState>,
    ) -> Result<PlacementReceipt, PlacementError> {
        if let Some(order) = self.find_replay(request).await? {
            info!(order_id = %order.id, "[placement.place] idempotency key replayed");
            return Ok(PlacementReceipt::replay(order, std::mem::take(path)));
        }

        let subtotal = request.subtotal()?;
        let applied = match &request.discount_code {
            Some(code) => Some(self.evaluate_discount(&request.user_id, code, subtotal).await?),
            None => None,
        };
        let discount_amount = applied.as_ref().map_or(Money::ZERO, |applied| applied.amount);
        let totals = OrderTotals::new(subtotal, discount_amount)
            .map_err(|error| ValidationError::field("discount_amount", error))?;
        check_quote(&request.quoted, &totals)?;

        self.check_stock(request).await?;
        path.push(PlacementState::StockChecked);

        let transaction = self.authorize(request, totals.total()).await?;
        path.push(PlacementState::PaymentAuthorized(transaction.clone()));

        if let Some(applied) = &applied {
            if let Err(failure) = self.revalidate_discount(request, subtotal, applied).await {
                self.compensate(&transaction).await;
                return Err(failure);
            }
        }

        let order = match self
            .persist(request, totals, applied.as_ref(), &transaction)
            .await?
        {
            Persisted::Created(order) => order,
            Persisted::Existing(order) => {
                return Ok(PlacementReceipt::replay(order, std::mem::take(path)));
            }
        };
        path.push(PlacementState::Persisted(order.id));

        let redemption = match &applied {
            Some(applied) => self.redeem(&order, applied).await,
            None => RedemptionStatus::NotApplicable,
        };

        let delivery = self.publish(&order).await;
        path.push(PlacementState::EventPublished(order.id));

        Ok(PlacementReceipt {
            order,
            replayed: false,
            event_delivery: Some(delivery),
            redemption,
            path: std::mem::take(path),
        })
    }

    async fn find_replay(&self, request: &PlaceOrderRequest) -> Result<Option<Order>, PlacementError> {
        let ledger = &self.collaborators.ledger;
        let found = self
            .bounded(
                Collaborator::Ledger,
                ledger.find_by_idempotency_key(&request.idempotency_key),
            )
            .await?
            .map_err(ledger_unavailable)?;
        match found {
            Some(order) if order.user_id != request.user_id => Err(
                ValidationError::IdempotencyKeyConflict(request.idempotency_key.clone()).into(),
            ),
            other => Ok(other),
        }
    }

    #[instrument(name = "placement.discount", skip_all, fields(code = %code))]
    async fn evaluate_discount(
        &self,
        user_id: &UserId,
        code: &PromoCode,
        subtotal: Money,
    ) -> Result<AppliedDiscount, PlacementError> {
        match self.fetch_and_evaluate(user_id, code, subtotal).await? {
            DiscountEvaluation::Applied(applied) => {
                info!(
                    kind = %applied.kind,
                    amount = %applied.amount,
                    "[placement.discount] discount applied"
                );
                Ok(applied)
            }
            DiscountEvaluation::Rejected(rejection) => {
                Err(BusinessRejection::Discount(rejection).into())
            }
        }
    }

    async fn fetch_and_evaluate(
        &self,
        user_id: &UserId,
        code: &PromoCode,
        subtotal: Money,
    ) -> Result<DiscountEvaluation, CollaboratorError> {
        let promotions = &self.collaborators.promotions;
        let record = self
            .call(Collaborator::Promotions, promotions.find_code(code))
            .await?;
        let redemptions = match &record {
            Some(record) => {
                self.call(
                    Collaborator::Promotions,
                    promotions.redemptions(user_id, record.id()),
                )
                .await?
            }
            None => Vec::new(),
        };
        Ok(discount::evaluate(
            record.as_ref(),
            user_id,
            subtotal,
            &redemptions,
            self.clock.now(),
        ))
    }

    #[instrument(name = "placement.revalidate_discount", skip_all)]
    async fn revalidate_discount(
        &self,
        request: &PlaceOrderRequest,
        subtotal: Money,
        applied: &AppliedDiscount,
    ) -> Result<(), PlacementError> {
        match self
            .fetch_and_evaluate(&request.user_id, &applied.code, subtotal)
            .await?
        {
            DiscountEvaluation::Applied(fresh) if fresh.amount == applied.amount => Ok(()),
            DiscountEvaluation::Applied(fresh) => Err(ValidationError::QuoteMismatch {
                field: "discount_amount",
                quoted: applied.amount,
                computed: fresh.amount,
            }
            .into()),
            DiscountEvaluation::Rejected(rejection) => {
                Err(BusinessRejection::Discount(rejection).into())
            }
        }
    }

    #[instrument(name = "placement.stock", skip_all, fields(lines = request.items.len()))]
    async fn check_stock(&self, request: &PlaceOrderRequest) -> Result<(), PlacementError> {
        let lines = request.stock_lines();
        match self
            .call(Collaborator::Inventory, self.collaborators.stock.check(&lines))
            .await?
        {
            StockCheck::Available => {
                debug!("[placement.stock] all lines available");
                Ok(())
            }
            StockCheck::Rejected { product_id, reason } => {
                Err(BusinessRejection::InsufficientStock { product_id, reason }.into())
            }
        }
    }

    #[instrument(name = "placement.payment", skip_all, fields(amount = %amount))]
    async fn authorize(
        &self,
        request: &PlaceOrderRequest,
        amount: Money,
    ) -> Result<TransactionRef, PlacementError> {
        let authorization = PaymentAuthorization {
            idempotency_key: request.idempotency_key.clone(),
            instrument: request.instrument.clone(),
            amount,
        };
        match self
            .call(
                Collaborator::Payment,
                self.collaborators.payments.authorize(&authorization),
            )
            .await?
        {
            PaymentOutcome::Approved {
                transaction,
                amount: approved,
            } if approved == amount => {
                info!(transaction = %transaction, "[placement.payment] payment approved");
                Ok(transaction)
            }
            PaymentOutcome::Approved {
                transaction,
                amount: approved,
            } => {
                error!(
                    transaction = %transaction,
                    approved = %approved,
                    "[placement.payment] approval does not cover the order total"
                );
                Err(BusinessRejection::PaymentAmountMismatch {
                    transaction,
                    approved,
                    expected: amount,
                }
                .into())
            }
            PaymentOutcome::Declined { reason } => {
                Err(BusinessRejection::PaymentDeclined { reason }.into())
            }
        }
    }

    #[instrument(name = "placement.persist", skip_all, fields(transaction = %transaction))]
    async fn persist(
        &self,
        request: &PlaceOrderRequest,
        totals: OrderTotals,
        applied: Option<&AppliedDiscount>,
        transaction: &TransactionRef,
    ) -> Result<Persisted, PlacementError> {
        let detail = match self.write_order(request, totals, applied, transaction).await {
            Ok(order) => {
                info!(order_id = %order.id, "[placement.persist] order persisted");
                return Ok(Persisted::Created(order));
            }
            Err(LedgerError::DuplicateIdempotencyKey { existing, .. }) => {
                // a concurrent attempt with the same key won the race
                info!(order_id = %existing, "[placement.persist] idempotency key already persisted");
                let order = self
                    .bounded(Collaborator::Ledger, self.collaborators.ledger.get(existing))
                    .await?
                    .map_err(ledger_unavailable)?;
                // an idempotent gateway hands both attempts the same capture
                if &order.payment_transaction != transaction {
                    self.compensate(transaction).await;
                }
                return Ok(Persisted::Existing(order));
            }
            Err(failure) => failure.to_string(),
        };

        let compensation = self.compensate(transaction).await;
        error!(
            transaction = %transaction,
            compensation = %compensation,
            detail = %detail,
            "[placement.persist] payment captured but order not persisted"
        );
        Err(PlacementError::Persistence {
            transaction: transaction.clone(),
            detail,
            compensation,
        })
    }

    async fn write_order(
        &self,
        request: &PlaceOrderRequest,
        totals: OrderTotals,
        applied: Option<&AppliedDiscount>,
        transaction: &TransactionRef,
    ) -> Result<Order, LedgerError> {
        let order = NewOrder::new(
            request.idempotency_key.clone(),
            request.user_id.clone(),
            request.items.clone(),
            totals,
            applied.map(|applied| applied.code.clone()),
            request.shipping_address.clone(),
            transaction.clone(),
        )?;
        self.bounded(Collaborator::Ledger, self.collaborators.ledger.create(order))
            .await
            .map_err(|timeout| LedgerError::store(LedgerOperation::Create, timeout.to_string()))?
    }

    #[instrument(name = "placement.compensate", skip_all, fields(transaction = %transaction))]
    async fn compensate(&self, transaction: &TransactionRef) -> Compensation {
        match self
            .call(Collaborator::Payment, self.collaborators.payments.void(transaction))
            .await
        {
            Ok(()) => {
                info!("[placement.compensate] payment voided");
                Compensation::Voided
            }
            Err(failure) => {
                error!(error = %failure, "[placement.compensate] void failed, charge orphaned");
                Compensation::VoidFailed(failure.to_string())
            }
        }
    }

    #[instrument(name = "placement.redeem", skip_all, fields(order_id = %order.id, code = %applied.code))]
    async fn redeem(&self, order: &Order, applied: &AppliedDiscount) -> RedemptionStatus {
        let mut expected_version = applied.code_version;
        let attempts = self.config.redemption_attempts.into_inner();

        for attempt in 1..=attempts {
            let request = RedemptionRequest {
                code_id: applied.code_id,
                expected_version,
                user_id: order.user_id.clone(),
                order_id: order.id,
                amount: applied.amount,
            };
            let outcome = self
                .bounded(
                    Collaborator::Promotions,
                    self.collaborators.promotions.redeem(request),
                )
                .await;
            match outcome {
                Ok(Ok(record)) => {
                    info!(redemption_id = %record.id, "[placement.redeem] redemption recorded");
                    return RedemptionStatus::Recorded(record.id);
                }
                Ok(Err(RedemptionError::VersionConflict { actual, .. })) => {
                    debug!(attempt, actual, "[placement.redeem] version conflict, retrying");
                    expected_version = actual;
                }
                Ok(Err(failure)) => {
                    warn!(error = %failure, "[placement.redeem] redemption not recorded");
                    return RedemptionStatus::Failed(failure.to_string());
                }
                Err(timeout) => {
                    warn!(error = %timeout, "[placement.redeem] redemption not recorded");
                    return RedemptionStatus::Failed(timeout.to_string());
                }
            }
        }

        let detail = format!("code version kept changing after {attempts} attempts");
        warn!(detail = %detail, "[placement.redeem] redemption not recorded");
        RedemptionStatus::Failed(detail)
    }

    #[instrument(name = "placement.publish", skip_all, fields(order_id = %order.id))]
    async fn publish(&self, order: &Order) -> EventDelivery {
        let event = FulfillmentEvent::for_order(order, self.clock.now());
        let outcome = self
            .bounded(
                Collaborator::Broker,
                self.collaborators.publisher.broadcast(&event),
            )
            .await
            .map_err(|timeout| timeout.to_string())
            .and_then(|published| published.map_err(|failure| failure.to_string()));

        match outcome {
            Ok(()) => {
                info!(event_id = %event.event_id, "[placement.publish] fulfillment event published");
                EventDelivery::Published(event.event_id)
            }
            Err(reason) => {
                warn!(
                    event_id = %event.event_id,
                    reason = %reason,
                    "[placement.publish] fulfillment event not delivered"
                );
                EventDelivery::Failed {
                    event_id: event.event_id,
                    reason,
                }
            }
        }
    }

    /// Runs `call` under the collaborator timeout.
    async fn bounded<T, E>(
        &self,
        collaborator: Collaborator,
        call: impl Future<Output = Result<T, E>> + Send,
    ) -> Result<Result<T, E>, CollaboratorError> {
        let after = self.config.collaborator_timeout.as_duration();
        tokio::time::timeout(after, call)
            .await
            .map_err(|_| CollaboratorError::TimedOut {
                collaborator,
                after,
            })
    }

    async fn call<T>(
        &self,
        collaborator: Collaborator,
        call: impl Future<Output = Result<T, CollaboratorError>> + Send,
    ) -> Result<T, CollaboratorError> {
        self.bounded(collaborator, call).await?
    }
}

enum Persisted {
    Created(Order),
    Existing(Order),
}

fn ledger_unavailable(error: LedgerError) -> CollaboratorError {
    CollaboratorError::unavailable(Collaborator::Ledger, error.to_string())
}

fn check_quote(quoted: &QuotedTotals, totals: &OrderTotals) -> Result<(), ValidationError> {
    let pairs = [
        ("subtotal", quoted.subtotal, totals.subtotal()),
        ("discount_amount", quoted.discount_amount, totals.discount_amount()),
        ("total", quoted.total, totals.total()),
    ];
    for (field, quoted, computed) in pairs {
        match quoted {
            Some(quoted) if quoted != computed => {
                return Err(ValidationError::QuoteMismatch {
                    field,
                    quoted,
                    computed,
                });
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(subtotal: u64, discount: u64) -> OrderTotals {
        OrderTotals::new(
            Money::from_cents(subtotal).unwrap(),
            Money::from_cents(discount).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn absent_quotes_always_match() {
        assert!(check_quote(&QuotedTotals::default(), &totals(100_000, 15_000)).is_ok());
    }

    #[test]
    fn matching_quotes_pass() {
        let quoted = QuotedTotals {
            subtotal: Some(Money::from_cents(100_000).unwrap()),
            discount_amount: Some(Money::from_cents(15_000).unwrap()),
            total: Some(Money::from_cents(85_000).unwrap()),
        };
        assert!(check_quote(&quoted, &totals(100_000, 15_000)).is_ok());
    }

    #[test]
    fn first_mismatching_quote_is_reported() {
        let quoted = QuotedTotals {
            subtotal: None,
            discount_amount: Some(Money::from_cents(20_000).unwrap()),
            total: Some(Money::from_cents(80_000).unwrap()),
        };
        let error = check_quote(&quoted, &totals(100_000, 15_000)).unwrap_err();
        assert!(matches!(
            error,
            ValidationError::QuoteMismatch { field: "discount_amount", .. }
        ));
    }

    #[test]
    fn terminal_states() {
        assert!(PlacementState::EventPublished(OrderId::generate()).is_terminal());
        assert!(PlacementState::Aborted("stock".to_string()).is_terminal());
        assert!(!PlacementState::Persisted(OrderId::generate()).is_terminal());
        assert!(!PlacementState::Validating.is_terminal());
    }
}
