use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use orderflow::{
    Collaborator, CollaboratorError, IdempotencyKey, Money, PaymentAuthorization, PaymentGateway,
    PaymentOutcome, Timestamp, TransactionRef,
};
use parking_lot::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

/// A captured payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Transaction reference handed back to the caller.
    pub transaction: TransactionRef,
    /// Checkout key the capture was made for.
    pub idempotency_key: IdempotencyKey,
    /// Amount captured.
    pub amount: Money,
    /// Whether the capture was later voided.
    pub voided: bool,
}

#[derive(Default)]
struct PaymentState {
    captures: Vec<Capture>,
    by_key: HashMap<IdempotencyKey, usize>,
}

/// Simulated card processor.
///
/// Approves cards whose last digit is even and declines odd ones with
/// "insufficient funds". Expired cards are declined. Repeating an
/// authorization with the same idempotency key returns the live capture
/// when the amount matches and is declined when it does not. A key whose
/// capture was voided is authorized afresh.
#[derive(Clone, Default)]
pub struct SimulatedPaymentGateway {
    state: Arc<Mutex<PaymentState>>,
}

impl SimulatedPaymentGateway {
    /// Creates a gateway with no captures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capture, in order.
    pub fn captures(&self) -> Vec<Capture> {
        self.state.lock().captures.clone()
    }

    /// Captures that have not been voided.
    pub fn settled(&self) -> Vec<Capture> {
        self.captures()
            .into_iter()
            .filter(|capture| !capture.voided)
            .collect()
    }

    /// Transactions that were voided.
    pub fn voids(&self) -> Vec<TransactionRef> {
        self.captures()
            .into_iter()
            .filter(|capture| capture.voided)
            .map(|capture| capture.transaction)
            .collect()
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    #[instrument(name = "memory.payments.authorize", skip_all, fields(amount = %request.amount, card = %request.instrument.card_number))]
    async fn authorize(
        &self,
        request: &PaymentAuthorization,
    ) -> Result<PaymentOutcome, CollaboratorError> {
        let mut state = self.state.lock();
        if let Some(capture) = state
            .by_key
            .get(&request.idempotency_key)
            .map(|index| &state.captures[*index])
            .filter(|capture| !capture.voided)
        {
            if capture.amount != request.amount {
                return Ok(PaymentOutcome::Declined {
                    reason: "idempotency key already captured a different amount".to_string(),
                });
            }
            return Ok(PaymentOutcome::Approved {
                transaction: capture.transaction.clone(),
                amount: capture.amount,
            });
        }

        if request.instrument.expiry.is_expired_at(Timestamp::now()) {
            return Ok(PaymentOutcome::Declined {
                reason: "card expired".to_string(),
            });
        }
        if request.instrument.card_number.last_digit() % 2 != 0 {
            return Ok(PaymentOutcome::Declined {
                reason: "insufficient funds".to_string(),
            });
        }

        let transaction = TransactionRef::try_new(format!("TXN_{}", Uuid::now_v7().simple()))
            .map_err(|error| CollaboratorError::unavailable(Collaborator::Payment, error.to_string()))?;
        let index = state.captures.len();
        state.captures.push(Capture {
            transaction: transaction.clone(),
            idempotency_key: request.idempotency_key.clone(),
            amount: request.amount,
            voided: false,
        });
        state.by_key.insert(request.idempotency_key.clone(), index);
        info!(transaction = %transaction, "[memory.payments.authorize] payment captured");
        Ok(PaymentOutcome::Approved {
            transaction,
            amount: request.amount,
        })
    }

    #[instrument(name = "memory.payments.void", skip_all, fields(transaction = %transaction))]
    async fn void(&self, transaction: &TransactionRef) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        let capture = state
            .captures
            .iter_mut()
            .find(|capture| &capture.transaction == transaction)
            .ok_or_else(|| {
                CollaboratorError::unavailable(
                    Collaborator::Payment,
                    format!("unknown transaction {transaction}"),
                )
            })?;
        capture.voided = true;
        Ok(())
    }
}
