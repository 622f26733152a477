//! Collaborators whose answers are set by the test.
//!
//! Each one counts its calls so tests can assert that a collaborator was or
//! was not reached, for example that a stock rejection never touches payment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orderflow::{
    Collaborator, CollaboratorError, DiscountCode, DiscountCodeId, Money, PaymentAuthorization,
    PaymentGateway, PaymentOutcome, ProductId, PromoCode, Promotions, RedemptionError,
    RedemptionRecord, RedemptionRequest, StockCheck, StockLine, StockPreflight, TransactionRef,
    UserId,
};
use parking_lot::Mutex;

/// What [`ScriptedStock`] answers.
#[derive(Debug, Clone)]
pub enum StockScript {
    /// Every line is available.
    Available,
    /// Reject on `product_id`.
    Reject {
        /// Product reported as short.
        product_id: ProductId,
        /// Reason reported.
        reason: String,
    },
    /// Fail as if the inventory service were down.
    Unavailable,
    /// Sleep before answering `Available`.
    Delay(Duration),
}

/// A [`StockPreflight`] driven by a [`StockScript`].
#[derive(Debug)]
pub struct ScriptedStock {
    script: Mutex<StockScript>,
    calls: AtomicUsize,
}

impl ScriptedStock {
    /// Creates a stock check that answers with `script`.
    pub fn new(script: StockScript) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always available.
    pub fn available() -> Self {
        Self::new(StockScript::Available)
    }

    /// Replaces the script for later calls.
    pub fn set_script(&self, script: StockScript) {
        *self.script.lock() = script;
    }

    /// Number of checks made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StockPreflight for ScriptedStock {
    async fn check(&self, _lines: &[StockLine]) -> Result<StockCheck, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();
        match script {
            StockScript::Available => Ok(StockCheck::Available),
            StockScript::Reject { product_id, reason } => {
                Ok(StockCheck::Rejected { product_id, reason })
            }
            StockScript::Unavailable => Err(CollaboratorError::unavailable(
                Collaborator::Inventory,
                "scripted outage",
            )),
            StockScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(StockCheck::Available)
            }
        }
    }
}

/// What [`ScriptedPayments`] answers to an authorization.
#[derive(Debug, Clone)]
pub enum PaymentScript {
    /// Capture and return a fresh transaction reference.
    Approve,
    /// Capture, but report a fixed amount instead of the requested one.
    ApproveAmount(Money),
    /// Decline with the given reason.
    Decline(String),
    /// Fail as if the payment service were down.
    Unavailable,
    /// Sleep before approving.
    Delay(Duration),
}

/// What [`ScriptedPayments`] answers to a void.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoidScript {
    /// The void succeeds.
    Succeed,
    /// The void fails.
    Fail,
}

#[derive(Debug, Default)]
struct PaymentLog {
    authorizations: Vec<PaymentAuthorization>,
    captured: Vec<TransactionRef>,
    voided: Vec<TransactionRef>,
}

/// A [`PaymentGateway`] driven by a [`PaymentScript`] and a [`VoidScript`].
#[derive(Debug)]
pub struct ScriptedPayments {
    authorize: Mutex<PaymentScript>,
    void: Mutex<VoidScript>,
    log: Mutex<PaymentLog>,
    void_calls: AtomicUsize,
}

impl ScriptedPayments {
    /// Creates a gateway that answers authorizations with `script` and
    /// accepts voids.
    pub fn new(script: PaymentScript) -> Self {
        Self {
            authorize: Mutex::new(script),
            void: Mutex::new(VoidScript::Succeed),
            log: Mutex::new(PaymentLog::default()),
            void_calls: AtomicUsize::new(0),
        }
    }

    /// Always approves.
    pub fn approving() -> Self {
        Self::new(PaymentScript::Approve)
    }

    /// Sets how voids are answered.
    #[must_use]
    pub fn with_void(self, script: VoidScript) -> Self {
        *self.void.lock() = script;
        self
    }

    /// Replaces the authorization script for later calls.
    pub fn set_script(&self, script: PaymentScript) {
        *self.authorize.lock() = script;
    }

    /// Every authorization request received.
    pub fn authorizations(&self) -> Vec<PaymentAuthorization> {
        self.log.lock().authorizations.clone()
    }

    /// Transactions captured so far, voided or not.
    pub fn captured(&self) -> Vec<TransactionRef> {
        self.log.lock().captured.clone()
    }

    /// Transactions successfully voided.
    pub fn voided(&self) -> Vec<TransactionRef> {
        self.log.lock().voided.clone()
    }

    /// Void attempts, successful or not.
    pub fn void_calls(&self) -> usize {
        self.void_calls.load(Ordering::SeqCst)
    }

    fn capture(
        &self,
        request: &PaymentAuthorization,
        amount: Money,
    ) -> Result<PaymentOutcome, CollaboratorError> {
        let mut log = self.log.lock();
        let transaction = TransactionRef::try_new(format!("TXN_TEST_{}", log.captured.len() + 1))
            .map_err(|error| CollaboratorError::unavailable(Collaborator::Payment, error.to_string()))?;
        log.authorizations.push(request.clone());
        log.captured.push(transaction.clone());
        Ok(PaymentOutcome::Approved {
            transaction,
            amount,
        })
    }
}

#[async_trait]
impl PaymentGateway for ScriptedPayments {
    async fn authorize(
        &self,
        request: &PaymentAuthorization,
    ) -> Result<PaymentOutcome, CollaboratorError> {
        let script = self.authorize.lock().clone();
        match script {
            PaymentScript::Approve => self.capture(request, request.amount),
            PaymentScript::ApproveAmount(amount) => self.capture(request, amount),
            PaymentScript::Decline(reason) => {
                self.log.lock().authorizations.push(request.clone());
                Ok(PaymentOutcome::Declined { reason })
            }
            PaymentScript::Unavailable => {
                self.log.lock().authorizations.push(request.clone());
                Err(CollaboratorError::unavailable(
                    Collaborator::Payment,
                    "scripted outage",
                ))
            }
            PaymentScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                self.capture(request, request.amount)
            }
        }
    }

    async fn void(&self, transaction: &TransactionRef) -> Result<(), CollaboratorError> {
        self.void_calls.fetch_add(1, Ordering::SeqCst);
        let script = *self.void.lock();
        match script {
            VoidScript::Succeed => {
                self.log.lock().voided.push(transaction.clone());
                Ok(())
            }
            VoidScript::Fail => Err(CollaboratorError::unavailable(
                Collaborator::Payment,
                "scripted void failure",
            )),
        }
    }
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// A [`Promotions`] collaborator that runs a test hook before delegating.
///
/// Hooks receive the 1-based number of the call they precede, so a test can
/// change a code between the orchestrator's evaluation and its re-validation,
/// or between two redemption attempts.
pub struct HookedPromotions<P> {
    inner: P,
    before_find: Option<Hook>,
    before_redeem: Option<Hook>,
    redeem_outage: bool,
    find_calls: AtomicUsize,
    redeem_calls: AtomicUsize,
}

impl<P: Promotions> HookedPromotions<P> {
    /// Wraps `inner` with no hooks.
    pub const fn new(inner: P) -> Self {
        Self {
            inner,
            before_find: None,
            before_redeem: None,
            redeem_outage: false,
            find_calls: AtomicUsize::new(0),
            redeem_calls: AtomicUsize::new(0),
        }
    }

    /// Runs `hook` before every code lookup.
    #[must_use]
    pub fn before_find(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.before_find = Some(Box::new(hook));
        self
    }

    /// Runs `hook` before every redemption attempt.
    #[must_use]
    pub fn before_redeem(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.before_redeem = Some(Box::new(hook));
        self
    }

    /// Fails every redemption as if the promotions service were down.
    #[must_use]
    pub const fn with_redeem_outage(mut self) -> Self {
        self.redeem_outage = true;
        self
    }

    /// Code lookups received.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Redemption attempts received.
    pub fn redeem_calls(&self) -> usize {
        self.redeem_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: Promotions> Promotions for HookedPromotions<P> {
    async fn find_code(&self, code: &PromoCode) -> Result<Option<DiscountCode>, CollaboratorError> {
        let call = self.find_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.before_find {
            hook(call);
        }
        self.inner.find_code(code).await
    }

    async fn redemptions(
        &self,
        user_id: &UserId,
        code_id: DiscountCodeId,
    ) -> Result<Vec<RedemptionRecord>, CollaboratorError> {
        self.inner.redemptions(user_id, code_id).await
    }

    async fn redeem(&self, request: RedemptionRequest) -> Result<RedemptionRecord, RedemptionError> {
        let call = self.redeem_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.before_redeem {
            hook(call);
        }
        if self.redeem_outage {
            return Err(CollaboratorError::unavailable(
                Collaborator::Promotions,
                "scripted redemption outage",
            )
            .into());
        }
        self.inner.redeem(request).await
    }
}
