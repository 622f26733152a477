//! Failure injection for the order ledger and the fulfillment publisher.
//!
//! Wrap any implementation with `.with_chaos(config)` to make a fraction of
//! its calls fail the way an unreliable backing service would.

use async_trait::async_trait;
use chrono::NaiveDate;
use nutype::nutype;
use orderflow::{
    FulfillmentEvent, FulfillmentPublisher, IdempotencyKey, LedgerError, LedgerOperation,
    NewOrder, Order, OrderId, OrderLedger, OrderQuery, OrderStats, OrderStatus, Page,
    PublishError,
};
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};

/// Probability value for chaos injection rates.
///
/// A value in the range [0.0, 1.0] where 0.0 means never inject failures and
/// 1.0 means always inject failures.
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        Self::try_new(value.clamp(0.0, 1.0)).unwrap_or_else(|_| Self::never())
    }

    fn never() -> Self {
        // 0.0 is inside the validated range
        match Self::try_new(0.0) {
            Ok(probability) => probability,
            Err(_) => unreachable!("0.0 is a valid probability"),
        }
    }
}

/// Which calls fail, and how often.
#[derive(Debug, Clone)]
pub struct ChaosConfig {
    deterministic_seed: Option<u64>,
    failure_probability: Probability,
    read_failure_probability: Probability,
}

impl ChaosConfig {
    /// A config with a fixed RNG seed, for reproducible runs.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Probability that a write (ledger create/update, broadcast) fails.
    #[must_use]
    pub fn with_failure_probability(mut self, probability: f32) -> Self {
        self.failure_probability = Probability::clamped(probability);
        self
    }

    /// Probability that a ledger read fails.
    #[must_use]
    pub fn with_read_failure_probability(mut self, probability: f32) -> Self {
        self.read_failure_probability = Probability::clamped(probability);
        self
    }
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            failure_probability: Probability::never(),
            read_failure_probability: Probability::never(),
        }
    }
}

struct Injector {
    rng: Mutex<StdRng>,
}

impl Injector {
    fn new(config: &ChaosConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.rng.lock().random_bool(f64::from(probability))
    }
}

/// An [`OrderLedger`] that fails some calls with [`LedgerError::StoreFailure`].
pub struct ChaosLedger<L> {
    ledger: L,
    config: ChaosConfig,
    injector: Injector,
}

impl<L> ChaosLedger<L> {
    /// Wraps `ledger`.
    pub fn new(ledger: L, config: ChaosConfig) -> Self {
        let injector = Injector::new(&config);
        Self {
            ledger,
            config,
            injector,
        }
    }

    fn fail_write(&self, operation: LedgerOperation) -> Result<(), LedgerError> {
        if self.injector.should_inject(self.config.failure_probability) {
            return Err(LedgerError::store(operation, "chaos: injected failure"));
        }
        Ok(())
    }

    fn fail_read(&self, operation: LedgerOperation) -> Result<(), LedgerError> {
        if self
            .injector
            .should_inject(self.config.read_failure_probability)
        {
            return Err(LedgerError::store(operation, "chaos: injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl<L> OrderLedger for ChaosLedger<L>
where
    L: OrderLedger,
{
    async fn create(&self, order: NewOrder) -> Result<Order, LedgerError> {
        self.fail_write(LedgerOperation::Create)?;
        self.ledger.create(order).await
    }

    async fn get(&self, id: OrderId) -> Result<Order, LedgerError> {
        self.fail_read(LedgerOperation::Read)?;
        self.ledger.get(id).await
    }

    async fn find_by_idempotency_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<Order>, LedgerError> {
        self.fail_read(LedgerOperation::Read)?;
        self.ledger.find_by_idempotency_key(key).await
    }

    async fn list(&self, query: &OrderQuery) -> Result<Page<Order>, LedgerError> {
        self.fail_read(LedgerOperation::Read)?;
        self.ledger.list(query).await
    }

    async fn update_status(&self, id: OrderId, status: OrderStatus) -> Result<Order, LedgerError> {
        self.fail_write(LedgerOperation::UpdateStatus)?;
        self.ledger.update_status(id, status).await
    }

    async fn stats(&self, today: NaiveDate) -> Result<OrderStats, LedgerError> {
        self.fail_read(LedgerOperation::Stats)?;
        self.ledger.stats(today).await
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        self.fail_read(LedgerOperation::Read)?;
        self.ledger.ping().await
    }
}

/// A [`FulfillmentPublisher`] that fails some broadcasts.
pub struct ChaosPublisher<P> {
    publisher: P,
    config: ChaosConfig,
    injector: Injector,
}

impl<P> ChaosPublisher<P> {
    /// Wraps `publisher`.
    pub fn new(publisher: P, config: ChaosConfig) -> Self {
        let injector = Injector::new(&config);
        Self {
            publisher,
            config,
            injector,
        }
    }
}

#[async_trait]
impl<P> FulfillmentPublisher for ChaosPublisher<P>
where
    P: FulfillmentPublisher,
{
    async fn broadcast(&self, event: &FulfillmentEvent) -> Result<(), PublishError> {
        if self.injector.should_inject(self.config.failure_probability) {
            return Err(PublishError::Failed {
                exchange: "chaos".to_string(),
                event_id: event.event_id,
                detail: "chaos: injected failure".to_string(),
            });
        }
        self.publisher.broadcast(event).await
    }
}

/// Adds `.with_chaos(config)` to every ledger.
pub trait ChaosLedgerExt: Sized {
    /// Wraps `self` in a [`ChaosLedger`].
    fn with_chaos(self, config: ChaosConfig) -> ChaosLedger<Self>;
}

impl<L> ChaosLedgerExt for L
where
    L: OrderLedger,
{
    fn with_chaos(self, config: ChaosConfig) -> ChaosLedger<Self> {
        ChaosLedger::new(self, config)
    }
}

/// Adds `.with_publish_chaos(config)` to every publisher.
pub trait ChaosPublisherExt: Sized {
    /// Wraps `self` in a [`ChaosPublisher`].
    fn with_publish_chaos(self, config: ChaosConfig) -> ChaosPublisher<Self>;
}

impl<P> ChaosPublisherExt for P
where
    P: FulfillmentPublisher,
{
    fn with_publish_chaos(self, config: ChaosConfig) -> ChaosPublisher<Self> {
        ChaosPublisher::new(self, config)
    }
}
