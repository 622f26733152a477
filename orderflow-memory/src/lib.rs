//! In-memory collaborators for `orderflow`
//!
//! Thread-safe implementations of every collaborator port plus an
//! in-process fan-out exchange, useful for tests, demos and local
//! development where no external services are available.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod exchange;
mod inventory;
mod ledger;
mod notifier;
mod payments;
mod promotions;
mod worker;

pub use exchange::{Delivery, FanoutExchange, QueueSubscription};
pub use inventory::InMemoryInventory;
pub use ledger::InMemoryOrderLedger;
pub use notifier::InMemoryNotifier;
pub use payments::{Capture, SimulatedPaymentGateway};
pub use promotions::{InMemoryPromotions, PromotionsAdminError};
pub use worker::{run_consumer, spawn_consumer, ConsumerReport};
