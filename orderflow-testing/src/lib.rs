//! Test utilities for `orderflow`
//!
//! Failure injection for ledgers and publishers, an event-collecting
//! publisher, scripted stock and payment collaborators, hooked promotions, and a contract suite
//! every [`orderflow::OrderLedger`] implementation should pass.

#![forbid(unsafe_code)]
#![deny(
    bad_style,
    deprecated,
    meta_variable_misuse,
    non_ascii_idents,
    rust_2018_idioms,
    trivial_casts,
    unused_imports,
    unused_must_use,
    unused_mut,
    unused_variables
)]

pub mod chaos;
pub mod contract;
pub mod event_collector;
pub mod scripted;

pub use chaos::*;
pub use event_collector::EventCollector;
pub use scripted::{
    HookedPromotions, PaymentScript, ScriptedPayments, ScriptedStock, StockScript, VoidScript,
};
