//! Runnable services built on `orderflow`
//!
//! [`order_service`] exposes order placement, queries, status changes and
//! discount code administration over HTTP. The `checkout_service` example
//! wires it to in-memory collaborators and serves it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// These are examples, so we don't need to be as pedantic
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::use_self)]

/// HTTP surface of the order service
pub mod order_service;
