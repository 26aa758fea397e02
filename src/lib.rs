#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # short-circuit
//!
//! A circuit breaker guard for calls to unreliable operations, typically
//! remote service calls. The breaker observes success and failure of every
//! guarded call, and once an operation has failed too many times in a row it
//! stops invoking the operation altogether, giving the dependency time to
//! recover before traffic resumes.
//!
//! Generally, there are two steps when using the breaker:
//! 1. Build a [`Breaker`] from a [`Rule`] describing the failure threshold
//!    and the recovery timeout, and keep it next to the protected call site.
//! 2. Route every invocation of the operation through [`Breaker::call`].
//!
//! ## Add Dependency
//!
//! Add the dependency in `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! short-circuit = { version = "0.1.0" }
//! ```
//!
//! Optional features:
//! - async: Guard asynchronous operations with `Breaker::call_async`.
//! - logger_env: Use `env_logger` to initialize logging.
//! - logger_log4rs: Use `log4rs` to initialize logging.
//!
//! ## Guarding a call
//!
//! The guarded call either returns the operation's result unchanged, fails
//! with the operation's own error wrapped in [`CallError::Inner`], or is
//! rejected outright with [`CallError::Open`] while the breaker is tripped.
//! The three outcomes are always distinguishable:
//!
//! ```rust
//! use short_circuit::{Breaker, CallError, Rule};
//!
//! let breaker = Breaker::new(Rule {
//!     resource: "remote_quote_service".into(),
//!     max_failures: 3,
//!     retry_timeout_ms: 1000,
//! })
//! .unwrap();
//!
//! match breaker.call(|| fetch_quote()) {
//!     Ok(quote) => println!("{}", quote),
//!     Err(CallError::Inner(err)) => eprintln!("dependency failed: {}", err),
//!     Err(CallError::Open) => eprintln!("breaker is open, not even trying"),
//! }
//! ```
//!
//! After `max_failures` consecutive failures the breaker trips: calls are
//! rejected without touching the operation until `retry_timeout_ms` has
//! elapsed. Then a single trial call is let through; if it succeeds the
//! breaker closes, if it fails the breaker re-opens and the timeout window
//! restarts. The failure counter survives the trial, so a failed trial
//! re-opens immediately instead of re-accumulating failures from zero.
//!
//! State transitions can be observed with [`StateChangeListener`]s handed to
//! [`Breaker::with_listeners`], and the breaker exposes [`Breaker::is_tripped`],
//! [`Breaker::current_failures`] and [`Breaker::current_state`] for health
//! checks by the owning process.

// This module is not intended to be part of the public API. In general, any
// `doc(hidden)` code is not part of the crate's public and stable API.
#[macro_use]
#[doc(hidden)]
pub mod macros;

/// Core implementation of the breaker: the state machine, the guarded-call
/// contract and the rule it is configured from.
pub mod core;
/// Adapters for different logging crates.
pub mod logging;
// Utility functions.
pub mod utils;

// re-export preludes
pub use crate::core::*;

pub type Result<T> = anyhow::Result<T>;
pub type Error = anyhow::Error;
