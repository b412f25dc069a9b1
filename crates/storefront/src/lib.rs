//! Coursecart storefront engine.
//!
//! Keeps a shopper's cart in sync between local state and a remote per-user
//! cart record, and reconciles checkouts into durable order records.
//!
//! # Modules
//!
//! - [`config`] - Environment-driven configuration
//! - [`db`] - Cart and order stores (in-memory and `PostgreSQL`)
//! - [`error`] - Cart and checkout errors with Sentry reporting
//! - [`models`] - Cart line items, checkout batches and order records
//! - [`services`] - Cart state, checkout reconciler, payment handoff, identity feed
//! - [`telemetry`] - Tracing subscriber and Sentry setup

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent, so a
/// poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
