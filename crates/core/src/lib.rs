//! Coursecart Core - Shared domain types.
//!
//! This crate provides the types shared by every Coursecart component:
//! - `storefront` - Cart synchronization and checkout reconciliation engine
//! - `cli` - Command-line tools for migrations and cart/order inspection
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no database access,
//! no HTTP clients. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for identifiers, prices, emails, identities,
//!   and the checkout phase enum

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
