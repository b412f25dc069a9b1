//! Domain models for the cart and checkout engine.
//!
//! - [`cart`] - Line items and the per-user item list
//! - [`checkout`] - The transient free/paid partition of a cart snapshot
//! - [`order`] - Durable order records

pub mod cart;
pub mod checkout;
pub mod order;

pub use cart::{CartLineItem, ItemList};
pub use checkout::CheckoutBatch;
pub use order::{OrderRecord, PaymentRef};
