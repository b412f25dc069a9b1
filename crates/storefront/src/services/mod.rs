//! Cart and checkout services.
//!
//! # Services
//!
//! - [`cart`] - Live cart state mirrored from the remote cart store
//! - [`checkout`] - Checkout reconciliation into order records
//! - [`payment`] - Payment gateway handoff
//! - [`identity`] - Feed of the current authenticated identity

pub mod cart;
pub mod checkout;
pub mod identity;
pub mod payment;

pub use cart::{CartSnapshot, CartState};
pub use checkout::{CheckoutReceipt, CheckoutReconciler};
pub use identity::IdentityFeed;
pub use payment::{
    GatewayError, HostedGateway, InProcessGateway, PaymentGateway, PaymentHandoff, PaymentOutcome,
    PaymentRequest, PendingPayments,
};
