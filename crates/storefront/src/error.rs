//! Unified error handling with Sentry integration.
//!
//! Cart mutations fail with [`CartError`], checkout attempts with
//! [`CheckoutError`]. Both map every variant to a distinct user-facing message
//! via `user_message()`, which never leaks store or gateway internals; the
//! detail goes to logs and Sentry instead. Nothing in this crate retries on its
//! own; re-invoking an operation is the caller's decision.

use thiserror::Error;

use coursecart_core::{CheckoutPhase, ItemId, OrderId, PaymentId, PriceError};

use crate::db::RepositoryError;
use crate::services::payment::GatewayError;

/// Errors from cart mutations.
#[derive(Debug, Error)]
pub enum CartError {
    /// No identity is signed in.
    #[error("not authenticated")]
    NotAuthenticated,

    /// A conditional write lost a race with another writer of the same cart.
    #[error("cart changed concurrently: {0}")]
    Conflict(String),

    /// The remote cart store failed.
    #[error("cart store error: {0}")]
    Store(RepositoryError),
}

impl From<RepositoryError> for CartError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Conflict(detail) => Self::Conflict(detail),
            other => Self::Store(other),
        }
    }
}

impl CartError {
    /// Message safe to show to the shopper.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "Please sign in to update your cart.",
            Self::Conflict(_) => "Your cart changed in another window. Please try again.",
            Self::Store(_) => "We couldn't save your cart. Please try again.",
        }
    }
}

/// Errors from a checkout attempt.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// No identity is signed in.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The cart had no items when checkout began.
    #[error("cart is empty")]
    EmptyCart,

    /// Another checkout on the same reconciler has not finished.
    #[error("a checkout is already in progress")]
    CheckoutInProgress,

    /// The paid total could not be computed or scaled for the gateway.
    #[error("invalid checkout total: {0}")]
    InvalidTotal(#[from] PriceError),

    /// The payment handoff could not be started.
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The gateway flow ended without a confirmation.
    #[error("payment abandoned")]
    GatewayAbandoned,

    /// No confirmation arrived within the configured payment timeout.
    #[error("payment timed out")]
    PaymentTimedOut,

    /// The waiting checkout was cancelled.
    #[error("payment cancelled")]
    PaymentCancelled,

    /// An order record could not be written.
    ///
    /// Records in `created` stay in place; nothing is rolled back. During
    /// [`CheckoutPhase::FulfillingPaid`] the payment has already been taken.
    #[error("order creation failed during {phase} for item {failed_item}: {source}")]
    OrderCreationFailed {
        phase: CheckoutPhase,
        failed_item: ItemId,
        created: Vec<OrderId>,
        payment_id: Option<PaymentId>,
        #[source]
        source: RepositoryError,
    },
}

impl CheckoutError {
    /// Whether money may have moved without a recorded entitlement.
    #[must_use]
    pub const fn is_severe(&self) -> bool {
        matches!(
            self,
            Self::OrderCreationFailed {
                phase: CheckoutPhase::FulfillingPaid,
                ..
            }
        )
    }

    /// Whether the attempt ended while waiting for payment, with nothing
    /// charged and the cart untouched.
    #[must_use]
    pub const fn is_payment_interrupted(&self) -> bool {
        matches!(
            self,
            Self::GatewayAbandoned | Self::PaymentTimedOut | Self::PaymentCancelled
        )
    }

    /// Message safe to show to the shopper.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotAuthenticated => "Please sign in to check out.".to_string(),
            Self::EmptyCart => "Your cart is empty.".to_string(),
            Self::CheckoutInProgress => "A checkout is already in progress.".to_string(),
            Self::InvalidTotal(_) => "Your cart total could not be calculated.".to_string(),
            Self::Gateway(_) => {
                "We couldn't reach the payment provider. Please try again.".to_string()
            }
            Self::GatewayAbandoned => {
                "Payment was not completed. Your cart has been kept.".to_string()
            }
            Self::PaymentTimedOut => "Payment timed out. Your cart has been kept.".to_string(),
            Self::PaymentCancelled => "Payment was cancelled. Your cart has been kept.".to_string(),
            Self::OrderCreationFailed {
                payment_id: Some(payment_id),
                ..
            } => format!(
                "Your payment was received but we couldn't record your order. \
                 Please contact support with payment reference {payment_id}."
            ),
            Self::OrderCreationFailed { .. } => {
                "We couldn't record some of your free items. Please try again.".to_string()
            }
        }
    }

    /// Send server-side failures to Sentry and the log.
    ///
    /// Validation and payment-interruption errors are expected outcomes and
    /// are not reported.
    pub fn report(&self) {
        let level = if self.is_severe() {
            sentry::Level::Fatal
        } else if matches!(self, Self::Gateway(_) | Self::OrderCreationFailed { .. }) {
            sentry::Level::Error
        } else {
            return;
        };

        let event_id = sentry::with_scope(
            |scope| scope.set_level(Some(level)),
            || sentry::capture_error(self),
        );
        tracing::error!(
            error = %self,
            severe = self.is_severe(),
            sentry_event_id = %event_id,
            "Checkout error"
        );
    }
}

/// Report a checkout dropped while its paid orders were being recorded.
///
/// The payment was captured and some of its orders may be missing, so this
/// goes to Sentry at fatal level like a paid-phase [`CheckoutError`].
pub fn report_interrupted_fulfillment(payment_id: Option<&PaymentId>, recorded: usize) {
    let payment = payment_id.map_or("unknown", PaymentId::as_str);
    let message = "Checkout dropped while recording paid orders";

    let event_id = sentry::with_scope(
        |scope| {
            scope.set_level(Some(sentry::Level::Fatal));
            scope.set_tag("payment_id", payment);
        },
        || sentry::capture_message(message, sentry::Level::Fatal),
    );
    tracing::error!(
        payment_id = payment,
        recorded,
        sentry_event_id = %event_id,
        "{message}"
    );
}

/// Set the Sentry user context from an identity.
///
/// Call this after the identity provider reports a sign-in.
pub fn set_sentry_user(user_id: &impl ToString, email: Option<&str>) {
    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry::User {
            id: Some(user_id.to_string()),
            email: email.map(String::from),
            ..Default::default()
        }));
    });
}

/// Clear the Sentry user context.
///
/// Call this on sign-out to stop associating errors with the user.
pub fn clear_sentry_user() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Add a breadcrumb for a cart or checkout action.
///
/// Breadcrumbs appear in Sentry error reports to show the trail of actions
/// leading up to an error.
pub fn add_breadcrumb(category: &str, message: &str, data: &[(&str, &str)]) {
    let mut breadcrumb = sentry::Breadcrumb {
        category: Some(category.to_string()),
        message: Some(message.to_string()),
        level: sentry::Level::Info,
        ..Default::default()
    };

    for (key, value) in data {
        breadcrumb.data.insert(
            (*key).to_string(),
            serde_json::Value::String((*value).to_string()),
        );
    }

    sentry::add_breadcrumb(breadcrumb);
}
