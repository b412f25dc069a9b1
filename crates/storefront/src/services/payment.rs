//! Payment gateway handoff.
//!
//! Starting a payment registers an intent with [`PendingPayments`] and hands
//! back a [`PaymentHandoff`]. The gateway's completion callback (a webhook,
//! a redirect handler or a test) later calls [`PendingPayments::confirm`]
//! with the gateway payment id, which resolves the handoff. If the intent is
//! abandoned instead, the handoff resolves to [`PaymentOutcome::Abandoned`].
//!
//! # Gateways
//!
//! - [`HostedGateway`] - Creates a gateway order over HTTPS with basic auth
//! - [`InProcessGateway`] - Records requests for tests and local development

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::instrument;
use url::Url;

use coursecart_core::{CurrencyCode, PaymentId, UserId};

use crate::config::GatewayConfig;
use crate::lock;

/// Errors that can occur when talking to a payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The gateway answered with a non-success status.
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Rate limited by the gateway.
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// A confirmation arrived for an intent nobody is waiting on.
    #[error("no checkout is awaiting payment intent {0}")]
    NotAwaiting(String),

    /// The configured gateway URL cannot address the API.
    #[error("invalid gateway URL: {0}")]
    InvalidUrl(String),
}

/// What the gateway is asked to collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Total in the currency's minor units.
    pub amount_minor: u64,
    pub currency: CurrencyCode,
    pub description: String,
    /// Merchant-side reference echoed back by the gateway.
    pub receipt: String,
    pub user_id: UserId,
}

/// How a payment handoff ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Confirmed(PaymentId),
    Abandoned,
}

/// A started payment, resolved by a later confirmation or abandonment.
///
/// Dropping the handoff tells the gateway side nobody is waiting any more;
/// a confirmation arriving after that is refused with
/// [`GatewayError::NotAwaiting`].
#[derive(Debug)]
pub struct PaymentHandoff {
    intent_id: String,
    rx: oneshot::Receiver<PaymentId>,
}

impl PaymentHandoff {
    /// Gateway-side identifier of this payment intent.
    #[must_use]
    pub fn intent_id(&self) -> &str {
        &self.intent_id
    }

    /// Wait for the payment to be confirmed or abandoned.
    pub async fn outcome(self) -> PaymentOutcome {
        match self.rx.await {
            Ok(payment_id) => PaymentOutcome::Confirmed(payment_id),
            Err(_) => PaymentOutcome::Abandoned,
        }
    }
}

/// Registry of payment intents awaiting a gateway confirmation.
#[derive(Debug, Default)]
pub struct PendingPayments {
    waiting: Mutex<HashMap<String, oneshot::Sender<PaymentId>>>,
}

impl PendingPayments {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting on `intent_id`.
    pub fn register(&self, intent_id: impl Into<String>) -> PaymentHandoff {
        let intent_id = intent_id.into();
        let (tx, rx) = oneshot::channel();

        let mut waiting = lock(&self.waiting);
        waiting.retain(|_, sender| !sender.is_closed());
        waiting.insert(intent_id.clone(), tx);

        PaymentHandoff { intent_id, rx }
    }

    /// Deliver the gateway's confirmation for `intent_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotAwaiting`] if the intent is unknown or its
    /// checkout already stopped waiting. The payment may then have been
    /// captured with no order recorded, so this is logged at error level.
    #[instrument(skip(self))]
    pub fn confirm(&self, intent_id: &str, payment_id: PaymentId) -> Result<(), GatewayError> {
        let sender = lock(&self.waiting).remove(intent_id);

        let delivered = sender.is_some_and(|tx| tx.send(payment_id.clone()).is_ok());
        if delivered {
            tracing::info!("Payment confirmed");
            Ok(())
        } else {
            tracing::error!(
                intent_id,
                payment_id = %payment_id,
                "Payment confirmed for an intent no checkout is waiting on"
            );
            Err(GatewayError::NotAwaiting(intent_id.to_string()))
        }
    }

    /// Give up on `intent_id`; its handoff resolves as abandoned.
    ///
    /// Returns whether the intent was outstanding.
    pub fn abandon(&self, intent_id: &str) -> bool {
        let removed = lock(&self.waiting).remove(intent_id);
        if removed.is_some() {
            tracing::info!(intent_id, "Payment abandoned");
        }
        removed.is_some_and(|tx| !tx.is_closed())
    }

    /// Intents still awaiting a confirmation.
    #[must_use]
    pub fn outstanding(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.waiting)
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// A payment provider able to start a checkout payment.
pub trait PaymentGateway: Send + Sync + 'static {
    /// Hand `request` to the gateway.
    ///
    /// Resolves once the payment has been *started*; the returned handoff
    /// resolves once it has been confirmed or abandoned.
    fn begin(
        &self,
        request: &PaymentRequest,
    ) -> impl Future<Output = Result<PaymentHandoff, GatewayError>> + Send;
}

// =============================================================================
// In-process gateway
// =============================================================================

/// Gateway that only records requests; confirmations come from the caller.
#[derive(Debug, Default)]
pub struct InProcessGateway {
    pending: Arc<PendingPayments>,
    requests: Mutex<Vec<PaymentRequest>>,
    next_intent: AtomicU64,
    refuse_next: AtomicBool,
}

impl InProcessGateway {
    /// Create a gateway with its own pending-payment registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry confirmations are delivered through.
    #[must_use]
    pub const fn pending(&self) -> &Arc<PendingPayments> {
        &self.pending
    }

    /// Every request handed to this gateway, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<PaymentRequest> {
        lock(&self.requests).clone()
    }

    /// Make the next `begin` fail as if the provider were down.
    pub fn refuse_next(&self) {
        self.refuse_next.store(true, Ordering::SeqCst);
    }
}

impl PaymentGateway for InProcessGateway {
    async fn begin(&self, request: &PaymentRequest) -> Result<PaymentHandoff, GatewayError> {
        lock(&self.requests).push(request.clone());

        if self.refuse_next.swap(false, Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 503,
                body: "payment provider unavailable".to_string(),
            });
        }

        let n = self.next_intent.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.pending.register(format!("intent_{n}")))
    }
}

// =============================================================================
// Hosted gateway
// =============================================================================

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
    notes: OrderNotes<'a>,
}

#[derive(Serialize)]
struct OrderNotes<'a> {
    description: &'a str,
    user_id: &'a str,
}

impl<'a> From<&'a PaymentRequest> for CreateOrderBody<'a> {
    fn from(request: &'a PaymentRequest) -> Self {
        Self {
            amount: request.amount_minor,
            currency: request.currency.code(),
            receipt: &request.receipt,
            notes: OrderNotes {
                description: &request.description,
                user_id: request.user_id.as_str(),
            },
        }
    }
}

#[derive(Deserialize)]
struct CreatedOrder {
    id: String,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a hosted gateway's order API.
///
/// `begin` creates a gateway order and registers its id as the payment
/// intent. The shopper completes payment on the gateway's page; the
/// completion callback confirms through [`HostedGateway::pending`].
#[derive(Clone)]
pub struct HostedGateway {
    inner: Arc<HostedGatewayInner>,
}

struct HostedGatewayInner {
    client: reqwest::Client,
    endpoint: Url,
    key_id: String,
    key_secret: secrecy::SecretString,
    pending: Arc<PendingPayments>,
}

impl HostedGateway {
    /// Create a client for `config`, delivering confirmations via `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidUrl`] if the order endpoint cannot be
    /// derived from the base URL, or [`GatewayError::Http`] if the HTTP
    /// client cannot be built.
    pub fn new(
        config: &GatewayConfig,
        pending: Arc<PendingPayments>,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Self::with_client(config, pending, client)
    }

    /// Like [`HostedGateway::new`], with a caller-configured HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidUrl`] if the order endpoint cannot be
    /// derived from the base URL.
    pub fn with_client(
        config: &GatewayConfig,
        pending: Arc<PendingPayments>,
        client: reqwest::Client,
    ) -> Result<Self, GatewayError> {
        let endpoint = order_endpoint(&config.base_url)?;

        Ok(Self {
            inner: Arc::new(HostedGatewayInner {
                client,
                endpoint,
                key_id: config.key_id.clone(),
                key_secret: config.key_secret.clone(),
                pending,
            }),
        })
    }

    /// The registry confirmations are delivered through.
    #[must_use]
    pub fn pending(&self) -> &Arc<PendingPayments> {
        &self.inner.pending
    }
}

fn order_endpoint(base_url: &Url) -> Result<Url, GatewayError> {
    if base_url.cannot_be_a_base() {
        return Err(GatewayError::InvalidUrl(base_url.to_string()));
    }
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("v1/orders")
        .map_err(|e| GatewayError::InvalidUrl(e.to_string()))
}

impl PaymentGateway for HostedGateway {
    #[instrument(skip(self, request), fields(amount = request.amount_minor, currency = %request.currency))]
    async fn begin(&self, request: &PaymentRequest) -> Result<PaymentHandoff, GatewayError> {
        let response = self
            .inner
            .client
            .post(self.inner.endpoint.clone())
            .basic_auth(&self.inner.key_id, Some(self.inner.key_secret.expose_secret()))
            .json(&CreateOrderBody::from(request))
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(GatewayError::RateLimited(retry_after));
        }

        let response_text = response.text().await?;

        if !status.is_success() {
            tracing::error!(
                status = %status,
                body = %response_text.chars().take(500).collect::<String>(),
                "Payment gateway returned non-success status"
            );
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: response_text.chars().take(200).collect(),
            });
        }

        let order: CreatedOrder = serde_json::from_str(&response_text).map_err(|e| {
            tracing::error!(error = %e, "Failed to parse gateway order response");
            GatewayError::Parse(e)
        })?;

        tracing::info!(intent_id = %order.id, "Gateway order created");
        Ok(self.inner.pending.register(order.id))
    }
}
