//! Checkout reconciliation.
//!
//! A checkout attempt walks
//! `Idle → Validating → FulfillingFree → AwaitingPayment → FulfillingPaid → Completed`,
//! ending in `Failed` on any error. Free lines are always recorded before a
//! payment is started, so a shopper is never charged ahead of their free
//! items. Paid lines are recorded only after the gateway confirms a payment,
//! all under that one payment id.
//!
//! Waiting for payment ends in one of four ways: a confirmation, an
//! abandoned handoff, the optional payment timeout, or [`CheckoutReconciler::cancel`].
//! The last three return the phase to `Idle` and leave the cart as it was.
//! A confirmation that has already been delivered wins over a cancel.
//!
//! Nothing is rolled back on failure and nothing is retried. Orders already
//! recorded stay recorded; a paid-phase failure means the payment was captured
//! with entitlements missing, and is reported to Sentry as fatal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::instrument;

use coursecart_core::{CheckoutPhase, Identity, PaymentId};

use crate::config::CheckoutConfig;
use crate::db::{CartStore, OrderStore};
use crate::error::{CheckoutError, add_breadcrumb, report_interrupted_fulfillment};
use crate::lock;
use crate::models::{CartLineItem, CheckoutBatch, OrderRecord, PaymentRef};

use super::cart::CartState;
use super::payment::{PaymentGateway, PaymentHandoff, PaymentOutcome, PaymentRequest};

/// Result of a successful checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutReceipt {
    /// Every record created, free lines first.
    pub orders: Vec<OrderRecord>,
    /// Gateway payment id, if anything was paid for.
    pub payment_id: Option<PaymentId>,
    /// Amount handed to the gateway in minor units; zero for free checkouts.
    pub amount_minor: u64,
    /// Whether the buyer's cart was emptied afterwards.
    pub cart_cleared: bool,
}

/// Drives checkout attempts for one shopper session.
pub struct CheckoutReconciler<O: OrderStore, G: PaymentGateway> {
    orders: Arc<O>,
    gateway: Arc<G>,
    config: CheckoutConfig,
    phase: watch::Sender<CheckoutPhase>,
    in_flight: AtomicBool,
    awaiting: AtomicBool,
    cancel: Notify,
    captured: Mutex<Option<PaymentId>>,
    recorded: AtomicUsize,
}

/// Releases the in-flight flag when an attempt ends, however it ends.
///
/// An attempt dropped mid-flight (its future cancelled by the caller) leaves
/// the phase at `Idle`, except while paid orders are being recorded: the
/// payment is already captured, so that is reported as fatal and the phase
/// becomes `Failed`.
struct Attempt<'a, O: OrderStore, G: PaymentGateway> {
    reconciler: &'a CheckoutReconciler<O, G>,
}

impl<O: OrderStore, G: PaymentGateway> Drop for Attempt<'_, O, G> {
    fn drop(&mut self) {
        let reconciler = self.reconciler;
        let payment_id = lock(&reconciler.captured).take();
        let phase = reconciler.current_phase();

        if phase == CheckoutPhase::FulfillingPaid {
            report_interrupted_fulfillment(
                payment_id.as_ref(),
                reconciler.recorded.load(Ordering::SeqCst),
            );
            reconciler.set_phase(CheckoutPhase::Failed);
        } else if phase.is_in_flight() {
            reconciler.set_phase(CheckoutPhase::Idle);
        }

        reconciler.awaiting.store(false, Ordering::SeqCst);
        reconciler.in_flight.store(false, Ordering::SeqCst);
    }
}

impl<O: OrderStore, G: PaymentGateway> CheckoutReconciler<O, G> {
    /// Create an idle reconciler.
    #[must_use]
    pub fn new(orders: Arc<O>, gateway: Arc<G>, config: CheckoutConfig) -> Self {
        let (phase, _rx) = watch::channel(CheckoutPhase::Idle);
        Self {
            orders,
            gateway,
            config,
            phase,
            in_flight: AtomicBool::new(false),
            awaiting: AtomicBool::new(false),
            cancel: Notify::new(),
            captured: Mutex::new(None),
            recorded: AtomicUsize::new(0),
        }
    }

    /// Receiver of every phase change.
    #[must_use]
    pub fn phase(&self) -> watch::Receiver<CheckoutPhase> {
        self.phase.subscribe()
    }

    /// The phase right now.
    #[must_use]
    pub fn current_phase(&self) -> CheckoutPhase {
        *self.phase.borrow()
    }

    /// Stop waiting for payment. Returns whether a checkout was still waiting.
    ///
    /// The waiting attempt fails with [`CheckoutError::PaymentCancelled`] and
    /// the phase returns to `Idle`. Has no effect in any other phase. A
    /// confirmation delivered before the attempt observes the cancel still
    /// wins, and the checkout goes on to record the paid orders.
    pub fn cancel(&self) -> bool {
        if !self.awaiting.load(Ordering::SeqCst) {
            return false;
        }
        self.cancel.notify_waiters();
        true
    }

    /// Check out the current contents of `cart`.
    ///
    /// The buyer is the identity signed in when this is called; orders and
    /// the final cart clear target that identity even if it changes while
    /// waiting for payment.
    ///
    /// # Errors
    ///
    /// See [`CheckoutError`]. Failures other than payment interruptions are
    /// reported to Sentry before returning.
    #[instrument(skip_all, fields(user_id = tracing::field::Empty))]
    pub async fn checkout<S: CartStore>(
        &self,
        cart: &CartState<S>,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CheckoutError::CheckoutInProgress);
        }
        let _attempt = Attempt { reconciler: self };
        self.recorded.store(0, Ordering::SeqCst);

        let result = self.run(cart).await;

        match &result {
            Ok(receipt) => {
                tracing::info!(
                    orders = receipt.orders.len(),
                    amount_minor = receipt.amount_minor,
                    "Checkout completed"
                );
            }
            Err(e) if e.is_payment_interrupted() => {
                tracing::info!(reason = %e, "Checkout stopped while awaiting payment");
                self.set_phase(CheckoutPhase::Idle);
            }
            Err(e) => {
                e.report();
                self.set_phase(CheckoutPhase::Failed);
            }
        }

        result
    }

    async fn run<S: CartStore>(
        &self,
        cart: &CartState<S>,
    ) -> Result<CheckoutReceipt, CheckoutError> {
        self.set_phase(CheckoutPhase::Validating);

        let buyer = cart.identity().ok_or(CheckoutError::NotAuthenticated)?;
        tracing::Span::current().record("user_id", buyer.uid.as_str());

        let snapshot = cart.snapshot();
        if snapshot.owner.as_ref() != Some(&buyer.uid) {
            return Err(CheckoutError::NotAuthenticated);
        }
        let batch = CheckoutBatch::from_items(&snapshot.items);
        if batch.is_empty() {
            return Err(CheckoutError::EmptyCart);
        }
        let amount_minor = batch.paid_total()?.to_minor_units(self.config.currency)?;

        let placed_at = Utc::now();
        let mut orders = Vec::with_capacity(batch.free_items.len() + batch.paid_items.len());

        self.set_phase(CheckoutPhase::FulfillingFree);
        self.fulfill(
            &buyer,
            &batch.free_items,
            &PaymentRef::Free,
            placed_at,
            &mut orders,
        )
        .await?;

        let payment_id = if batch.requires_payment() {
            let payment_id = self.collect_payment(&buyer, amount_minor).await?;
            *lock(&self.captured) = Some(payment_id.clone());

            self.set_phase(CheckoutPhase::FulfillingPaid);
            self.fulfill(
                &buyer,
                &batch.paid_items,
                &PaymentRef::Gateway(payment_id.clone()),
                placed_at,
                &mut orders,
            )
            .await?;
            Some(payment_id)
        } else {
            None
        };

        let cart_cleared = match cart.clear_for(&buyer.uid).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Orders recorded but the cart could not be cleared");
                false
            }
        };
        lock(&self.captured).take();
        self.set_phase(CheckoutPhase::Completed);

        Ok(CheckoutReceipt {
            orders,
            payment_id,
            amount_minor,
            cart_cleared,
        })
    }

    /// Hand the paid total to the gateway and wait for the outcome.
    async fn collect_payment(
        &self,
        buyer: &Identity,
        amount_minor: u64,
    ) -> Result<PaymentId, CheckoutError> {
        // Register for cancellation before the phase becomes visible.
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        self.awaiting.store(true, Ordering::SeqCst);
        self.set_phase(CheckoutPhase::AwaitingPayment);

        let request = PaymentRequest {
            amount_minor,
            currency: self.config.currency,
            description: self.config.description.clone(),
            receipt: uuid::Uuid::new_v4().simple().to_string(),
            user_id: buyer.uid.clone(),
        };
        let amount = amount_minor.to_string();
        add_breadcrumb(
            "checkout",
            "payment started",
            &[("amount_minor", amount.as_str()), ("currency", request.currency.code())],
        );

        let handoff = self
            .gateway
            .begin(&request)
            .await
            .inspect_err(|_| self.awaiting.store(false, Ordering::SeqCst))?;
        tracing::info!(intent_id = handoff.intent_id(), "Awaiting payment");

        let result = tokio::select! {
            biased;
            outcome = self.wait_for(handoff) => match outcome {
                Some(PaymentOutcome::Confirmed(payment_id)) => Ok(payment_id),
                Some(PaymentOutcome::Abandoned) => Err(CheckoutError::GatewayAbandoned),
                None => Err(CheckoutError::PaymentTimedOut),
            },
            () = &mut cancelled => Err(CheckoutError::PaymentCancelled),
        };
        self.awaiting.store(false, Ordering::SeqCst);
        result
    }

    /// The handoff's outcome, or `None` once the payment timeout elapses.
    async fn wait_for(&self, handoff: PaymentHandoff) -> Option<PaymentOutcome> {
        match self.config.payment_timeout {
            Some(limit) => tokio::time::timeout(limit, handoff.outcome()).await.ok(),
            None => Some(handoff.outcome().await),
        }
    }

    /// Record one order per line, stopping at the first failure.
    async fn fulfill(
        &self,
        buyer: &Identity,
        lines: &[CartLineItem],
        payment: &PaymentRef,
        placed_at: DateTime<Utc>,
        orders: &mut Vec<OrderRecord>,
    ) -> Result<(), CheckoutError> {
        let phase = self.current_phase();

        for line in lines {
            let record = OrderRecord::for_line(buyer, line, payment.clone(), placed_at);
            if let Err(source) = self.orders.create(&record).await {
                tracing::error!(
                    %phase,
                    item_id = %line.id,
                    recorded = orders.len(),
                    error = %source,
                    "Order creation failed"
                );
                return Err(CheckoutError::OrderCreationFailed {
                    phase,
                    failed_item: line.id.clone(),
                    created: orders.iter().map(|o| o.order_id.clone()).collect(),
                    payment_id: match payment {
                        PaymentRef::Free => None,
                        PaymentRef::Gateway(id) => Some(id.clone()),
                    },
                    source,
                });
            }

            tracing::info!(
                order_id = %record.order_id,
                item_id = %record.item_id,
                "Order recorded"
            );
            orders.push(record);
            self.recorded.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    fn set_phase(&self, next: CheckoutPhase) {
        let previous = self.phase.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Checkout phase");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use coursecart_core::{CurrencyCode, Email, ItemId, OrderId, Price, UserId};

    use super::*;
    use crate::config::ConsistencyMode;
    use crate::db::{MemoryCartStore, MemoryOrderStore, RepositoryError};
    use crate::models::ItemList;
    use crate::services::payment::{GatewayError, InProcessGateway};

    struct Fixture {
        carts: Arc<MemoryCartStore>,
        orders: Arc<MemoryOrderStore>,
        gateway: Arc<InProcessGateway>,
        cart: CartState<MemoryCartStore>,
        reconciler: CheckoutReconciler<MemoryOrderStore, InProcessGateway>,
    }

    fn buyer(uid: &str) -> Identity {
        Identity::new(
            UserId::new(uid),
            Email::parse(&format!("{uid}@example.com")).unwrap(),
        )
    }

    fn line(id: &str, price: u64, quantity: u32) -> CartLineItem {
        CartLineItem::new(id, Price::new(price)).with_quantity(quantity)
    }

    async fn fixture_with(lines: Vec<CartLineItem>, config: CheckoutConfig) -> Fixture {
        let carts = Arc::new(MemoryCartStore::new());
        let orders = Arc::new(MemoryOrderStore::new());
        let gateway = Arc::new(InProcessGateway::new());
        let cart = CartState::new(Arc::clone(&carts), ConsistencyMode::LastWriteWins);
        cart.set_user(Some(buyer("uid-1"))).await.unwrap();
        cart.set_items(ItemList::from_lines(lines)).await.unwrap();
        let reconciler =
            CheckoutReconciler::new(Arc::clone(&orders), Arc::clone(&gateway), config);

        Fixture {
            carts,
            orders,
            gateway,
            cart,
            reconciler,
        }
    }

    /// Records the first `limit` orders, then never completes a create.
    struct StallingOrderStore {
        inner: MemoryOrderStore,
        limit: usize,
    }

    impl OrderStore for StallingOrderStore {
        async fn create(&self, record: &OrderRecord) -> Result<OrderId, RepositoryError> {
            if self.inner.len() >= self.limit {
                std::future::pending::<()>().await;
            }
            self.inner.create(record).await
        }

        async fn list_for_user(&self, uid: &UserId) -> Result<Vec<OrderRecord>, RepositoryError> {
            self.inner.list_for_user(uid).await
        }
    }

    async fn fixture(lines: Vec<CartLineItem>) -> Fixture {
        fixture_with(lines, CheckoutConfig::default()).await
    }

    /// Wait until the checkout is awaiting payment and its intent exists.
    async fn awaiting_intent(f: &Fixture) -> String {
        let mut phase = f.reconciler.phase();
        phase
            .wait_for(|p| *p == CheckoutPhase::AwaitingPayment)
            .await
            .unwrap();
        loop {
            if let Some(intent) = f.gateway.pending().outstanding().into_iter().next() {
                return intent;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_free_only_checkout_skips_gateway() {
        let f = fixture(vec![line("quiz-1", 0, 1), line("quiz-2", 0, 2)]).await;

        let receipt = f.reconciler.checkout(&f.cart).await.unwrap();

        let records = f.orders.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.payment_id.as_str() == "FREE"));
        assert_eq!(receipt.orders, records);
        assert_eq!(receipt.payment_id, None);
        assert_eq!(receipt.amount_minor, 0);
        assert!(receipt.cart_cleared);
        assert!(f.gateway.requests().is_empty());
        assert!(f.cart.items().is_empty());
        assert!(f.carts.snapshot(&UserId::new("uid-1")).is_empty());
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Completed);
    }

    #[tokio::test]
    async fn test_paid_checkout_invokes_gateway_before_recording() {
        let f = fixture(vec![line("exam-1", 100, 2), line("exam-2", 50, 1)]).await;

        let driver = async {
            let intent = awaiting_intent(&f).await;
            assert!(f.orders.is_empty());
            f.gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_123"))
                .unwrap();
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);
        let receipt = result.unwrap();

        let requests = f.gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].amount_minor, 25_000);
        assert_eq!(requests[0].currency, CurrencyCode::INR);
        assert_eq!(requests[0].description, "Course purchase");

        let records = f.orders.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.payment_id.as_str() == "pay_123"));
        assert_eq!(receipt.payment_id, Some(PaymentId::new("pay_123")));
        assert_eq!(receipt.amount_minor, 25_000);
        assert!(f.cart.items().is_empty());
    }

    #[tokio::test]
    async fn test_mixed_checkout_records_free_items_first() {
        let f = fixture(vec![line("exam-1", 200, 1), line("quiz-1", 0, 1)]).await;

        let driver = async {
            let intent = awaiting_intent(&f).await;
            let recorded = f.orders.records();
            assert_eq!(recorded.len(), 1);
            assert_eq!(recorded[0].item_id, ItemId::new("quiz-1"));
            assert!(recorded[0].is_free());
            f.gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_9"))
                .unwrap();
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);
        let receipt = result.unwrap();

        let ids: Vec<&str> = receipt.orders.iter().map(|o| o.item_id.as_str()).collect();
        assert_eq!(ids, ["quiz-1", "exam-1"]);
        assert_eq!(f.gateway.requests()[0].amount_minor, 20_000);
    }

    #[tokio::test]
    async fn test_free_failure_stops_before_payment() {
        let f = fixture(vec![
            line("quiz-1", 0, 1),
            line("quiz-2", 0, 1),
            line("exam-1", 100, 1),
        ])
        .await;
        f.orders.fail_on_create(2);

        let err = f.reconciler.checkout(&f.cart).await.unwrap_err();

        match &err {
            CheckoutError::OrderCreationFailed {
                phase,
                failed_item,
                created,
                payment_id,
                ..
            } => {
                assert_eq!(*phase, CheckoutPhase::FulfillingFree);
                assert_eq!(failed_item, &ItemId::new("quiz-2"));
                assert_eq!(created.len(), 1);
                assert!(payment_id.is_none());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_severe());
        let records = f.orders.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].item_id, ItemId::new("quiz-1"));
        assert!(f.gateway.requests().is_empty());
        assert_eq!(f.cart.items().len(), 3);
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Failed);
    }

    #[tokio::test]
    async fn test_paid_failure_is_severe_and_keeps_payment_id() {
        let f = fixture(vec![line("exam-1", 100, 1), line("exam-2", 100, 1)]).await;
        f.orders.fail_on_create(2);

        let driver = async {
            let intent = awaiting_intent(&f).await;
            f.gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_lost"))
                .unwrap();
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);
        let err = result.unwrap_err();

        assert!(err.is_severe());
        assert!(matches!(
            &err,
            CheckoutError::OrderCreationFailed { payment_id: Some(id), created, .. }
                if id.as_str() == "pay_lost" && created.len() == 1
        ));
        assert!(err.user_message().contains("pay_lost"));
        assert_eq!(f.orders.len(), 1);
        assert_eq!(f.cart.items().len(), 2);
    }

    #[tokio::test]
    async fn test_validation_errors_have_no_side_effects() {
        let f = fixture(Vec::new()).await;
        assert!(matches!(
            f.reconciler.checkout(&f.cart).await,
            Err(CheckoutError::EmptyCart)
        ));

        f.cart.set_user(None).await.unwrap();
        assert!(matches!(
            f.reconciler.checkout(&f.cart).await,
            Err(CheckoutError::NotAuthenticated)
        ));
        assert!(f.orders.is_empty());
        assert!(f.gateway.requests().is_empty());
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Failed);
    }

    #[tokio::test]
    async fn test_abandoned_payment_keeps_cart() {
        let f = fixture(vec![line("quiz-1", 0, 1), line("exam-1", 100, 1)]).await;

        let driver = async {
            let intent = awaiting_intent(&f).await;
            assert!(f.gateway.pending().abandon(&intent));
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);

        assert!(matches!(result, Err(CheckoutError::GatewayAbandoned)));
        // The free line was recorded before the handoff and stays recorded.
        assert_eq!(f.orders.len(), 1);
        assert_eq!(f.cart.items().len(), 2);
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Idle);
    }

    #[tokio::test]
    async fn test_payment_timeout_returns_to_idle() {
        let config = CheckoutConfig {
            payment_timeout: Some(Duration::from_millis(30)),
            ..CheckoutConfig::default()
        };
        let f = fixture_with(vec![line("exam-1", 100, 1)], config).await;

        let result = f.reconciler.checkout(&f.cart).await;

        assert!(matches!(result, Err(CheckoutError::PaymentTimedOut)));
        assert!(f.orders.is_empty());
        assert_eq!(f.cart.items().len(), 1);
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Idle);
        assert!(f.gateway.pending().outstanding().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting_and_refuses_late_confirmation() {
        let f = fixture(vec![line("exam-1", 100, 1)]).await;
        assert!(!f.reconciler.cancel());

        let driver = async {
            let intent = awaiting_intent(&f).await;
            assert!(f.reconciler.cancel());
            intent
        };
        let (result, intent) = tokio::join!(f.reconciler.checkout(&f.cart), driver);

        assert!(matches!(result, Err(CheckoutError::PaymentCancelled)));
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Idle);
        assert!(matches!(
            f.gateway.pending().confirm(&intent, PaymentId::new("pay_late")),
            Err(GatewayError::NotAwaiting(_))
        ));
        assert!(f.orders.is_empty());
    }

    #[tokio::test]
    async fn test_second_checkout_while_waiting_is_rejected() {
        let f = fixture(vec![line("exam-1", 100, 1)]).await;

        let driver = async {
            let intent = awaiting_intent(&f).await;
            assert!(matches!(
                f.reconciler.checkout(&f.cart).await,
                Err(CheckoutError::CheckoutInProgress)
            ));
            assert_eq!(f.reconciler.current_phase(), CheckoutPhase::AwaitingPayment);
            f.gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_1"))
                .unwrap();
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);

        assert!(result.is_ok());
        assert_eq!(f.orders.len(), 1);
    }

    #[tokio::test]
    async fn test_orders_use_identity_captured_at_start() {
        let f = fixture(vec![line("exam-1", 100, 1)]).await;

        let driver = async {
            let intent = awaiting_intent(&f).await;
            f.cart.set_user(Some(buyer("uid-2"))).await.unwrap();
            f.cart.add(line("other", 10, 1)).await.unwrap();
            f.gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_1"))
                .unwrap();
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);
        let receipt = result.unwrap();

        let record = &receipt.orders[0];
        assert_eq!(record.user_id, UserId::new("uid-1"));
        assert_eq!(record.email.as_str(), "uid-1@example.com");
        assert!(f.carts.snapshot(&UserId::new("uid-1")).is_empty());
        assert_eq!(f.carts.snapshot(&UserId::new("uid-2")).len(), 1);
        assert_eq!(f.cart.items().len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_refusal_fails_without_orders() {
        let f = fixture(vec![line("exam-1", 100, 1)]).await;
        f.gateway.refuse_next();

        let result = f.reconciler.checkout(&f.cart).await;

        assert!(matches!(result, Err(CheckoutError::Gateway(_))));
        assert!(f.orders.is_empty());
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Failed);
    }

    #[tokio::test]
    async fn test_failed_clear_is_reported_in_receipt() {
        let f = fixture(vec![line("quiz-1", 0, 1)]).await;
        f.carts.fail_next_writes(1);

        let receipt = f.reconciler.checkout(&f.cart).await.unwrap();

        assert!(!receipt.cart_cleared);
        assert_eq!(receipt.orders.len(), 1);
        assert_eq!(f.cart.items().len(), 1);
    }

    #[tokio::test]
    async fn test_overflowing_total_is_rejected_before_side_effects() {
        let f = fixture(vec![line("quiz-1", 0, 1), line("exam-1", u64::MAX, 2)]).await;

        let result = f.reconciler.checkout(&f.cart).await;

        assert!(matches!(result, Err(CheckoutError::InvalidTotal(_))));
        assert!(f.orders.is_empty());
    }

    #[tokio::test]
    async fn test_repository_error_source_is_preserved() {
        let f = fixture(vec![line("quiz-1", 0, 1)]).await;
        f.orders.fail_on_create(1);

        let err = f.reconciler.checkout(&f.cart).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::OrderCreationFailed {
                source: RepositoryError::Unavailable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delivered_confirmation_wins_over_cancel() {
        let f = fixture(vec![line("exam-1", 100, 1)]).await;

        let driver = async {
            let intent = awaiting_intent(&f).await;
            f.gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_first"))
                .unwrap();
            f.reconciler.cancel();
        };
        let (result, ()) = tokio::join!(f.reconciler.checkout(&f.cart), driver);
        let receipt = result.unwrap();

        assert_eq!(receipt.payment_id, Some(PaymentId::new("pay_first")));
        assert_eq!(f.orders.len(), 1);
        assert_eq!(f.reconciler.current_phase(), CheckoutPhase::Completed);
        assert!(!f.reconciler.cancel());
    }

    #[tokio::test]
    async fn test_dropping_checkout_while_recording_paid_orders_fails() {
        let carts = Arc::new(MemoryCartStore::new());
        let orders = Arc::new(StallingOrderStore {
            inner: MemoryOrderStore::new(),
            limit: 1,
        });
        let gateway = Arc::new(InProcessGateway::new());
        let cart = CartState::new(Arc::clone(&carts), ConsistencyMode::LastWriteWins);
        cart.set_user(Some(buyer("uid-1"))).await.unwrap();
        cart.set_items(ItemList::from_lines(vec![
            line("exam-1", 100, 1),
            line("exam-2", 100, 1),
        ]))
        .await
        .unwrap();
        let reconciler = CheckoutReconciler::new(
            Arc::clone(&orders),
            Arc::clone(&gateway),
            CheckoutConfig::default(),
        );

        let mut phase = reconciler.phase();
        let driver = async {
            phase
                .wait_for(|p| *p == CheckoutPhase::AwaitingPayment)
                .await
                .unwrap();
            let intent = loop {
                if let Some(intent) = gateway.pending().outstanding().into_iter().next() {
                    break intent;
                }
                tokio::task::yield_now().await;
            };
            gateway
                .pending()
                .confirm(&intent, PaymentId::new("pay_x"))
                .unwrap();
            phase
                .wait_for(|p| *p == CheckoutPhase::FulfillingPaid)
                .await
                .unwrap();
        };
        tokio::select! {
            result = reconciler.checkout(&cart) => {
                panic!("checkout finished with a stalled order store: {result:?}");
            }
            () = driver => {}
        }

        assert_eq!(reconciler.current_phase(), CheckoutPhase::Failed);
        let records = orders.inner.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payment_id.as_str(), "pay_x");
        assert_eq!(cart.items().len(), 2);
        assert!(!reconciler.cancel());
    }
}
