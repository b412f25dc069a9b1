//! Live cart state for the current shopper.
//!
//! [`CartState`] mirrors the signed-in user's remote cart into a
//! `watch` channel of [`CartSnapshot`]s that UI code observes. Mutations are
//! read-modify-write cycles against the remote record: the new list is applied
//! locally first (optimistic) and then written through. The remote store's
//! subscription echoes every write back; echoes identical to the local value
//! are absorbed without waking observers.
//!
//! # Consistency
//!
//! With [`ConsistencyMode::LastWriteWins`] two concurrent writers of the same
//! cart (two tabs, a double click) can lose one update. With
//! [`ConsistencyMode::CompareAndSwap`] the write is conditional on the version
//! read and the loser gets [`CartError::Conflict`]. Neither mode retries.
//!
//! # Identity
//!
//! Every identity change drops the previous subscription, resets the local
//! cart to empty and subscribes to the new user's record. Pushes still in
//! flight for the previous user are discarded.

use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::instrument;

use coursecart_core::{Identity, ItemId, UserId};

use crate::config::ConsistencyMode;
use crate::db::{CartStore, CartSubscription};
use crate::error::{CartError, add_breadcrumb, clear_sentry_user, set_sentry_user};
use crate::lock;
use crate::models::{CartLineItem, ItemList};

use super::identity::IdentityFeed;

/// What observers of a [`CartState`] see.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CartSnapshot {
    /// User whose cart this is; `None` for an unauthenticated session.
    pub owner: Option<UserId>,
    pub items: ItemList,
}

#[derive(Default)]
struct Session {
    identity: Option<Identity>,
    /// Bumped on every identity change so a slow subscribe can tell it was
    /// superseded.
    epoch: u64,
    forwarder: Option<JoinHandle<()>>,
}

/// The current shopper's cart, kept in sync with a [`CartStore`].
pub struct CartState<S: CartStore> {
    store: Arc<S>,
    consistency: ConsistencyMode,
    snapshot: Arc<watch::Sender<CartSnapshot>>,
    session: Mutex<Session>,
    follower: Mutex<Option<JoinHandle<()>>>,
}

impl<S: CartStore> CartState<S> {
    /// Create a signed-out cart backed by `store`.
    #[must_use]
    pub fn new(store: Arc<S>, consistency: ConsistencyMode) -> Self {
        let (snapshot, _rx) = watch::channel(CartSnapshot::default());
        Self {
            store,
            consistency,
            snapshot: Arc::new(snapshot),
            session: Mutex::new(Session::default()),
            follower: Mutex::new(None),
        }
    }

    /// The identity the cart currently belongs to.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.session).identity.clone()
    }

    /// Current line items.
    #[must_use]
    pub fn items(&self) -> ItemList {
        self.snapshot.borrow().items.clone()
    }

    /// Current snapshot, owner included.
    #[must_use]
    pub fn snapshot(&self) -> CartSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Sum of quantities, for a cart badge.
    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.snapshot.borrow().items.total_quantity()
    }

    /// Receiver of every snapshot change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CartSnapshot> {
        self.snapshot.subscribe()
    }

    /// Switch the cart to `identity`.
    ///
    /// Cancels the previous subscription and resets the local cart to empty;
    /// with an identity present, subscribes to that user's remote record,
    /// whose first push replaces the empty cart. Setting the identity already
    /// in place is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CartError::Store`] if the subscription cannot be opened. The
    /// identity stays set with an empty cart; calling again retries.
    #[instrument(skip_all, fields(user_id = identity.as_ref().map(|i| i.uid.as_str())))]
    pub async fn set_user(&self, identity: Option<Identity>) -> Result<(), CartError> {
        let epoch = {
            let mut session = lock(&self.session);
            if session.identity == identity && (identity.is_none() || session.forwarder.is_some()) {
                return Ok(());
            }
            if let Some(forwarder) = session.forwarder.take() {
                forwarder.abort();
            }
            session.identity.clone_from(&identity);
            session.epoch += 1;
            session.epoch
        };

        let reset = CartSnapshot {
            owner: identity.as_ref().map(|i| i.uid.clone()),
            items: ItemList::new(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == reset {
                return false;
            }
            *current = reset;
            true
        });

        let Some(identity) = identity else {
            clear_sentry_user();
            tracing::info!("Signed out, cart reset");
            return Ok(());
        };
        set_sentry_user(&identity.uid, Some(identity.email.as_str()));

        let subscription = self.store.subscribe(&identity.uid).await?;

        let mut session = lock(&self.session);
        if session.epoch != epoch {
            tracing::debug!("Identity changed while subscribing, dropping subscription");
            return Ok(());
        }
        session.forwarder = Some(tokio::spawn(forward(
            subscription,
            identity.uid,
            Arc::clone(&self.snapshot),
        )));
        tracing::info!("Cart subscription opened");

        Ok(())
    }

    /// Follow `feed`, calling [`CartState::set_user`] on every identity
    /// change until the feed closes or the cart is dropped.
    ///
    /// Replaces any feed followed before.
    pub fn follow(self: &Arc<Self>, feed: &IdentityFeed) {
        let rx = feed.subscribe();
        let task = tokio::spawn(follow_identity(Arc::downgrade(self), rx));
        if let Some(previous) = lock(&self.follower).replace(task) {
            previous.abort();
        }
    }

    /// Add one unit of `item`: bumps the quantity of an existing line with
    /// the same id, or appends a new line with quantity 1.
    ///
    /// Returns the line's quantity afterwards.
    ///
    /// # Errors
    ///
    /// [`CartError::NotAuthenticated`] without an identity (nothing is read
    /// or written), otherwise any store failure or a lost conditional write.
    #[instrument(skip(self, item), fields(item_id = %item.id))]
    pub async fn add(&self, item: CartLineItem) -> Result<u32, CartError> {
        self.mutate("add", move |items| items.add_one(item)).await
    }

    /// Remove every line with `id`. Returns whether a line was present.
    ///
    /// # Errors
    ///
    /// Same as [`CartState::add`].
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &ItemId) -> Result<bool, CartError> {
        let id = id.clone();
        self.mutate("remove", move |items| items.remove(&id)).await
    }

    /// Set the quantity of the line with `id`; zero removes it.
    ///
    /// Returns whether a line with `id` was present.
    ///
    /// # Errors
    ///
    /// Same as [`CartState::add`].
    #[instrument(skip(self))]
    pub async fn set_quantity(&self, id: &ItemId, quantity: u32) -> Result<bool, CartError> {
        let id = id.clone();
        self.mutate("set_quantity", move |items| items.set_quantity(&id, quantity))
            .await
    }

    /// Empty the cart. Idempotent.
    ///
    /// # Errors
    ///
    /// Same as [`CartState::add`].
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<(), CartError> {
        self.mutate("clear", |items| *items = ItemList::new()).await
    }

    /// Replace the whole cart, locally and remotely, without reading first.
    ///
    /// Without an identity only the local cart changes; unauthenticated carts
    /// are never persisted.
    ///
    /// # Errors
    ///
    /// Returns the store failure; the local cart is restored.
    #[instrument(skip(self, items), fields(lines = items.len()))]
    pub async fn set_items(&self, items: ItemList) -> Result<(), CartError> {
        let Some(uid) = self.current_uid() else {
            self.snapshot.send_if_modified(|current| {
                if current.owner.is_some() || current.items == items {
                    return false;
                }
                current.items = items;
                true
            });
            return Ok(());
        };

        let previous = self.apply_local(&uid, &items);
        if let Err(e) = self.store.write(&uid, &items).await {
            self.roll_back(&uid, &items, previous);
            return Err(e.into());
        }
        Ok(())
    }

    /// Empty the cart of `uid`, whoever is signed in now.
    ///
    /// Used by checkout to clear the cart of the buyer captured when it
    /// started. The local cart is only touched if it still belongs to `uid`.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    #[instrument(skip(self), fields(user_id = %uid))]
    pub async fn clear_for(&self, uid: &UserId) -> Result<(), CartError> {
        let empty = ItemList::new();
        let previous = self.apply_local(uid, &empty);
        if let Err(e) = self.store.write(uid, &empty).await {
            self.roll_back(uid, &empty, previous);
            return Err(e.into());
        }
        Ok(())
    }

    fn current_uid(&self) -> Option<UserId> {
        lock(&self.session)
            .identity
            .as_ref()
            .map(|identity| identity.uid.clone())
    }

    /// Read-modify-write of the signed-in user's remote cart.
    async fn mutate<R>(
        &self,
        op: &'static str,
        change: impl FnOnce(&mut ItemList) -> R + Send,
    ) -> Result<R, CartError> {
        let uid = self.current_uid().ok_or(CartError::NotAuthenticated)?;
        add_breadcrumb("cart", op, &[("user_id", uid.as_str())]);

        let read = self.store.read(&uid).await?;
        let mut items = read.value;
        let result = change(&mut items);

        let previous = self.apply_local(&uid, &items);
        let written = match self.consistency {
            ConsistencyMode::LastWriteWins => self.store.write(&uid, &items).await,
            ConsistencyMode::CompareAndSwap => {
                self.store.write_if(&uid, &items, read.version).await
            }
        };

        match written {
            Ok(version) => {
                tracing::debug!(op, user_id = %uid, version = version.get(), "Cart written");
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(op, user_id = %uid, error = %e, "Cart write failed");
                self.roll_back(&uid, &items, previous);
                Err(e.into())
            }
        }
    }

    /// Optimistically show `items` if the local cart belongs to `uid`.
    ///
    /// Returns the items replaced, or `None` if the cart belongs to someone
    /// else by now.
    fn apply_local(&self, uid: &UserId, items: &ItemList) -> Option<ItemList> {
        let mut previous = None;
        self.snapshot.send_if_modified(|current| {
            if current.owner.as_ref() != Some(uid) {
                return false;
            }
            previous = Some(current.items.clone());
            if current.items == *items {
                return false;
            }
            current.items = items.clone();
            true
        });
        previous
    }

    /// Undo [`CartState::apply_local`] unless something newer replaced the
    /// optimistic value meanwhile.
    fn roll_back(&self, uid: &UserId, optimistic: &ItemList, previous: Option<ItemList>) {
        let Some(previous) = previous else {
            return;
        };
        self.snapshot.send_if_modified(|current| {
            if current.owner.as_ref() != Some(uid)
                || current.items != *optimistic
                || current.items == previous
            {
                return false;
            }
            current.items = previous;
            true
        });
    }
}

impl<S: CartStore> Drop for CartState<S> {
    fn drop(&mut self) {
        if let Some(forwarder) = lock(&self.session).forwarder.take() {
            forwarder.abort();
        }
        if let Some(follower) = lock(&self.follower).take() {
            follower.abort();
        }
    }
}

/// Apply remote pushes for `uid` while the local cart still belongs to it.
async fn forward(
    mut subscription: CartSubscription,
    uid: UserId,
    snapshot: Arc<watch::Sender<CartSnapshot>>,
) {
    while let Some(items) = subscription.next().await {
        let applied = snapshot.send_if_modified(|current| {
            if current.owner.as_ref() != Some(&uid) || current.items == items {
                return false;
            }
            current.items = items;
            true
        });
        if applied {
            tracing::debug!(user_id = %uid, "Remote cart applied");
        }
    }
    tracing::debug!(user_id = %uid, "Cart subscription closed");
}

async fn follow_identity<S: CartStore>(
    state: Weak<CartState<S>>,
    mut rx: watch::Receiver<Option<Identity>>,
) {
    loop {
        let identity = rx.borrow_and_update().clone();
        let Some(cart) = state.upgrade() else {
            return;
        };
        if let Err(e) = cart.set_user(identity).await {
            tracing::warn!(error = %e, "Failed to switch cart identity");
        }
        drop(cart);

        if rx.changed().await.is_err() {
            return;
        }
    }
}
