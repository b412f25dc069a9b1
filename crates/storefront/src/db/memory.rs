//! In-process stores.
//!
//! Used by tests, demos and unauthenticated development setups. Both stores
//! support fault injection so partial-failure paths can be exercised.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

use coursecart_core::{OrderId, UserId};

use super::{CartStore, CartSubscription, OrderStore, RepositoryError, Version, Versioned};
use crate::lock;
use crate::models::{ItemList, OrderRecord};

struct CartSlot {
    version: Version,
    tx: watch::Sender<ItemList>,
}

impl CartSlot {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(ItemList::new());
        Self {
            version: Version::ABSENT,
            tx,
        }
    }
}

/// In-memory [`CartStore`] keyed by user id.
#[derive(Default)]
pub struct MemoryCartStore {
    slots: Mutex<HashMap<UserId, CartSlot>>,
    writes: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl MemoryCartStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far, across all users.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` writes fail with [`RepositoryError::Unavailable`].
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Current contents of a user's cart, bypassing the async interface.
    #[must_use]
    pub fn snapshot(&self, uid: &UserId) -> ItemList {
        lock(&self.slots)
            .get(uid)
            .map(|slot| slot.tx.borrow().clone())
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(
        &self,
        uid: &UserId,
        items: &ItemList,
        expected: Option<Version>,
    ) -> Result<Version, RepositoryError> {
        if self.take_injected_failure() {
            return Err(RepositoryError::Unavailable("injected cart write failure".to_owned()));
        }

        let mut slots = lock(&self.slots);
        let slot = slots.entry(uid.clone()).or_insert_with(CartSlot::new);
        if let Some(expected) = expected
            && slot.version != expected
        {
            return Err(RepositoryError::Conflict(format!(
                "cart for {uid} is at version {}, expected {}",
                slot.version.get(),
                expected.get()
            )));
        }

        slot.version = slot.version.next();
        // Every write is delivered, even when the contents are unchanged.
        slot.tx.send_replace(items.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(slot.version)
    }
}

impl CartStore for MemoryCartStore {
    async fn read(&self, uid: &UserId) -> Result<Versioned<ItemList>, RepositoryError> {
        let slots = lock(&self.slots);
        Ok(slots.get(uid).map_or_else(
            || Versioned {
                value: ItemList::new(),
                version: Version::ABSENT,
            },
            |slot| Versioned {
                value: slot.tx.borrow().clone(),
                version: slot.version,
            },
        ))
    }

    async fn write(&self, uid: &UserId, items: &ItemList) -> Result<Version, RepositoryError> {
        self.store(uid, items, None)
    }

    async fn write_if(
        &self,
        uid: &UserId,
        items: &ItemList,
        expected: Version,
    ) -> Result<Version, RepositoryError> {
        self.store(uid, items, Some(expected))
    }

    async fn subscribe(&self, uid: &UserId) -> Result<CartSubscription, RepositoryError> {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(uid.clone()).or_insert_with(CartSlot::new);
        Ok(CartSubscription::new(slot.tx.subscribe()))
    }
}

/// In-memory append-only [`OrderStore`].
#[derive(Default)]
pub struct MemoryOrderStore {
    records: Mutex<Vec<OrderRecord>>,
    attempts: AtomicUsize,
    fail_on_attempt: Mutex<Option<usize>>,
}

impl MemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th create call (1-based, counted from now) fail.
    pub fn fail_on_create(&self, n: usize) {
        let already = self.attempts.load(Ordering::SeqCst);
        *lock(&self.fail_on_attempt) = Some(already + n);
    }

    /// All records in creation order.
    #[must_use]
    pub fn records(&self) -> Vec<OrderRecord> {
        lock(&self.records).clone()
    }

    /// Number of records stored.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    /// Whether no record has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OrderStore for MemoryOrderStore {
    async fn create(&self, record: &OrderRecord) -> Result<OrderId, RepositoryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *lock(&self.fail_on_attempt) == Some(attempt) {
            return Err(RepositoryError::Unavailable(format!(
                "injected failure on order create #{attempt}"
            )));
        }

        let mut records = lock(&self.records);
        if records.iter().any(|existing| existing.order_id == record.order_id) {
            return Err(RepositoryError::Conflict(format!(
                "order {} already exists",
                record.order_id
            )));
        }
        records.push(record.clone());
        Ok(record.order_id.clone())
    }

    async fn list_for_user(&self, uid: &UserId) -> Result<Vec<OrderRecord>, RepositoryError> {
        Ok(lock(&self.records)
            .iter()
            .filter(|record| &record.user_id == uid)
            .cloned()
            .collect())
    }
}
