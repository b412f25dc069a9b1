//! Cart and order persistence.
//!
//! # Stores
//!
//! - [`CartStore`] - Durable per-user cart record with point reads, point
//!   writes, conditional writes and change subscriptions
//! - [`OrderStore`] - Append-only order records
//!
//! Two implementations of each are provided: in-process ([`memory`]) and
//! `PostgreSQL` ([`carts`], [`orders`]).
//!
//! # Database: `coursecart`
//!
//! ## Tables
//!
//! - `storefront.cart` - One JSONB item list per user, with a version counter
//! - `storefront.order_record` - One row per fulfilled line item
//!
//! # Migrations
//!
//! Migrations are stored in `crates/storefront/migrations/` and run via:
//! ```bash
//! cargo run -p coursecart-cli -- migrate
//! ```

pub mod carts;
pub mod memory;
pub mod orders;

use std::future::Future;
use std::time::Duration;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use coursecart_core::{OrderId, UserId};

use crate::models::{ItemList, OrderRecord};

pub use carts::PgCartStore;
pub use memory::{MemoryCartStore, MemoryOrderStore};
pub use orders::PgOrderStore;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// A value cannot be represented in the database.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation or lost conditional write.
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// The store refused the operation (used by in-process stores).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Monotonic version of a cart record; `Version::ABSENT` before the first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(i64);

impl Version {
    /// The version of a cart that has never been written.
    pub const ABSENT: Self = Self(0);

    /// Wrap a raw version number.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw version number.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The version following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// A value read together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// A live view of one user's cart record.
///
/// Delivers the current item list first, then every later value. Deliveries
/// are full snapshots with last-write-wins semantics: a slow consumer sees the
/// latest value, not every intermediate one. Dropping the subscription
/// unsubscribes.
#[derive(Debug)]
pub struct CartSubscription {
    rx: watch::Receiver<ItemList>,
    task: Option<JoinHandle<()>>,
}

impl CartSubscription {
    /// Wrap a receiver fed directly by the store.
    #[must_use]
    pub fn new(mut rx: watch::Receiver<ItemList>) -> Self {
        rx.mark_changed();
        Self { rx, task: None }
    }

    /// Wrap a receiver fed by a background task owned by this subscription.
    #[must_use]
    pub fn with_task(mut rx: watch::Receiver<ItemList>, task: JoinHandle<()>) -> Self {
        rx.mark_changed();
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Wait for the next snapshot. Returns `None` once the store side closes.
    pub async fn next(&mut self) -> Option<ItemList> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// The most recent snapshot without waiting.
    #[must_use]
    pub fn latest(&self) -> ItemList {
        self.rx.borrow().clone()
    }
}

impl Drop for CartSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Durable per-user cart record.
pub trait CartStore: Send + Sync + 'static {
    /// Read the user's cart; an absent record reads as an empty list.
    fn read(
        &self,
        uid: &UserId,
    ) -> impl Future<Output = Result<Versioned<ItemList>, RepositoryError>> + Send;

    /// Unconditionally replace the user's cart (last write wins).
    fn write(
        &self,
        uid: &UserId,
        items: &ItemList,
    ) -> impl Future<Output = Result<Version, RepositoryError>> + Send;

    /// Replace the user's cart only if it is still at `expected`.
    ///
    /// Fails with [`RepositoryError::Conflict`] if another writer got there
    /// first.
    fn write_if(
        &self,
        uid: &UserId,
        items: &ItemList,
        expected: Version,
    ) -> impl Future<Output = Result<Version, RepositoryError>> + Send;

    /// Open a subscription to the user's cart.
    fn subscribe(
        &self,
        uid: &UserId,
    ) -> impl Future<Output = Result<CartSubscription, RepositoryError>> + Send;
}

/// Append-only store of confirmed orders.
pub trait OrderStore: Send + Sync + 'static {
    /// Persist one record, carrying its own order id, in a single write.
    fn create(
        &self,
        record: &OrderRecord,
    ) -> impl Future<Output = Result<OrderId, RepositoryError>> + Send;

    /// All orders of a user, oldest first.
    fn list_for_user(
        &self,
        uid: &UserId,
    ) -> impl Future<Output = Result<Vec<OrderRecord>, RepositoryError>> + Send;
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}

/// Run the storefront migrations against `pool`.
///
/// # Errors
///
/// Returns the migrator error if any migration fails to apply.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
