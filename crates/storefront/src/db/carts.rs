//! `PostgreSQL`-backed cart store.
//!
//! Each write bumps the row's version and emits `pg_notify('cart_changed', user_id)`
//! inside the same transaction, so subscribers only hear about committed
//! values. Subscriptions run one `PgListener` task each and re-read the row
//! whenever a notification for their user arrives.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use sqlx::types::Json;
use tokio::sync::watch;
use tracing::instrument;

use coursecart_core::UserId;

use super::{CartStore, CartSubscription, RepositoryError, Version, Versioned};
use crate::models::ItemList;

/// Notification channel carrying the user id of each changed cart.
pub const CART_CHANNEL: &str = "cart_changed";

/// Delay before re-reading after the listener connection dropped.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Cart store over the `storefront.cart` table.
#[derive(Clone)]
pub struct PgCartStore {
    pool: PgPool,
}

impl PgCartStore {
    /// Create a store using `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn fetch(pool: &PgPool, uid: &UserId) -> Result<Versioned<ItemList>, RepositoryError> {
    let row: Option<(Json<ItemList>, i64)> = sqlx::query_as(
        r"
        SELECT items, version
        FROM storefront.cart
        WHERE user_id = $1
        ",
    )
    .bind(uid)
    .fetch_optional(pool)
    .await?;

    Ok(row.map_or_else(
        || Versioned {
            value: ItemList::new(),
            version: Version::ABSENT,
        },
        |(Json(items), version)| Versioned {
            value: items,
            version: Version::new(version),
        },
    ))
}

async fn notify(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    uid: &UserId,
) -> Result<(), RepositoryError> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CART_CHANNEL)
        .bind(uid)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Forward committed changes for `uid` into `tx` until every receiver is gone.
async fn listen(pool: PgPool, mut listener: PgListener, uid: UserId, tx: watch::Sender<ItemList>) {
    loop {
        let notification = tokio::select! {
            () = tx.closed() => return,
            received = listener.recv() => received,
        };

        match notification {
            Ok(notification) if notification.payload() != uid.as_str() => continue,
            Ok(_) => {}
            Err(e) => {
                // The listener reconnects on the next recv; anything missed
                // meanwhile is picked up by the re-read below.
                tracing::warn!(user_id = %uid, error = %e, "Cart listener connection lost");
                tokio::time::sleep(LISTENER_RETRY_DELAY).await;
            }
        }

        match fetch(&pool, &uid).await {
            Ok(read) => {
                tx.send_replace(read.value);
            }
            Err(e) => tracing::warn!(user_id = %uid, error = %e, "Failed to re-read cart"),
        }
    }
}

impl CartStore for PgCartStore {
    #[instrument(skip(self), fields(user_id = %uid))]
    async fn read(&self, uid: &UserId) -> Result<Versioned<ItemList>, RepositoryError> {
        fetch(&self.pool, uid).await
    }

    #[instrument(skip(self, items), fields(user_id = %uid, lines = items.len()))]
    async fn write(&self, uid: &UserId, items: &ItemList) -> Result<Version, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let (version,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO storefront.cart (user_id, items, version, updated_at)
            VALUES ($1, $2, 1, now())
            ON CONFLICT (user_id) DO UPDATE
            SET items = EXCLUDED.items,
                version = storefront.cart.version + 1,
                updated_at = now()
            RETURNING version
            ",
        )
        .bind(uid)
        .bind(Json(items))
        .fetch_one(&mut *tx)
        .await?;

        notify(&mut tx, uid).await?;
        tx.commit().await?;

        Ok(Version::new(version))
    }

    #[instrument(skip(self, items), fields(user_id = %uid, expected = expected.get()))]
    async fn write_if(
        &self,
        uid: &UserId,
        items: &ItemList,
        expected: Version,
    ) -> Result<Version, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let written: Option<(i64,)> = if expected == Version::ABSENT {
            sqlx::query_as(
                r"
                INSERT INTO storefront.cart (user_id, items, version, updated_at)
                VALUES ($1, $2, 1, now())
                ON CONFLICT (user_id) DO NOTHING
                RETURNING version
                ",
            )
            .bind(uid)
            .bind(Json(items))
            .fetch_optional(&mut *tx)
            .await?
        } else {
            sqlx::query_as(
                r"
                UPDATE storefront.cart
                SET items = $2, version = version + 1, updated_at = now()
                WHERE user_id = $1 AND version = $3
                RETURNING version
                ",
            )
            .bind(uid)
            .bind(Json(items))
            .bind(expected.get())
            .fetch_optional(&mut *tx)
            .await?
        };

        let Some((version,)) = written else {
            tx.rollback().await?;
            return Err(RepositoryError::Conflict(format!(
                "cart for {uid} changed since version {}",
                expected.get()
            )));
        };

        notify(&mut tx, uid).await?;
        tx.commit().await?;

        Ok(Version::new(version))
    }

    #[instrument(skip(self), fields(user_id = %uid))]
    async fn subscribe(&self, uid: &UserId) -> Result<CartSubscription, RepositoryError> {
        // Listen before reading so no commit between the two is missed.
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CART_CHANNEL).await?;

        let current = fetch(&self.pool, uid).await?;
        let (tx, rx) = watch::channel(current.value);
        let task = tokio::spawn(listen(self.pool.clone(), listener, uid.clone(), tx));

        Ok(CartSubscription::with_task(rx, task))
    }
}
