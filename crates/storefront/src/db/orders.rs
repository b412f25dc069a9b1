//! `PostgreSQL`-backed order store.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use coursecart_core::{Email, ItemId, OrderId, Price, UserId};

use super::{OrderStore, RepositoryError};
use crate::models::{OrderRecord, PaymentRef};

/// Order store over the `storefront.order_record` table.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    /// Create a store using `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Row shape of `storefront.order_record`.
#[derive(sqlx::FromRow)]
struct OrderRow {
    order_id: String,
    item_id: String,
    quantity: i64,
    price: i64,
    payment_id: String,
    user_id: String,
    email: String,
    placed_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = RepositoryError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let email = Email::parse(&row.email).map_err(|e| {
            RepositoryError::DataCorruption(format!("invalid email in database: {e}"))
        })?;
        let quantity = u32::try_from(row.quantity).map_err(|_| {
            RepositoryError::DataCorruption(format!(
                "invalid quantity in database: {}",
                row.quantity
            ))
        })?;
        let price = u64::try_from(row.price).map_err(|_| {
            RepositoryError::DataCorruption(format!("invalid price in database: {}", row.price))
        })?;

        Ok(Self {
            order_id: OrderId::new(row.order_id),
            item_id: ItemId::new(row.item_id),
            quantity,
            price: Price::new(price),
            payment_id: PaymentRef::parse(&row.payment_id),
            user_id: UserId::new(row.user_id),
            email,
            placed_at: row.placed_at,
        })
    }
}

impl OrderStore for PgOrderStore {
    #[instrument(skip(self, record), fields(order_id = %record.order_id, item_id = %record.item_id))]
    async fn create(&self, record: &OrderRecord) -> Result<OrderId, RepositoryError> {
        let price = i64::try_from(record.price.amount())
            .map_err(|_| RepositoryError::OutOfRange(format!("price {}", record.price)))?;

        sqlx::query(
            r"
            INSERT INTO storefront.order_record
                (order_id, item_id, quantity, price, payment_id, user_id, email, placed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&record.order_id)
        .bind(&record.item_id)
        .bind(i64::from(record.quantity))
        .bind(price)
        .bind(record.payment_id.as_str())
        .bind(&record.user_id)
        .bind(record.email.as_str())
        .bind(record.placed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return RepositoryError::Conflict(format!(
                    "order {} already exists",
                    record.order_id
                ));
            }
            RepositoryError::Database(e)
        })?;

        Ok(record.order_id.clone())
    }

    #[instrument(skip(self), fields(user_id = %uid))]
    async fn list_for_user(&self, uid: &UserId) -> Result<Vec<OrderRecord>, RepositoryError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r"
            SELECT order_id, item_id, quantity, price, payment_id, user_id, email, placed_at
            FROM storefront.order_record
            WHERE user_id = $1
            ORDER BY placed_at, order_id
            ",
        )
        .bind(uid)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OrderRecord::try_from).collect()
    }
}
