//! Integration tests for Coursecart.
//!
//! # Running Tests
//!
//! ```bash
//! # In-memory flows
//! cargo test -p coursecart-integration-tests
//!
//! # Including PostgreSQL-backed stores
//! TEST_DATABASE_URL=postgres://localhost/coursecart_test \
//!     cargo test -p coursecart-integration-tests -- --include-ignored
//! ```
//!
//! # Test Categories
//!
//! - `checkout_flow` - Cart and checkout end to end over in-memory stores
//! - `postgres_stores` - `PostgreSQL` cart and order stores (ignored by default)

use coursecart_core::{Email, Identity, Price, UserId};
use coursecart_storefront::db;
use coursecart_storefront::models::CartLineItem;
use secrecy::SecretString;
use sqlx::PgPool;

/// Identity with a deterministic email derived from `uid`.
///
/// # Panics
///
/// Panics if `uid` produces an invalid email address.
#[must_use]
pub fn identity(uid: &str) -> Identity {
    let email = Email::parse(&format!("{uid}@example.com")).expect("test email is valid");
    Identity::new(UserId::new(uid), email)
}

/// Identity with a random uid, so database tests don't collide.
#[must_use]
pub fn unique_identity() -> Identity {
    identity(&format!("it-{}", uuid::Uuid::new_v4().simple()))
}

/// A line item priced in whole currency units.
#[must_use]
pub fn course(id: &str, price: u64) -> CartLineItem {
    CartLineItem::new(id, Price::new(price)).with_title(format!("Course {id}"))
}

/// Connect to `TEST_DATABASE_URL` and apply migrations.
///
/// # Panics
///
/// Panics if the variable is unset or the database is unreachable.
pub async fn test_pool() -> PgPool {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let pool = db::create_pool(&SecretString::from(url))
        .await
        .expect("Failed to connect to test database");
    db::migrate(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}
