//! Cart support commands.
//!
//! Writes go through the same store as the storefront, so open sessions of
//! the user see a cleared cart immediately.

use coursecart_core::UserId;
use coursecart_storefront::db::{CartStore, PgCartStore};
use coursecart_storefront::models::ItemList;

use super::{CommandError, connect};

/// Print a user's cart and its version.
pub async fn show(uid: &str) -> Result<(), CommandError> {
    let store = PgCartStore::new(connect().await?);
    let read = store.read(&UserId::new(uid)).await?;

    let body = serde_json::to_string_pretty(&read.value)?;
    #[allow(clippy::print_stdout)]
    {
        println!("# version {}, {} line(s)", read.version.get(), read.value.len());
        println!("{body}");
    }
    Ok(())
}

/// Empty a user's cart.
pub async fn clear(uid: &str) -> Result<(), CommandError> {
    let store = PgCartStore::new(connect().await?);
    let version = store.write(&UserId::new(uid), &ItemList::new()).await?;

    tracing::info!(user_id = uid, version = version.get(), "Cart cleared");
    Ok(())
}
