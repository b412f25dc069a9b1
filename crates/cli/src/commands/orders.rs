//! Order history commands.

use coursecart_core::UserId;
use coursecart_storefront::db::{OrderStore, PgOrderStore};
use coursecart_storefront::models::OrderRecord;

use super::{CommandError, connect};

/// List a user's orders, oldest first.
pub async fn list(uid: &str, json: bool) -> Result<(), CommandError> {
    let store = PgOrderStore::new(connect().await?);
    let orders = store.list_for_user(&UserId::new(uid)).await?;

    if json {
        let body = serde_json::to_string_pretty(&orders)?;
        #[allow(clippy::print_stdout)]
        {
            println!("{body}");
        }
        return Ok(());
    }

    #[allow(clippy::print_stdout)]
    {
        println!(
            "{:<34} {:<24} {:>4} {:>10} {:<24} DATE",
            "ORDER", "ITEM", "QTY", "PRICE", "PAYMENT"
        );
        for order in &orders {
            println!("{}", row(order));
        }
        println!("{} order(s)", orders.len());
    }
    Ok(())
}

fn row(order: &OrderRecord) -> String {
    format!(
        "{:<34} {:<24} {:>4} {:>10} {:<24} {}",
        order.order_id.as_str(),
        order.item_id.as_str(),
        order.quantity,
        order.price.amount(),
        order.payment_id.as_str(),
        order.date_label()
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use coursecart_core::{Email, Identity, Price};
    use coursecart_storefront::models::{CartLineItem, PaymentRef};

    use super::*;

    #[test]
    fn test_row_shows_free_marker_and_date() {
        let buyer = Identity::new(UserId::new("uid-1"), Email::parse("a@example.com").unwrap());
        let line = CartLineItem::new("quiz-1", Price::FREE);
        let placed_at = Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap();
        let order = OrderRecord::for_line(&buyer, &line, PaymentRef::Free, placed_at);

        let row = row(&order);
        assert!(row.contains("quiz-1"));
        assert!(row.contains("FREE"));
        assert!(row.ends_with("10/19/2026"));
    }
}
