//! Order records written by checkout.
//!
//! One record per fulfilled line item. Records are append-only and carry a
//! caller-generated [`OrderId`], so each is persisted in a single write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use coursecart_core::{Email, Identity, ItemId, OrderId, PaymentId, Price, UserId};

use super::cart::CartLineItem;

/// How an order was paid for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentRef {
    /// Zero-priced item, no payment taken.
    Free,
    /// Paid through the gateway with this transaction id.
    Gateway(PaymentId),
}

impl PaymentRef {
    /// Marker stored in place of a payment id for free items.
    pub const FREE_MARKER: &'static str = "FREE";

    /// The stored representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Free => Self::FREE_MARKER,
            Self::Gateway(id) => id.as_str(),
        }
    }

    /// Parse the stored representation.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == Self::FREE_MARKER {
            Self::Free
        } else {
            Self::Gateway(PaymentId::new(raw))
        }
    }
}

impl Serialize for PaymentRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// A durable order for one line item of a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub item_id: ItemId,
    pub quantity: u32,
    /// Unit price at the time of checkout.
    pub price: Price,
    pub payment_id: PaymentRef,
    pub user_id: UserId,
    pub email: Email,
    #[serde(rename = "date")]
    pub placed_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Build the record for `line`, bought by `buyer`, with a fresh order id.
    #[must_use]
    pub fn for_line(
        buyer: &Identity,
        line: &CartLineItem,
        payment: PaymentRef,
        placed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: OrderId::generate(),
            item_id: line.id.clone(),
            quantity: line.quantity,
            price: line.price,
            payment_id: payment,
            user_id: buyer.uid.clone(),
            email: buyer.email.clone(),
            placed_at,
        }
    }

    /// Whether no payment was taken for this record.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.payment_id, PaymentRef::Free)
    }

    /// Short date for order history listings, e.g. `10/19/2026`.
    #[must_use]
    pub fn date_label(&self) -> String {
        self.placed_at.format("%-m/%-d/%Y").to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use serde_json::Value;

    use super::*;

    fn buyer() -> Identity {
        Identity::new(UserId::new("uid-7"), Email::parse("buyer@example.com").unwrap())
    }

    #[test]
    fn test_record_copies_line_and_identity() {
        let line = CartLineItem::new("exam-1", Price::new(300)).with_quantity(2);
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let record = OrderRecord::for_line(&buyer(), &line, PaymentRef::Free, at);

        assert_eq!(record.item_id, ItemId::new("exam-1"));
        assert_eq!(record.quantity, 2);
        assert_eq!(record.price, Price::new(300));
        assert_eq!(record.user_id, UserId::new("uid-7"));
        assert!(record.is_free());
        assert_eq!(record.date_label(), "10/19/2026");
    }

    #[test]
    fn test_wire_shape() {
        let line = CartLineItem::new("exam-1", Price::new(0));
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let record = OrderRecord::for_line(&buyer(), &line, PaymentRef::Free, at);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["paymentId"], Value::from("FREE"));
        assert_eq!(json["itemId"], Value::from("exam-1"));
        assert_eq!(json["orderId"], Value::from(record.order_id.as_str()));
        assert!(json.get("date").is_some());

        let back: OrderRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_payment_ref_parse() {
        assert_eq!(PaymentRef::parse("FREE"), PaymentRef::Free);
        assert_eq!(
            PaymentRef::parse("pay_123"),
            PaymentRef::Gateway(PaymentId::new("pay_123"))
        );
    }
}
