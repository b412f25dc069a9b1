//! Transient checkout batch: the cart snapshot split by price.

use coursecart_core::{Price, PriceError};

use super::cart::{CartLineItem, ItemList};

/// A cart snapshot partitioned into free and paid lines.
///
/// Exists only for the duration of one checkout attempt. Relative order of
/// lines within each partition follows the cart.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckoutBatch {
    pub free_items: Vec<CartLineItem>,
    pub paid_items: Vec<CartLineItem>,
}

impl CheckoutBatch {
    /// Partition a cart snapshot.
    #[must_use]
    pub fn from_items(items: &ItemList) -> Self {
        let (free_items, paid_items): (Vec<_>, Vec<_>) =
            items.iter().cloned().partition(CartLineItem::is_free);
        Self {
            free_items,
            paid_items,
        }
    }

    /// Whether the snapshot had no lines at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free_items.is_empty() && self.paid_items.is_empty()
    }

    /// Whether a payment handoff is needed.
    #[must_use]
    pub fn requires_payment(&self) -> bool {
        !self.paid_items.is_empty()
    }

    /// `Σ price × quantity` over the paid lines, in major units.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Overflow`] if the total does not fit.
    pub fn paid_total(&self) -> Result<Price, PriceError> {
        self.paid_items
            .iter()
            .try_fold(Price::FREE, |total, line| total.checked_add(line.line_total()?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_and_total() {
        let items = ItemList::from_lines([
            CartLineItem::new("free-1", Price::new(0)),
            CartLineItem::new("paid-1", Price::new(100)).with_quantity(2),
            CartLineItem::new("free-2", Price::new(0)).with_quantity(2),
            CartLineItem::new("paid-2", Price::new(50)),
        ]);
        let batch = CheckoutBatch::from_items(&items);

        let free: Vec<_> = batch.free_items.iter().map(|l| l.id.as_str()).collect();
        let paid: Vec<_> = batch.paid_items.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(free, ["free-1", "free-2"]);
        assert_eq!(paid, ["paid-1", "paid-2"]);
        assert!(batch.requires_payment());
        assert_eq!(batch.paid_total().unwrap(), Price::new(250));
    }

    #[test]
    fn test_empty_and_free_only() {
        assert!(CheckoutBatch::from_items(&ItemList::new()).is_empty());

        let items = ItemList::from_lines([CartLineItem::new("f", Price::new(0))]);
        let batch = CheckoutBatch::from_items(&items);
        assert!(!batch.is_empty());
        assert!(!batch.requires_payment());
        assert_eq!(batch.paid_total().unwrap(), Price::FREE);
    }

    #[test]
    fn test_total_overflow_is_reported() {
        let items = ItemList::from_lines([
            CartLineItem::new("a", Price::new(u64::MAX)),
            CartLineItem::new("b", Price::new(1)),
        ]);
        let batch = CheckoutBatch::from_items(&items);
        assert_eq!(batch.paid_total(), Err(PriceError::Overflow));
    }
}
