//! Cart line items and the item list stored per user.
//!
//! The remote cart record is a JSON array of line items. Display attributes
//! are opaque to the engine, and any extra fields written by other clients are
//! carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use coursecart_core::{ItemId, Price, PriceError};

const fn default_quantity() -> u32 {
    1
}

/// One product or exam in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLineItem {
    /// Catalog identifier, unique within a cart.
    pub id: ItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub category: String,
    /// Unit price; zero marks a free item.
    pub price: Price,
    /// Always at least 1 once the item is in a cart.
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    /// Attributes the engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CartLineItem {
    /// Create a line item with quantity 1 and no display attributes.
    #[must_use]
    pub fn new(id: impl Into<ItemId>, price: Price) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            image_url: String::new(),
            category: String::new(),
            price,
            quantity: 1,
            extra: Map::new(),
        }
    }

    /// Builder-style title setter.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Builder-style category setter.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Builder-style quantity setter.
    #[must_use]
    pub const fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Whether the unit price is zero.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.price.is_free()
    }

    /// `price × quantity`.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Overflow`] if the line total does not fit.
    pub fn line_total(&self) -> Result<Price, PriceError> {
        self.price.times(self.quantity)
    }
}

/// The ordered list of line items making up a cart.
///
/// Holds at most one line per [`ItemId`] and never a line with quantity 0.
/// Deserializing restores those invariants, since other writers of the
/// remote record are not trusted to keep them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<CartLineItem>", into = "Vec<CartLineItem>")]
pub struct ItemList(Vec<CartLineItem>);

impl ItemList {
    /// An empty cart.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a list from arbitrary lines, restoring the list invariants.
    ///
    /// Duplicate ids are merged into the first occurrence (quantities summed)
    /// and zero-quantity lines are dropped. Insertion order is preserved.
    #[must_use]
    pub fn from_lines(lines: impl IntoIterator<Item = CartLineItem>) -> Self {
        let mut list = Self::new();
        for line in lines {
            if line.quantity == 0 {
                continue;
            }
            match list.0.iter_mut().find(|existing| existing.id == line.id) {
                Some(existing) => {
                    existing.quantity = existing.quantity.saturating_add(line.quantity);
                }
                None => list.0.push(line),
            }
        }
        list
    }

    /// Add one unit of `item`.
    ///
    /// An existing line with the same id has its quantity incremented;
    /// otherwise the item is appended with quantity 1. Returns the resulting
    /// quantity of that line.
    pub fn add_one(&mut self, item: CartLineItem) -> u32 {
        if let Some(existing) = self.0.iter_mut().find(|line| line.id == item.id) {
            existing.quantity = existing.quantity.saturating_add(1);
            return existing.quantity;
        }
        self.0.push(CartLineItem {
            quantity: 1,
            ..item
        });
        1
    }

    /// Remove every line with `id`. Returns whether anything was removed.
    pub fn remove(&mut self, id: &ItemId) -> bool {
        let before = self.0.len();
        self.0.retain(|line| &line.id != id);
        self.0.len() != before
    }

    /// Set the quantity of the line with `id`; a quantity of 0 removes it.
    ///
    /// Returns whether a line with that id existed.
    pub fn set_quantity(&mut self, id: &ItemId, quantity: u32) -> bool {
        if quantity == 0 {
            return self.remove(id);
        }
        match self.0.iter_mut().find(|line| &line.id == id) {
            Some(line) => {
                line.quantity = quantity;
                true
            }
            None => false,
        }
    }

    /// The line with `id`, if present.
    #[must_use]
    pub fn get(&self, id: &ItemId) -> Option<&CartLineItem> {
        self.0.iter().find(|line| &line.id == id)
    }

    /// Iterate over the lines in display order.
    pub fn iter(&self) -> std::slice::Iter<'_, CartLineItem> {
        self.0.iter()
    }

    /// Number of distinct lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the cart has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all line quantities (the cart badge count).
    #[must_use]
    pub fn total_quantity(&self) -> u64 {
        self.0.iter().map(|line| u64::from(line.quantity)).sum()
    }

    /// Borrow the lines as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[CartLineItem] {
        &self.0
    }

    /// Consume the list and return its lines.
    #[must_use]
    pub fn into_inner(self) -> Vec<CartLineItem> {
        self.0
    }
}

impl From<Vec<CartLineItem>> for ItemList {
    fn from(lines: Vec<CartLineItem>) -> Self {
        Self::from_lines(lines)
    }
}

impl From<ItemList> for Vec<CartLineItem> {
    fn from(list: ItemList) -> Self {
        list.0
    }
}

impl FromIterator<CartLineItem> for ItemList {
    fn from_iter<T: IntoIterator<Item = CartLineItem>>(iter: T) -> Self {
        Self::from_lines(iter)
    }
}

impl<'a> IntoIterator for &'a ItemList {
    type Item = &'a CartLineItem;
    type IntoIter = std::slice::Iter<'a, CartLineItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
