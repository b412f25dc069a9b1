//! Whole-unit catalog prices and gateway currency scaling.
//!
//! Catalog records store a price either as a JSON integer or as a numeric
//! string. Both are accepted as long as they denote a non-negative whole
//! amount in the currency's major unit; `0` marks a free item.

use core::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// Errors produced while parsing or combining prices.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PriceError {
    /// The value is not a number.
    #[error("price is not numeric: {0:?}")]
    NotNumeric(String),
    /// The value is below zero.
    #[error("price cannot be negative: {0}")]
    Negative(String),
    /// The value has a fractional part.
    #[error("price must be a whole amount: {0}")]
    Fractional(String),
    /// Arithmetic on prices exceeded the representable range.
    #[error("price arithmetic overflowed")]
    Overflow,
}

/// A non-negative whole price in the currency's major unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "RawPrice", into = "u64")]
pub struct Price(u64);

impl Price {
    /// The price of a free item.
    pub const FREE: Self = Self(0);

    /// Create a price from a whole amount.
    #[must_use]
    pub const fn new(amount: u64) -> Self {
        Self(amount)
    }

    /// The whole amount in major units.
    #[must_use]
    pub const fn amount(self) -> u64 {
        self.0
    }

    /// Whether this is a zero-priced item.
    #[must_use]
    pub const fn is_free(self) -> bool {
        self.0 == 0
    }

    /// Price of `quantity` units.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Overflow`] if the product does not fit.
    pub fn times(self, quantity: u32) -> Result<Self, PriceError> {
        self.0
            .checked_mul(u64::from(quantity))
            .map(Self)
            .ok_or(PriceError::Overflow)
    }

    /// Sum of two prices.
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Overflow`] if the sum does not fit.
    pub fn checked_add(self, other: Self) -> Result<Self, PriceError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(PriceError::Overflow)
    }

    /// Scale to the smallest unit of `currency` (e.g. paise for INR).
    ///
    /// # Errors
    ///
    /// Returns [`PriceError::Overflow`] if the scaled amount does not fit.
    pub fn to_minor_units(self, currency: CurrencyCode) -> Result<u64, PriceError> {
        self.0
            .checked_mul(currency.minor_units_per_major())
            .ok_or(PriceError::Overflow)
    }

    fn from_decimal(value: Decimal, original: &str) -> Result<Self, PriceError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(PriceError::Negative(original.to_owned()));
        }
        if !value.fract().is_zero() {
            return Err(PriceError::Fractional(original.to_owned()));
        }
        value
            .trunc()
            .to_u64()
            .map(Self)
            .ok_or(PriceError::Overflow)
    }
}

impl FromStr for Price {
    type Err = PriceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let value = Decimal::from_str(trimmed)
            .map_err(|_| PriceError::NotNumeric(trimmed.to_owned()))?;
        Self::from_decimal(value, trimmed)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Price> for u64 {
    fn from(price: Price) -> Self {
        price.0
    }
}

/// Wire representations a stored price may take.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawPrice {
    Whole(u64),
    Signed(i64),
    Float(f64),
    Text(String),
}

impl TryFrom<RawPrice> for Price {
    type Error = PriceError;

    fn try_from(raw: RawPrice) -> Result<Self, Self::Error> {
        match raw {
            RawPrice::Whole(amount) => Ok(Self(amount)),
            RawPrice::Signed(amount) => Err(PriceError::Negative(amount.to_string())),
            RawPrice::Float(amount) => {
                let value = Decimal::try_from(amount)
                    .map_err(|_| PriceError::NotNumeric(amount.to_string()))?;
                Self::from_decimal(value, &amount.to_string())
            }
            RawPrice::Text(text) => text.parse(),
        }
    }
}

/// ISO 4217 currency codes accepted by the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    INR,
    USD,
    EUR,
    GBP,
    JPY,
}

impl CurrencyCode {
    /// Number of decimal places in the currency's smallest unit.
    #[must_use]
    pub const fn minor_unit_exponent(self) -> u32 {
        match self {
            Self::INR | Self::USD | Self::EUR | Self::GBP => 2,
            Self::JPY => 0,
        }
    }

    /// How many smallest units make up one major unit.
    #[must_use]
    pub const fn minor_units_per_major(self) -> u64 {
        10_u64.pow(self.minor_unit_exponent())
    }

    /// The three-letter code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::INR => "INR",
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::JPY => "JPY",
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INR" => Ok(Self::INR),
            "USD" => Ok(Self::USD),
            "EUR" => Ok(Self::EUR),
            "GBP" => Ok(Self::GBP),
            "JPY" => Ok(Self::JPY),
            other => Err(format!("unsupported currency code: {other}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_strings() {
        assert_eq!("250".parse::<Price>().unwrap(), Price::new(250));
        assert_eq!(" 499.00 ".parse::<Price>().unwrap(), Price::new(499));
        assert_eq!("0".parse::<Price>().unwrap(), Price::FREE);
        assert!(matches!("-1".parse::<Price>(), Err(PriceError::Negative(_))));
        assert!(matches!("9.99".parse::<Price>(), Err(PriceError::Fractional(_))));
        assert!(matches!("free".parse::<Price>(), Err(PriceError::NotNumeric(_))));
    }

    #[test]
    fn test_deserialize_integer_or_string() {
        let from_int: Price = serde_json::from_str("100").unwrap();
        let from_str: Price = serde_json::from_str("\"100\"").unwrap();
        let from_float: Price = serde_json::from_str("100.0").unwrap();
        assert_eq!(from_int, Price::new(100));
        assert_eq!(from_str, Price::new(100));
        assert_eq!(from_float, Price::new(100));

        assert!(serde_json::from_str::<Price>("-5").is_err());
        assert!(serde_json::from_str::<Price>("\"abc\"").is_err());
    }

    #[test]
    fn test_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Price::new(42)).unwrap(), "42");
    }

    #[test]
    fn test_arithmetic_is_checked() {
        assert_eq!(Price::new(100).times(2).unwrap(), Price::new(200));
        assert_eq!(Price::new(u64::MAX).times(2), Err(PriceError::Overflow));
        assert_eq!(
            Price::new(u64::MAX).checked_add(Price::new(1)),
            Err(PriceError::Overflow)
        );
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(Price::new(250).to_minor_units(CurrencyCode::INR).unwrap(), 25_000);
        assert_eq!(Price::new(250).to_minor_units(CurrencyCode::JPY).unwrap(), 250);
        assert_eq!(
            Price::new(u64::MAX).to_minor_units(CurrencyCode::USD),
            Err(PriceError::Overflow)
        );
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("inr".parse::<CurrencyCode>().unwrap(), CurrencyCode::INR);
        assert_eq!(CurrencyCode::default(), CurrencyCode::INR);
        assert!("XYZ".parse::<CurrencyCode>().is_err());
    }
}
