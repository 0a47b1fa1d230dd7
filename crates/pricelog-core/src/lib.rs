//! Core domain model for the price history import pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "pricelog-core";

pub const DISCOUNT_SCALE: u32 = 2;

const HUNDRED: Decimal = dec!(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceTag {
    Best,
    Good,
    #[default]
    None,
}

impl PriceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceTag::Best => "best",
            PriceTag::Good => "good",
            PriceTag::None => "none",
        }
    }
}

impl fmt::Display for PriceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown price tag `{0}`")]
pub struct UnknownTag(pub String);

impl FromStr for PriceTag {
    type Err = UnknownTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(PriceTag::Best),
            "good" => Ok(PriceTag::Good),
            "none" | "" => Ok(PriceTag::None),
            other => Err(UnknownTag(other.to_string())),
        }
    }
}

/// A single observation of list price and discount percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: i64,
    pub discount: Decimal,
}

impl PricePoint {
    pub fn new(price: i64, discount: Decimal) -> Self {
        Self { price, discount }
    }

    /// `price * (100 - discount) / 100`, exact in decimal arithmetic.
    pub fn effective_price(&self) -> Decimal {
        Decimal::from(self.price) * (HUNDRED - self.discount) / HUNDRED
    }

    pub fn is_degenerate(&self) -> bool {
        self.price <= 0
    }

    pub fn is_discounted(&self) -> bool {
        !self.discount.is_zero()
    }
}

/// Validates a parsed discount and rounds it to [`DISCOUNT_SCALE`] digits.
pub fn normalize_discount(raw: Decimal) -> Option<Decimal> {
    if raw.is_sign_negative() && !raw.is_zero() {
        return None;
    }
    if raw > HUNDRED {
        return None;
    }
    Some(raw.round_dp(DISCOUNT_SCALE).normalize())
}

/// One parsed feed line held in the run's staging arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRow {
    /// 1-based ordinal of the data line in the feed; orders duplicates of a SKU.
    pub line_no: u64,
    pub sku: String,
    pub name: String,
    pub url: String,
    pub image: String,
    pub description: String,
    pub price: i64,
    pub discount: Decimal,
    pub category: String,
    pub feed_date: NaiveDate,
}

impl StagingRow {
    pub fn price_point(&self) -> PricePoint {
        PricePoint::new(self.price, self.discount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: String,
    pub url: String,
    pub image: String,
    pub description: String,
    pub category: String,
    pub tag: PriceTag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub url: String,
    pub image: String,
    pub description: String,
    pub category: String,
}

impl From<&StagingRow> for NewProduct {
    fn from(row: &StagingRow) -> Self {
        Self {
            sku: row.sku.clone(),
            name: row.name.clone(),
            url: row.url.clone(),
            image: row.image.clone(),
            description: row.description.clone(),
            category: row.category.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistory {
    pub id: i64,
    pub product_id: i64,
    pub price: i64,
    pub discount: Decimal,
    pub record_date: NaiveDate,
}

impl PriceHistory {
    pub fn price_point(&self) -> PricePoint {
        PricePoint::new(self.price, self.discount)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPriceHistory {
    pub product_id: i64,
    pub price: i64,
    pub discount: Decimal,
    pub record_date: NaiveDate,
}
