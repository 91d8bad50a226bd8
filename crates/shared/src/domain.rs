use std::{cmp::Ordering, fmt};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id_newtype!(ProductId);
string_id_newtype!(TransactionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Day,
    Week,
    Month,
    Year,
}

impl PeriodUnit {
    fn approximate_days(self) -> u32 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
            Self::Month => 30,
            Self::Year => 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionPeriod {
    pub unit: PeriodUnit,
    pub count: u32,
}

impl SubscriptionPeriod {
    pub fn new(unit: PeriodUnit, count: u32) -> Self {
        Self { unit, count }
    }

    /// Length used for catalog ordering. Months and years are flattened to a
    /// fixed number of days so periods of different units compare.
    pub fn length_in_days(&self) -> u32 {
        self.unit.approximate_days().saturating_mul(self.count)
    }
}

/// Locale the store priced a product in, e.g. `en_US` / `USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceLocale {
    pub locale_identifier: String,
    pub currency_code: String,
}

impl PriceLocale {
    pub fn new(locale_identifier: impl Into<String>, currency_code: impl Into<String>) -> Self {
        Self {
            locale_identifier: locale_identifier.into(),
            currency_code: currency_code.into(),
        }
    }
}

/// A purchasable item as reported by the product-lookup service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: ProductId,
    pub title: String,
    pub price: Decimal,
    pub price_locale: PriceLocale,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_period: Option<SubscriptionPeriod>,
}

impl Product {
    pub fn is_subscription(&self) -> bool {
        self.subscription_period.is_some()
    }

    /// Zero for one-off purchases.
    pub fn period_length_in_days(&self) -> u32 {
        self.subscription_period
            .as_ref()
            .map(SubscriptionPeriod::length_in_days)
            .unwrap_or(0)
    }

    pub fn cmp_by_price(&self, other: &Self) -> Ordering {
        self.price.cmp(&other.price)
    }

    pub fn cmp_by_period(&self, other: &Self) -> Ordering {
        self.period_length_in_days()
            .cmp(&other.period_length_in_days())
            .then_with(|| self.cmp_by_price(other))
    }
}
