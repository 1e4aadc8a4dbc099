//! Asset registry
//!
//! Precision (number of minor-unit digits) per asset. Only used for
//! display; balances are always integers in minor units.

use std::collections::HashMap;

use crate::domain::{AssetCode, Money, MoneyError};

pub trait AssetRegistry: Send + Sync {
    fn precision_of(&self, code: &AssetCode) -> Option<u8>;

    /// Format in major units, e.g. `"12.50 USD"`. Unknown assets are shown
    /// in minor units.
    fn format(&self, money: &Money) -> Result<String, MoneyError> {
        money.format(self.precision_of(money.asset_code()).unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct StaticAssetRegistry {
    precisions: HashMap<AssetCode, u8>,
}

impl StaticAssetRegistry {
    pub fn empty() -> Self {
        Self {
            precisions: HashMap::new(),
        }
    }

    pub fn with_asset(mut self, code: AssetCode, precision: u8) -> Self {
        self.precisions.insert(code, precision);
        self
    }
}

impl Default for StaticAssetRegistry {
    /// Common fiat currencies plus BTC
    fn default() -> Self {
        [("USD", 2), ("EUR", 2), ("GBP", 2), ("CHF", 2), ("JPY", 0), ("BTC", 8)]
            .into_iter()
            .filter_map(|(code, precision)| Some((AssetCode::new(code).ok()?, precision)))
            .fold(Self::empty(), |registry, (code, precision)| {
                registry.with_asset(code, precision)
            })
    }
}

impl AssetRegistry for StaticAssetRegistry {
    fn precision_of(&self, code: &AssetCode) -> Option<u8> {
        self.precisions.get(code).copied()
    }
}
