//! Money type
//!
//! Domain primitive for monetary values held in integer minor units.
//! Values are validated at construction time, so a negative balance or a
//! malformed asset code cannot exist in the system.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of an asset code (ISO 4217 style, e.g. "USD", "EUR", "BTC").
const ASSET_CODE_LEN: usize = 3;

/// Highest precision the display helpers accept.
const MAX_PRECISION: u8 = 28;

/// Validated three character asset code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetCode(String);

impl AssetCode {
    /// Create an asset code.
    ///
    /// # Errors
    /// `MoneyError::InvalidAssetCode` unless the code is exactly three ASCII
    /// uppercase letters or digits.
    pub fn new(code: impl Into<String>) -> Result<Self, MoneyError> {
        let code = code.into();
        let valid = code.len() == ASSET_CODE_LEN
            && code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());

        if !valid {
            return Err(MoneyError::InvalidAssetCode(code));
        }

        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AssetCode {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetCode::new(s)
    }
}

impl TryFrom<String> for AssetCode {
    type Error = MoneyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AssetCode::new(value)
    }
}

impl From<AssetCode> for String {
    fn from(code: AssetCode) -> Self {
        code.0
    }
}

/// Errors that can occur when creating or combining Money values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("Amount must not be negative (got {0})")]
    Negative(i64),

    #[error("Invalid asset code: {0:?}")]
    InvalidAssetCode(String),

    #[error("Asset mismatch: expected {expected}, found {found}")]
    AssetMismatch { expected: AssetCode, found: AssetCode },

    #[error("Amount overflow")]
    Overflow,

    #[error("Precision {0} is not supported")]
    UnsupportedPrecision(u8),
}

#[derive(Deserialize)]
struct RawMoney {
    amount: i64,
    asset_code: AssetCode,
}

/// Money is an amount of minor units (cents, satoshis, ...) of one asset.
///
/// # Invariants
/// - `amount >= 0`
/// - arithmetic only combines values of the same asset
///
/// # Example
/// ```
/// use finance_core::domain::{AssetCode, Money};
///
/// let usd = AssetCode::new("USD").unwrap();
/// let a = Money::new(1_000, usd.clone()).unwrap();
/// let b = Money::new(250, usd).unwrap();
/// assert_eq!(a.checked_sub(&b).unwrap().amount(), 750);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMoney")]
pub struct Money {
    amount: i64,
    asset_code: AssetCode,
}

impl TryFrom<RawMoney> for Money {
    type Error = MoneyError;

    fn try_from(raw: RawMoney) -> Result<Self, Self::Error> {
        Money::new(raw.amount, raw.asset_code)
    }
}

impl Money {
    /// Create a new Money value.
    ///
    /// # Errors
    /// `MoneyError::Negative` if `amount < 0`.
    pub fn new(amount: i64, asset_code: AssetCode) -> Result<Self, MoneyError> {
        if amount < 0 {
            return Err(MoneyError::Negative(amount));
        }

        Ok(Self { amount, asset_code })
    }

    /// Zero of the given asset.
    pub fn zero(asset_code: AssetCode) -> Self {
        Self {
            amount: 0,
            asset_code,
        }
    }

    /// Amount in minor units.
    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn asset_code(&self) -> &AssetCode {
        &self.asset_code
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn is_positive(&self) -> bool {
        self.amount > 0
    }

    /// Check if this value covers `other` (same asset, greater or equal).
    pub fn is_sufficient_for(&self, other: &Money) -> bool {
        self.asset_code == other.asset_code && self.amount >= other.amount
    }

    /// Add two values of the same asset.
    pub fn checked_add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_asset(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Money::new(amount, self.asset_code.clone())
    }

    /// Subtract `other`; fails rather than producing a negative value.
    pub fn checked_sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.ensure_same_asset(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or(MoneyError::Overflow)?;
        Money::new(amount, self.asset_code.clone())
    }

    /// Convert to a decimal in major units using the asset precision.
    pub fn to_decimal(&self, precision: u8) -> Result<Decimal, MoneyError> {
        if precision > MAX_PRECISION {
            return Err(MoneyError::UnsupportedPrecision(precision));
        }
        Ok(Decimal::new(self.amount, u32::from(precision)))
    }

    /// Human readable form, e.g. `"12.50 USD"`.
    pub fn format(&self, precision: u8) -> Result<String, MoneyError> {
        let value = self.to_decimal(precision)?;
        Ok(format!(
            "{:.*} {}",
            usize::from(precision),
            value,
            self.asset_code
        ))
    }

    fn ensure_same_asset(&self, other: &Money) -> Result<(), MoneyError> {
        if self.asset_code != other.asset_code {
            return Err(MoneyError::AssetMismatch {
                expected: self.asset_code.clone(),
                found: other.asset_code.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.asset_code)
    }
}
