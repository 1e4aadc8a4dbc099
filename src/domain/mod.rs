//! Domain module
//!
//! Core domain types and business logic.

pub mod context;
pub mod error;
pub mod events;
pub mod money;

pub use context::OperationContext;
pub use error::DomainError;
pub use events::{AccountEvent, DomainEvent, EventDecodeError, TransferEvent};
pub use money::{AssetCode, Money, MoneyError};
