//! finance_core Library
//!
//! Event-sourced ledger core: hash-chained event log, account and transfer
//! aggregates, a saga engine with compensation, and balance projections.

pub mod aggregate;
pub mod api;
pub mod config;
pub mod connectors;
pub mod db;
pub mod domain;
mod error;
pub mod event_store;
pub mod handlers;
pub mod jobs;
pub mod projection;
pub mod retry;
pub mod workflow;
pub mod workflows;

pub use config::Config;
pub use error::{AppError, AppResult, ErrorResponse};
pub use domain::{AccountEvent, AssetCode, DomainError, Money, OperationContext, TransferEvent};
