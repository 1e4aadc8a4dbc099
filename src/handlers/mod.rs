//! Command Handlers module
//!
//! Application services that orchestrate business operations.
//! Each one coordinates aggregates, the event log and workflows.

mod account_handler;
mod commands;
mod transfer_handler;

pub use account_handler::AccountService;
pub use commands::*;
pub use transfer_handler::TransferService;
