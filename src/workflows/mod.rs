//! Concrete workflows built on the saga engine

mod account_steps;
mod batch;
mod catalog;
mod create_account;
mod custodian_transfer;
mod transfer;

pub use account_steps::{MovementStep, OpenAccountStep};
pub use batch::{BatchInput, BatchProcessingWorkflow, Posting};
pub use catalog::{RecoveryReport, WorkflowCatalog};
pub use create_account::{CreateAccountInput, CreateAccountWorkflow};
pub use custodian_transfer::{CustodianTransferInput, CustodianTransferWorkflow};
pub use transfer::{TransferInput, TransferWorkflow};
