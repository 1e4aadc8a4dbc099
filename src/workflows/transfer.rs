//! Transfer workflow
//!
//! Two legs: debit the source, credit the destination. If the credit
//! fails, the debit is reversed by crediting the source again.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Money;
use crate::handlers::{AccountService, MovementCommand};
use crate::workflow::{WorkflowDefinition, WorkflowError};

use super::account_steps::MovementStep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInput {
    pub transfer_id: Uuid,
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub amount: Money,
    pub description: String,
}

pub struct TransferWorkflow;

impl TransferWorkflow {
    pub const TYPE: &'static str = "transfer";

    pub fn definition(
        accounts: &AccountService,
        input: &TransferInput,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        if input.from_account_id == input.to_account_id {
            return Err(WorkflowError::InvalidInput(
                "cannot transfer to the same account".to_string(),
            ));
        }

        let leg = |account_id: Uuid| {
            MovementCommand::of(account_id, &input.amount)
                .with_transfer(input.transfer_id)
                .with_description(input.description.clone())
        };

        Ok(
            WorkflowDefinition::new(Self::TYPE, serde_json::to_value(input)?)
                .step(MovementStep::withdraw(
                    "withdraw",
                    accounts.clone(),
                    leg(input.from_account_id),
                ))
                .step(MovementStep::deposit(
                    "deposit",
                    accounts.clone(),
                    leg(input.to_account_id),
                )),
        )
    }
}
