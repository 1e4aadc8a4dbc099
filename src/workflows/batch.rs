//! Batch processing workflow
//!
//! End-of-day postings applied as one saga: one step per ledger leg, in
//! submission order. A failing leg reverses every earlier leg, newest
//! first, the same policy as a single transfer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Money;
use crate::handlers::{AccountService, MovementCommand};
use crate::workflow::{WorkflowDefinition, WorkflowError};

use super::account_steps::MovementStep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Posting {
    Credit {
        account_id: Uuid,
        amount: Money,
    },
    Debit {
        account_id: Uuid,
        amount: Money,
    },
    Transfer {
        from_account_id: Uuid,
        to_account_id: Uuid,
        amount: Money,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInput {
    pub batch_id: Uuid,
    pub postings: Vec<Posting>,
}

pub struct BatchProcessingWorkflow;

impl BatchProcessingWorkflow {
    pub const TYPE: &'static str = "batch";

    pub fn definition(
        accounts: &AccountService,
        input: &BatchInput,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        if input.postings.is_empty() {
            return Err(WorkflowError::InvalidInput("empty batch".to_string()));
        }

        let description = |index: usize| format!("Batch {} posting {}", input.batch_id, index);
        let mut definition = WorkflowDefinition::new(Self::TYPE, serde_json::to_value(input)?);

        for (index, posting) in input.postings.iter().enumerate() {
            definition = match posting {
                Posting::Credit { account_id, amount } => definition.step(MovementStep::deposit(
                    format!("posting_{index}:credit"),
                    accounts.clone(),
                    MovementCommand::of(*account_id, amount).with_description(description(index)),
                )),
                Posting::Debit { account_id, amount } => definition.step(MovementStep::withdraw(
                    format!("posting_{index}:debit"),
                    accounts.clone(),
                    MovementCommand::of(*account_id, amount).with_description(description(index)),
                )),
                Posting::Transfer {
                    from_account_id,
                    to_account_id,
                    amount,
                } => {
                    if from_account_id == to_account_id {
                        return Err(WorkflowError::InvalidInput(format!(
                            "posting {index} transfers to its own account"
                        )));
                    }
                    definition
                        .step(MovementStep::withdraw(
                            format!("posting_{index}:withdraw"),
                            accounts.clone(),
                            MovementCommand::of(*from_account_id, amount)
                                .with_transfer(input.batch_id)
                                .with_description(description(index)),
                        ))
                        .step(MovementStep::deposit(
                            format!("posting_{index}:deposit"),
                            accounts.clone(),
                            MovementCommand::of(*to_account_id, amount)
                                .with_transfer(input.batch_id)
                                .with_description(description(index)),
                        ))
                }
            };
        }

        Ok(definition)
    }
}
