//! Account creation workflow
//!
//! Opens the account and, optionally, funds it. Rolling back withdraws the
//! initial deposit and then closes the account.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AssetCode, Money};
use crate::handlers::{AccountService, MovementCommand, OpenAccountCommand};
use crate::workflow::{WorkflowDefinition, WorkflowError};

use super::account_steps::{MovementStep, OpenAccountStep};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountInput {
    pub account_id: Uuid,
    pub asset_code: AssetCode,
    pub owner_id: Option<Uuid>,
    pub initial_deposit: Option<Money>,
}

pub struct CreateAccountWorkflow;

impl CreateAccountWorkflow {
    pub const TYPE: &'static str = "create_account";

    pub fn definition(
        accounts: &AccountService,
        input: &CreateAccountInput,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let mut open = OpenAccountCommand::new(input.account_id, input.asset_code.clone());
        if let Some(owner_id) = input.owner_id {
            open = open.with_owner(owner_id);
        }

        let mut definition = WorkflowDefinition::new(Self::TYPE, serde_json::to_value(input)?)
            .step(OpenAccountStep::new(accounts.clone(), open));

        if let Some(deposit) = &input.initial_deposit {
            if deposit.asset_code() != &input.asset_code {
                return Err(WorkflowError::InvalidInput(format!(
                    "initial deposit in {} for a {} account",
                    deposit.asset_code(),
                    input.asset_code
                )));
            }
            definition = definition.step(MovementStep::deposit(
                "initial_deposit",
                accounts.clone(),
                MovementCommand::of(input.account_id, deposit).with_description("Initial deposit"),
            ));
        }

        Ok(definition)
    }
}
