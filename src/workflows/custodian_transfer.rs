//! Custodian transfer workflow
//!
//! Moves money between a ledger account and an account held at an external
//! custodian.
//!
//! Outgoing: check availability → withdraw from the ledger → push to the
//! custodian. Incoming: check availability → pull from the custodian →
//! deposit to the ledger. A custodian leg is compensated by moving the
//! funds back the other way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::connectors::{
    CustodianConnector, CustodianRegistry, CustodianTransferRequest, TransferDirection,
};
use crate::domain::Money;
use crate::handlers::{AccountService, MovementCommand};
use crate::workflow::{StepContext, StepError, WorkflowDefinition, WorkflowError, WorkflowStep};

use super::account_steps::MovementStep;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodianTransferInput {
    pub transfer_id: Uuid,
    pub account_id: Uuid,
    pub custodian: String,
    pub external_account: String,
    pub amount: Money,
    pub direction: TransferDirection,
}

pub struct CustodianTransferWorkflow;

impl CustodianTransferWorkflow {
    pub const TYPE: &'static str = "custodian_transfer";

    pub fn definition(
        accounts: &AccountService,
        custodians: &CustodianRegistry,
        input: &CustodianTransferInput,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let connector = custodians.get(&input.custodian).ok_or_else(|| {
            WorkflowError::InvalidInput(format!("unknown custodian {:?}", input.custodian))
        })?;

        let ledger_leg = MovementCommand::of(input.account_id, &input.amount)
            .with_transfer(input.transfer_id)
            .with_description(format!("Custodian transfer via {}", input.custodian));
        let custodian_leg = CustodianTransferStep {
            connector: Arc::clone(&connector),
            external_account: input.external_account.clone(),
            amount: input.amount.clone(),
            direction: input.direction,
        };

        let definition = WorkflowDefinition::new(Self::TYPE, serde_json::to_value(input)?)
            .step(AvailabilityCheckStep { connector });

        Ok(match input.direction {
            TransferDirection::Outgoing => definition
                .step(MovementStep::withdraw("withdraw", accounts.clone(), ledger_leg))
                .step(custodian_leg),
            TransferDirection::Incoming => definition
                .step(custodian_leg)
                .step(MovementStep::deposit("deposit", accounts.clone(), ledger_leg)),
        })
    }
}

/// Fails fast (and retryably) while the custodian is down
struct AvailabilityCheckStep {
    connector: Arc<dyn CustodianConnector>,
}

#[async_trait]
impl WorkflowStep for AvailabilityCheckStep {
    fn name(&self) -> &str {
        "check_custodian"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<Value, StepError> {
        if !self.connector.is_available().await {
            return Err(StepError::Infrastructure(format!(
                "custodian {} unavailable",
                self.connector.name()
            )));
        }
        Ok(Value::Bool(true))
    }
}

struct CustodianTransferStep {
    connector: Arc<dyn CustodianConnector>,
    external_account: String,
    amount: Money,
    direction: TransferDirection,
}

impl CustodianTransferStep {
    fn request(&self, reference: Uuid, direction: TransferDirection) -> CustodianTransferRequest {
        CustodianTransferRequest {
            reference,
            external_account: self.external_account.clone(),
            amount: self.amount.clone(),
            direction,
        }
    }
}

#[async_trait]
impl WorkflowStep for CustodianTransferStep {
    fn name(&self) -> &str {
        match self.direction {
            TransferDirection::Outgoing => "custodian_push",
            TransferDirection::Incoming => "custodian_pull",
        }
    }

    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let receipt = self
            .connector
            .transfer(&self.request(ctx.idempotency_key(), self.direction))
            .await?;

        tracing::info!(
            workflow_id = %ctx.workflow_id,
            custodian = self.connector.name(),
            custodian_reference = %receipt.custodian_reference,
            "Custodian transfer accepted"
        );
        serde_json::to_value(&receipt).map_err(|e| StepError::rejected("serialization_error", e.to_string()))
    }

    async fn compensate(&self, ctx: &StepContext, _result: Option<&Value>) -> Result<(), StepError> {
        self.connector
            .transfer(&self.request(ctx.compensation_key(), self.direction.reversed()))
            .await?;
        Ok(())
    }

    async fn probe(&self, ctx: &StepContext) -> Result<Option<Value>, StepError> {
        let receipt = self.connector.find_transfer(ctx.idempotency_key()).await?;
        receipt
            .map(|r| serde_json::to_value(&r))
            .transpose()
            .map_err(|e| StepError::rejected("serialization_error", e.to_string()))
    }
}
