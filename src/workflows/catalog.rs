//! Workflow catalog
//!
//! Rebuilds a definition from the `(workflow_type, input)` persisted with
//! every execution, so unfinished workflows can be resumed after a restart.

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::connectors::CustodianRegistry;
use crate::handlers::AccountService;
use crate::workflow::{WorkflowDefinition, WorkflowEngine, WorkflowError, WorkflowExecution};

use super::{
    BatchProcessingWorkflow, CreateAccountWorkflow, CustodianTransferWorkflow,
    TransferWorkflow,
};

/// Outcome of a recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub examined: usize,
    pub resumed: usize,
    /// Driven elsewhere in this process right now
    pub skipped: usize,
    pub failed: usize,
    /// Executions that reached a final state during the sweep
    pub finished: Vec<(Uuid, String)>,
    /// Pending transfers that received their final event
    pub transfers_settled: usize,
}

#[derive(Clone)]
pub struct WorkflowCatalog {
    accounts: AccountService,
    custodians: CustodianRegistry,
}

impl WorkflowCatalog {
    pub fn new(accounts: AccountService, custodians: CustodianRegistry) -> Self {
        Self {
            accounts,
            custodians,
        }
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn custodians(&self) -> &CustodianRegistry {
        &self.custodians
    }

    pub fn definition(
        &self,
        workflow_type: &str,
        input: &serde_json::Value,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        match workflow_type {
            TransferWorkflow::TYPE => TransferWorkflow::definition(&self.accounts, &parse(input)?),
            CreateAccountWorkflow::TYPE => {
                CreateAccountWorkflow::definition(&self.accounts, &parse(input)?)
            }
            CustodianTransferWorkflow::TYPE => CustodianTransferWorkflow::definition(
                &self.accounts,
                &self.custodians,
                &parse(input)?,
            ),
            BatchProcessingWorkflow::TYPE => {
                BatchProcessingWorkflow::definition(&self.accounts, &parse(input)?)
            }
            other => Err(WorkflowError::UnknownWorkflowType(other.to_string())),
        }
    }

    pub fn for_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        self.definition(&execution.workflow_type, &execution.input)
    }

    /// Resume every execution that still has work to do
    pub async fn recover_incomplete(
        &self,
        engine: &WorkflowEngine,
    ) -> Result<RecoveryReport, WorkflowError> {
        let mut report = RecoveryReport::default();

        for execution in engine.repository().list_incomplete().await? {
            report.examined += 1;
            if engine.is_active(execution.id) {
                report.skipped += 1;
                continue;
            }

            let definition = match self.for_execution(&execution) {
                Ok(definition) => definition,
                Err(err) => {
                    tracing::error!(
                        workflow_id = %execution.id,
                        workflow_type = %execution.workflow_type,
                        error = %err,
                        "Cannot rebuild workflow definition"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            match engine.resume(execution.id, definition).await {
                Ok(done) => {
                    tracing::info!(
                        workflow_id = %done.id,
                        status = done.status.as_str(),
                        "Recovered workflow"
                    );
                    report.resumed += 1;
                    report.finished.push((done.id, done.workflow_type));
                }
                Err(WorkflowError::AlreadyRunning(_)) => report.skipped += 1,
                Err(err) => {
                    tracing::warn!(workflow_id = %execution.id, error = %err, "Workflow recovery failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

fn parse<T: DeserializeOwned>(input: &serde_json::Value) -> Result<T, WorkflowError> {
    serde_json::from_value(input.clone()).map_err(|e| WorkflowError::InvalidInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetCode, Money};
    use crate::event_store::InMemoryEventLog;
    use crate::retry::RetryPolicy;
    use crate::workflows::TransferInput;
    use serde_json::json;
    use std::sync::Arc;

    fn catalog() -> WorkflowCatalog {
        WorkflowCatalog::new(
            AccountService::new(Arc::new(InMemoryEventLog::new()), RetryPolicy::none()),
            CustodianRegistry::new(),
        )
    }

    #[test]
    fn test_rebuilds_transfer_definition() {
        let input = TransferInput {
            transfer_id: Uuid::new_v4(),
            from_account_id: Uuid::new_v4(),
            to_account_id: Uuid::new_v4(),
            amount: Money::new(100, AssetCode::new("USD").unwrap()).unwrap(),
            description: "rent".to_string(),
        };

        let definition = catalog()
            .definition(TransferWorkflow::TYPE, &serde_json::to_value(&input).unwrap())
            .unwrap();

        assert_eq!(definition.workflow_type(), "transfer");
        assert_eq!(definition.step_names(), vec!["withdraw", "deposit"]);
    }

    #[test]
    fn test_unknown_type_and_bad_input() {
        let catalog = catalog();

        let err = catalog.definition("payroll", &json!({})).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownWorkflowType(_)));

        let err = catalog
            .definition(TransferWorkflow::TYPE, &json!({ "amount": "lots" }))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_custodian_rejected() {
        let input = json!({
            "transfer_id": Uuid::new_v4(),
            "account_id": Uuid::new_v4(),
            "custodian": "nowhere",
            "external_account": "ext",
            "amount": { "amount": 5, "asset_code": "USD" },
            "direction": "outgoing",
        });

        let err = catalog()
            .definition(CustodianTransferWorkflow::TYPE, &input)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }
}
