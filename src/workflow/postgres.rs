//! PostgreSQL workflow repository (`workflow_executions`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{StepRecord, WorkflowError, WorkflowExecution, WorkflowRepository, WorkflowStatus};

type ExecutionRow = (
    Uuid,
    String,
    serde_json::Value,
    serde_json::Value,
    String,
    Option<String>,
    bool,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
);

const SELECT_EXECUTION: &str = r#"
    SELECT id, workflow_type, input, steps, status, error,
           requires_intervention, cancel_requested, created_at, updated_at
    FROM workflow_executions
"#;

fn row_to_execution(row: ExecutionRow) -> Result<WorkflowExecution, WorkflowError> {
    let (
        id,
        workflow_type,
        input,
        steps,
        status,
        error,
        requires_intervention,
        cancel_requested,
        created_at,
        updated_at,
    ) = row;

    let status = WorkflowStatus::parse(&status)
        .ok_or_else(|| WorkflowError::Corrupted(format!("unknown status {status:?} for {id}")))?;
    let steps: Vec<StepRecord> = serde_json::from_value(steps)?;

    Ok(WorkflowExecution {
        id,
        workflow_type,
        input,
        steps,
        status,
        error,
        requires_intervention,
        cancel_requested,
        created_at,
        updated_at,
    })
}

#[derive(Debug, Clone)]
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn create(&self, execution: &WorkflowExecution) -> Result<bool, WorkflowError> {
        let rows_affected = sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, workflow_type, input, steps, status, error,
                requires_intervention, cancel_requested, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(execution.id)
        .bind(&execution.workflow_type)
        .bind(&execution.input)
        .bind(serde_json::to_value(&execution.steps)?)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.requires_intervention)
        .bind(execution.cancel_requested)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn save(&self, execution: &WorkflowExecution) -> Result<(), WorkflowError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET
                steps = $2,
                status = $3,
                error = $4,
                requires_intervention = $5,
                cancel_requested = cancel_requested OR $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(execution.id)
        .bind(serde_json::to_value(&execution.steps)?)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.requires_intervention)
        .bind(execution.cancel_requested)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(WorkflowError::NotFound(execution.id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>, WorkflowError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!("{SELECT_EXECUTION} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_execution).transpose()
    }

    async fn request_cancel(&self, id: Uuid) -> Result<WorkflowExecution, WorkflowError> {
        let updated: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE workflow_executions
            SET cancel_requested = TRUE, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'compensated')
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let execution = self.get(id).await?.ok_or(WorkflowError::NotFound(id))?;
        if updated.is_none() {
            return Err(WorkflowError::NotCancellable {
                workflow_id: id,
                status: execution.status,
            });
        }
        Ok(execution)
    }

    async fn cancel_requested(&self, id: Uuid) -> Result<bool, WorkflowError> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM workflow_executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn list_incomplete(&self) -> Result<Vec<WorkflowExecution>, WorkflowError> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{SELECT_EXECUTION}
             WHERE status IN ('running', 'compensating')
                OR (status = 'failed' AND NOT requires_intervention)
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_execution).collect()
    }
}
