//! Persisted workflow state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Compensated => "compensated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(WorkflowStatus::Running),
            "completed" => Some(WorkflowStatus::Completed),
            "failed" => Some(WorkflowStatus::Failed),
            "compensating" => Some(WorkflowStatus::Compensating),
            "compensated" => Some(WorkflowStatus::Compensated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    /// Output of the forward action, handed to its compensation
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Forward attempts across every run of this step
    pub attempts: u32,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            error_code: None,
            attempts: 0,
        }
    }
}

/// One run of a workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_type: String,
    /// Everything needed to rebuild the definition after a restart
    pub input: serde_json::Value,
    pub steps: Vec<StepRecord>,
    pub status: WorkflowStatus,
    pub error: Option<String>,
    /// Compensation failed; only an operator may touch this execution
    pub requires_intervention: bool,
    /// Sticky once set
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(
        id: Uuid,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
        step_names: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_type: workflow_type.into(),
            input,
            steps: step_names.into_iter().map(StepRecord::pending).collect(),
            status: WorkflowStatus::Running,
            error: None,
            requires_intervention: false,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Index of the first step that has not completed
    pub fn next_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status != StepStatus::Done)
    }

    /// Nothing more will happen without an operator
    pub fn is_finished(&self) -> bool {
        match self.status {
            WorkflowStatus::Completed | WorkflowStatus::Compensated => true,
            WorkflowStatus::Failed => self.requires_intervention,
            WorkflowStatus::Running | WorkflowStatus::Compensating => false,
        }
    }

    /// Index of the step that made the workflow fail
    pub fn failed_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status == StepStatus::Failed)
    }

    /// Result of the named step
    pub fn step_result(&self, name: &str) -> Option<&serde_json::Value> {
        self.steps
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.result.as_ref())
    }
}
