//! Scheduled Jobs
//!
//! Background jobs for periodic maintenance tasks: resuming workflows left
//! behind by a crash, catching projections up with the log, and auditing
//! hash chains.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::domain::OperationContext;
use crate::error::AppError;
use crate::event_store::{verify_stream, ChainVerification, EventLog, EventLogError};
use crate::handlers::TransferService;
use crate::projection::{BalanceProjector, ProjectionError};
use crate::workflow::{WorkflowEngine, WorkflowError};
use crate::workflows::{RecoveryReport, WorkflowCatalog};

/// Everything the jobs operate on
#[derive(Clone)]
pub struct JobContext {
    pub log: Arc<dyn EventLog>,
    pub engine: WorkflowEngine,
    pub catalog: WorkflowCatalog,
    pub transfers: TransferService,
    pub projector: BalanceProjector,
}

// =========================================================================
// Workflow recovery
// =========================================================================

/// Resume unfinished workflows, then give every transfer still `Pending`
/// its final event
pub async fn recover_workflows(context: &JobContext) -> Result<RecoveryReport, JobError> {
    let mut report = context.catalog.recover_incomplete(&context.engine).await?;

    report.transfers_settled = context
        .transfers
        .settle_pending(&OperationContext::now())
        .await?;

    if report.examined > 0 {
        tracing::info!(
            examined = report.examined,
            resumed = report.resumed,
            skipped = report.skipped,
            failed = report.failed,
            transfers_settled = report.transfers_settled,
            "Workflow recovery sweep finished"
        );
    }
    Ok(report)
}

// =========================================================================
// Projection catch-up
// =========================================================================

/// Apply anything the subscription missed
pub async fn catch_up_projections(context: &JobContext) -> Result<u64, JobError> {
    let applied = context.projector.catch_up_all(context.log.as_ref()).await?;

    if applied > 0 {
        tracing::info!(applied, "Projections caught up from the log");
    }
    Ok(applied)
}

// =========================================================================
// Hash chain audit
// =========================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub streams_checked: usize,
    pub events_checked: u64,
    pub broken: Vec<ChainVerification>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty()
    }
}

/// Recompute the hash chain of every stream
pub async fn audit_hash_chains(log: &dyn EventLog) -> Result<AuditReport, JobError> {
    let mut report = AuditReport::default();

    for aggregate_id in log.aggregate_ids().await? {
        let verification = verify_stream(log, aggregate_id).await?;
        report.streams_checked += 1;
        report.events_checked += verification.events_checked;

        if !verification.is_valid {
            tracing::error!(
                aggregate_id = %aggregate_id,
                first_invalid_sequence = ?verification.first_invalid_sequence,
                "Hash chain broken"
            );
            report.broken.push(verification);
        }
    }

    Ok(report)
}

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for workflow recovery (default: 30 seconds)
    pub recovery_interval: Duration,
    /// Interval for projection catch-up (default: 1 minute)
    pub projection_catch_up_interval: Duration,
    /// Interval for the hash chain audit (default: 1 hour)
    pub chain_audit_interval: Duration,
}

impl JobSchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recovery_interval: config.recovery_interval,
            projection_catch_up_interval: config.projection_catch_up_interval,
            chain_audit_interval: config.chain_audit_interval,
        }
    }
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            recovery_interval: Duration::from_secs(30),
            projection_catch_up_interval: Duration::from_secs(60),
            chain_audit_interval: Duration::from_secs(3600),
        }
    }
}

/// Job Scheduler - runs periodic maintenance tasks
pub struct JobScheduler {
    context: JobContext,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    pub fn new(context: JobContext, config: JobSchedulerConfig) -> Self {
        Self { context, config }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the scheduler loop
    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut recovery_interval = interval(self.config.recovery_interval);
        let mut projection_interval = interval(self.config.projection_catch_up_interval);
        let mut audit_interval = interval(self.config.chain_audit_interval);
        for timer in [&mut recovery_interval, &mut projection_interval, &mut audit_interval] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                _ = recovery_interval.tick() => {
                    if let Err(e) = recover_workflows(&self.context).await {
                        tracing::error!(error = %e, "Workflow recovery failed");
                    }
                }
                _ = projection_interval.tick() => {
                    if let Err(e) = catch_up_projections(&self.context).await {
                        tracing::error!(error = %e, "Projection catch-up failed");
                    }
                }
                _ = audit_interval.tick() => {
                    match audit_hash_chains(self.context.log.as_ref()).await {
                        Ok(report) if !report.is_clean() => {
                            tracing::error!(broken = report.broken.len(), "Hash chain audit found tampered streams");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Hash chain audit failed"),
                    }
                }
            }
        }
    }

    /// Run all maintenance jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            completed_at: Utc::now(),
            ..MaintenanceReport::default()
        };

        match recover_workflows(&self.context).await {
            Ok(recovery) => report.workflows_resumed = recovery.resumed,
            Err(e) => report.errors.push(format!("Workflow recovery: {}", e)),
        }

        match catch_up_projections(&self.context).await {
            Ok(applied) => report.projection_events_applied = applied,
            Err(e) => report.errors.push(format!("Projection catch-up: {}", e)),
        }

        match audit_hash_chains(self.context.log.as_ref()).await {
            Ok(audit) => {
                report.streams_audited = audit.streams_checked;
                report.broken_chains = audit.broken.len();
            }
            Err(e) => report.errors.push(format!("Hash chain audit: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub workflows_resumed: usize,
    pub projection_events_applied: u64,
    pub streams_audited: usize,
    pub broken_chains: usize,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    #[error("Event log error: {0}")]
    EventLog(#[from] EventLogError),

    #[error("Application error: {0}")]
    App(#[from] AppError),
}

// =========================================================================
// Tests
// =========================================================================
