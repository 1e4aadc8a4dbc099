//! API Routes
//!
//! HTTP endpoint definitions. Commands go through the application services;
//! balance and history are read from the projections only.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::aggregate::{Account, AccountStatus, Aggregate, TransferStatus};
use crate::connectors::{AssetRegistry, TransferDirection};
use crate::domain::{AssetCode, DomainError, Money, OperationContext};
use crate::error::{AppError, AppResult};
use crate::handlers::{
    AccountService, CommandOutcome, MovementCommand, OpenAccountCommand, TransferCommand,
    TransferResult, TransferService,
};
use crate::projection::{BalanceRow, ProjectionStore, TransactionRow};
use crate::workflow::{WorkflowEngine, WorkflowExecution, WorkflowStatus};
use crate::workflows::{
    BatchInput, BatchProcessingWorkflow, CreateAccountInput, CreateAccountWorkflow,
    CustodianTransferInput, CustodianTransferWorkflow, Posting, TransferWorkflow,
    WorkflowCatalog,
};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub accounts: AccountService,
    pub transfers: TransferService,
    pub engine: WorkflowEngine,
    pub catalog: WorkflowCatalog,
    pub projections: Arc<dyn ProjectionStore>,
    pub assets: Arc<dyn AssetRegistry>,
}

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct OpenAccountRequest {
    /// Defaults to the idempotency key, then to a fresh id
    #[serde(default)]
    pub account_id: Option<Uuid>,
    pub asset_code: AssetCode,
    #[serde(default)]
    pub owner_id: Option<Uuid>,
    /// Minor units; funds the account in the same workflow
    #[serde(default)]
    pub initial_deposit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MovementRequest {
    pub amount: i64,
    #[serde(default)]
    pub asset_code: Option<AssetCode>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FreezeRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CustodianTransferBody {
    #[serde(default)]
    pub transfer_id: Option<Uuid>,
    pub account_id: Uuid,
    pub custodian: String,
    pub external_account: String,
    pub amount: i64,
    pub asset_code: AssetCode,
    pub direction: TransferDirection,
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    #[serde(default)]
    pub batch_id: Option<Uuid>,
    pub postings: Vec<Posting>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub asset_code: AssetCode,
    pub balance: i64,
    pub formatted_balance: String,
    pub status: AccountStatus,
    pub frozen_reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub asset_code: AssetCode,
    pub balance: i64,
    pub formatted_balance: String,
    pub status: AccountStatus,
    pub last_applied_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub account_id: Uuid,
    pub transactions: Vec<TransactionRow>,
    pub limit: usize,
    pub offset: usize,
}

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

// =========================================================================
// Router
// =========================================================================

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Layers run last-added first: context -> logging -> handler
    let api = Router::new()
        .route("/accounts", post(open_account))
        .route("/accounts/:account_id", get(get_account))
        .route("/accounts/:account_id/balance", get(get_balance))
        .route("/accounts/:account_id/transactions", get(get_transactions))
        .route("/accounts/:account_id/deposit", post(deposit))
        .route("/accounts/:account_id/withdraw", post(withdraw))
        .route("/accounts/:account_id/freeze", post(freeze))
        .route("/accounts/:account_id/unfreeze", post(unfreeze))
        .route("/accounts/:account_id/close", post(close))
        .route("/transfers", post(create_transfer))
        .route("/transfers/:transfer_id", get(get_transfer))
        .route("/custodian-transfers", post(create_custodian_transfer))
        .route("/batches", post(create_batch))
        .route("/workflows/:workflow_id", get(get_workflow))
        .route("/workflows/:workflow_id/cancel", post(cancel_workflow))
        .layer(middleware::from_fn(super::middleware::logging_middleware))
        .layer(middleware::from_fn(super::middleware::context_middleware));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

fn format_money(assets: &dyn AssetRegistry, money: &Money) -> AppResult<String> {
    assets
        .format(money)
        .map_err(|e| AppError::Domain(DomainError::from(e)))
}

fn account_response(state: &AppState, account: &Account) -> AppResult<AccountResponse> {
    Ok(AccountResponse {
        account_id: account.id(),
        owner_id: account.owner_id(),
        asset_code: account.asset_code().clone(),
        balance: account.balance().amount(),
        formatted_balance: format_money(state.assets.as_ref(), account.balance())?,
        status: account.status(),
        frozen_reason: account.frozen_reason().map(str::to_string),
        version: account.version(),
        created_at: account.created_at(),
    })
}

// =========================================================================
// Accounts
// =========================================================================

/// Open an account, optionally funding it through the account workflow
async fn open_account(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Json(request): Json<OpenAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let account_id = request
        .account_id
        .or(ctx.idempotency_key)
        .unwrap_or_else(Uuid::new_v4);

    match request.initial_deposit {
        None => {
            let mut command = OpenAccountCommand::new(account_id, request.asset_code);
            if let Some(owner_id) = request.owner_id {
                command = command.with_owner(owner_id);
            }
            state.accounts.open(command, &ctx).await?;
        }
        Some(amount) => {
            let deposit = Money::new(amount, request.asset_code.clone()).map_err(DomainError::from)?;
            let input = CreateAccountInput {
                account_id,
                asset_code: request.asset_code,
                owner_id: request.owner_id,
                initial_deposit: Some(deposit),
            };
            let definition = CreateAccountWorkflow::definition(&state.accounts, &input)?;
            let workflow_id = Uuid::new_v5(&account_id, CreateAccountWorkflow::TYPE.as_bytes());

            let execution = state.engine.start(workflow_id, definition).await?;
            if execution.status != WorkflowStatus::Completed {
                return Err(AppError::from_rolled_back(&execution));
            }
        }
    }

    let account = state.accounts.get(account_id).await?;
    Ok((StatusCode::CREATED, Json(account_response(&state, &account)?)))
}

/// Current state, rebuilt from the account's stream
async fn get_account(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state.accounts.get(account_id).await?;
    Ok(Json(account_response(&state, &account)?))
}

async fn get_balance(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<BalanceResponse>, AppError> {
    let row: BalanceRow = state
        .projections
        .balance(account_id)
        .await?
        .ok_or(AppError::Domain(DomainError::AccountNotFound(account_id)))?;

    let money = Money::new(row.balance, row.asset_code.clone()).map_err(DomainError::from)?;
    Ok(Json(BalanceResponse {
        account_id,
        formatted_balance: format_money(state.assets.as_ref(), &money)?,
        asset_code: row.asset_code,
        balance: row.balance,
        status: row.status,
        last_applied_sequence: row.last_applied_sequence,
        updated_at: row.updated_at,
    }))
}

/// Account history, most recent first
async fn get_transactions(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, AppError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    if state.projections.balance(account_id).await?.is_none() {
        return Err(AppError::Domain(DomainError::AccountNotFound(account_id)));
    }

    let transactions = state
        .projections
        .transactions(account_id, limit, offset)
        .await?;

    Ok(Json(TransactionsResponse {
        account_id,
        transactions,
        limit,
        offset,
    }))
}

fn movement(account_id: Uuid, request: MovementRequest) -> MovementCommand {
    let mut command = MovementCommand::new(account_id, request.amount);
    if let Some(asset_code) = request.asset_code {
        command = command.with_asset(asset_code);
    }
    if let Some(description) = request.description {
        command = command.with_description(description);
    }
    command
}

async fn deposit(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Extension(ctx): Extension<OperationContext>,
    Json(request): Json<MovementRequest>,
) -> Result<Json<CommandOutcome>, AppError> {
    let outcome = state
        .accounts
        .deposit(movement(account_id, request), &ctx)
        .await?;
    Ok(Json(outcome))
}

async fn withdraw(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Extension(ctx): Extension<OperationContext>,
    Json(request): Json<MovementRequest>,
) -> Result<Json<CommandOutcome>, AppError> {
    let outcome = state
        .accounts
        .withdraw(movement(account_id, request), &ctx)
        .await?;
    Ok(Json(outcome))
}

async fn freeze(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Extension(ctx): Extension<OperationContext>,
    Json(request): Json<FreezeRequest>,
) -> Result<Json<CommandOutcome>, AppError> {
    let outcome = state
        .accounts
        .freeze(account_id, &request.reason, &ctx)
        .await?;
    Ok(Json(outcome))
}

async fn unfreeze(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Extension(ctx): Extension<OperationContext>,
) -> Result<Json<CommandOutcome>, AppError> {
    Ok(Json(state.accounts.unfreeze(account_id, &ctx).await?))
}

async fn close(
    State(state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Extension(ctx): Extension<OperationContext>,
    Json(request): Json<CloseRequest>,
) -> Result<Json<CommandOutcome>, AppError> {
    let outcome = state
        .accounts
        .close(account_id, &request.reason, &ctx)
        .await?;
    Ok(Json(outcome))
}

// =========================================================================
// Transfers
// =========================================================================

/// Execute a transfer. Business failures come back in the body with status
/// `failed` or `compensated`; a transfer still being driven elsewhere is
/// reported as `202 Accepted`.
async fn create_transfer(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Json(command): Json<TransferCommand>,
) -> Result<(StatusCode, Json<TransferResult>), AppError> {
    let result = state.transfers.execute(command, &ctx).await?;

    let status = match result.status {
        TransferStatus::Pending => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(result)))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(transfer_id): Path<Uuid>,
) -> Result<Json<TransferResult>, AppError> {
    Ok(Json(state.transfers.get(transfer_id).await?))
}

// =========================================================================
// Custodian transfers and batches
// =========================================================================

/// Run a custodian transfer to its end. A rolled-back run is reported in
/// the body, like transfers.
async fn create_custodian_transfer(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Json(body): Json<CustodianTransferBody>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let input = CustodianTransferInput {
        transfer_id: body
            .transfer_id
            .or(ctx.idempotency_key)
            .unwrap_or_else(Uuid::new_v4),
        account_id: body.account_id,
        custodian: body.custodian,
        external_account: body.external_account,
        amount: Money::new(body.amount, body.asset_code).map_err(DomainError::from)?,
        direction: body.direction,
    };
    let definition = CustodianTransferWorkflow::definition(
        &state.accounts,
        state.catalog.custodians(),
        &input,
    )?;

    Ok(Json(state.engine.start(input.transfer_id, definition).await?))
}

/// Apply a batch of postings; any refused posting rolls the whole batch back
async fn create_batch(
    State(state): State<AppState>,
    Extension(ctx): Extension<OperationContext>,
    Json(body): Json<BatchBody>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let input = BatchInput {
        batch_id: body
            .batch_id
            .or(ctx.idempotency_key)
            .unwrap_or_else(Uuid::new_v4),
        postings: body.postings,
    };
    let definition = BatchProcessingWorkflow::definition(&state.accounts, &input)?;

    Ok(Json(state.engine.start(input.batch_id, definition).await?))
}

// =========================================================================
// Workflows
// =========================================================================

async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let execution = state
        .engine
        .get(workflow_id)
        .await?
        .ok_or_else(|| AppError::not_found("Workflow", workflow_id))?;
    Ok(Json(execution))
}

/// Request cancellation. When no driver in this process owns the workflow,
/// compensation runs before responding.
async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Extension(ctx): Extension<OperationContext>,
) -> Result<Json<WorkflowExecution>, AppError> {
    let execution = state.engine.cancel(workflow_id).await?;
    if state.engine.is_active(workflow_id) {
        return Ok(Json(execution));
    }

    let definition = state.catalog.for_execution(&execution)?;
    let execution = state.engine.resume(workflow_id, definition).await?;

    if execution.workflow_type == TransferWorkflow::TYPE {
        state.transfers.settle(workflow_id, &ctx).await?;
    }
    Ok(Json(execution))
}
