//! Simple REST API server example for the points ledger.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `POST /users/{id}/register` - Provision a balance row (optional signup grant)
//! - `POST /users/{id}/spend` - Authorize and account for a paid action
//! - `POST /users/{id}/earn` - Credit points (earn, purchase, subscription, refund)
//! - `GET /users/{id}/balance` - Current balance
//! - `GET /users/{id}/transactions` - Paged history with summary
//! - `POST /referral/grant-reward` - Issue a referral reward
//!
//! ## Example Usage
//!
//! ```bash
//! # Register with a signup grant
//! curl -X POST http://localhost:3000/users/1/register \
//!   -H "Content-Type: application/json" \
//!   -d '{"signup_grant": 100}'
//!
//! # Spend (idempotency key supplied by the caller)
//! curl -X POST http://localhost:3000/users/1/spend \
//!   -H "Content-Type: application/json" \
//!   -d '{"amount": 5, "description": "AI reply", "idempotency_key": "req-1"}'
//!
//! # History
//! curl 'http://localhost:3000/users/1/transactions?type=spend&limit=10'
//! ```
//!
//! The user id in the path stands in for an authenticated identity; the
//! ledger trusts whatever identity the surrounding product hands it.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use points_ledger::{
    ActionType, Ledger, LedgerError, Pagination, References, RewardGranter, TransactionFilter,
    TransactionId, TransactionSummary, UserId,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

/// Request body for registering a user.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub signup_grant: i64,
}

/// Request body for spending points.
#[derive(Debug, Deserialize)]
pub struct SpendRequest {
    pub amount: i64,
    pub description: String,
    pub idempotency_key: String,
    pub lead_id: Option<String>,
    pub message_id: Option<String>,
    pub campaign_id: Option<String>,
}

/// Request body for earning points.
#[derive(Debug, Deserialize)]
pub struct EarnRequest {
    pub amount: i64,
    pub description: String,
    pub source_type: ActionType,
}

/// Request body for granting a referral reward.
#[derive(Debug, Deserialize)]
pub struct GrantRewardRequest {
    pub user_id: u64,
    pub reward_type: String,
    pub value: i64,
    pub ttl_seconds: u64,
}

/// Query parameters for the transactions listing.
#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    #[serde(rename = "type")]
    pub action_type: Option<ActionType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Response body carrying a balance.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub ok: bool,
    pub balance: i64,
}

/// Response body for the transactions listing.
#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub ok: bool,
    pub items: Vec<points_ledger::Transaction>,
    pub total: usize,
    pub summary: TransactionSummary,
}

/// Response body for a granted reward.
#[derive(Debug, Serialize)]
pub struct RewardResponse {
    pub ok: bool,
    pub reward_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insufficient_points: Option<bool>,
}

// === Application State ===

/// Shared application state containing the ledger and reward granter.
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub rewards: Arc<RewardGranter>,
}

// === Error Handling ===

/// Wrapper for converting `LedgerError` into HTTP responses.
pub struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            LedgerError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            LedgerError::AmountOverflow => (StatusCode::BAD_REQUEST, "AMOUNT_OVERFLOW"),
            LedgerError::EmptyIdempotencyKey => {
                (StatusCode::BAD_REQUEST, "EMPTY_IDEMPOTENCY_KEY")
            }
            LedgerError::IdempotencyKeyReuse => (StatusCode::CONFLICT, "IDEMPOTENCY_KEY_REUSE"),
            LedgerError::UserNotFound => (StatusCode::NOT_FOUND, "USER_NOT_FOUND"),
            LedgerError::UserExists => (StatusCode::CONFLICT, "USER_EXISTS"),
            // Distinct, user-actionable refusal: the UI prompts a top-up.
            LedgerError::InsufficientBalance => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_POINTS")
            }
            LedgerError::Conflict => (StatusCode::SERVICE_UNAVAILABLE, "CONFLICT"),
            LedgerError::InvalidSourceType => (StatusCode::BAD_REQUEST, "INVALID_SOURCE_TYPE"),
            LedgerError::RewardNotFound => (StatusCode::NOT_FOUND, "REWARD_NOT_FOUND"),
            LedgerError::RewardExpired => (StatusCode::GONE, "REWARD_EXPIRED"),
            LedgerError::RewardConsumed => (StatusCode::CONFLICT, "REWARD_CONSUMED"),
            LedgerError::Internal => (StatusCode::SERVICE_UNAVAILABLE, "INTERNAL"),
        };

        let insufficient_points = matches!(self.0, LedgerError::InsufficientBalance).then_some(true);

        (
            status,
            Json(ErrorResponse {
                ok: false,
                error: self.0.to_string(),
                code: code.to_string(),
                insufficient_points,
            }),
        )
            .into_response()
    }
}

// === Handlers ===

/// POST /users/{id}/register - Provision a balance row.
async fn register_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<BalanceResponse>), AppError> {
    let balance = state.ledger.register_user(UserId(id), request.signup_grant)?;
    Ok((StatusCode::CREATED, Json(BalanceResponse { ok: true, balance })))
}

/// POST /users/{id}/spend - Authorize and account for a paid action.
async fn spend(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<SpendRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    let receipt = state.ledger.spend(
        UserId(id),
        request.amount,
        &request.description,
        TransactionId(request.idempotency_key),
        References {
            lead_id: request.lead_id,
            message_id: request.message_id,
            campaign_id: request.campaign_id,
        },
    )?;
    Ok(Json(BalanceResponse {
        ok: true,
        balance: receipt.balance,
    }))
}

/// POST /users/{id}/earn - Credit points.
async fn earn(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<EarnRequest>,
) -> Result<Json<BalanceResponse>, AppError> {
    let receipt = state.ledger.earn(
        UserId(id),
        request.amount,
        &request.description,
        request.source_type,
        References::none(),
    )?;
    Ok(Json(BalanceResponse {
        ok: true,
        balance: receipt.balance,
    }))
}

/// GET /users/{id}/balance - Current balance.
async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state.ledger.balance_of(UserId(id))?;
    Ok(Json(BalanceResponse { ok: true, balance }))
}

/// GET /users/{id}/transactions - Paged history with summary.
async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<TransactionsResponse>, AppError> {
    let user_id = UserId(id);
    let filter = TransactionFilter {
        action_type: query.action_type,
        from: query.from,
        to: query.to,
    };
    let page = Pagination::new(
        query.offset.unwrap_or(0),
        query.limit.unwrap_or(Pagination::DEFAULT_LIMIT),
    );

    let listed = state.ledger.list_transactions(user_id, &filter, &page)?;
    let summary = state.ledger.summarize(user_id)?;

    Ok(Json(TransactionsResponse {
        ok: true,
        items: listed.items,
        total: listed.total,
        summary,
    }))
}

/// POST /referral/grant-reward - Issue a referral reward.
async fn grant_reward(
    State(state): State<AppState>,
    Json(request): Json<GrantRewardRequest>,
) -> Result<(StatusCode, Json<RewardResponse>), AppError> {
    let reward = state.rewards.grant_referral_reward(
        UserId(request.user_id),
        &request.reward_type,
        request.value,
        request.ttl_seconds,
    )?;
    Ok((
        StatusCode::CREATED,
        Json(RewardResponse {
            ok: true,
            reward_id: reward.id.to_string(),
            expires_at: reward.expires_at,
        }),
    ))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/users/{id}/register", post(register_user))
        .route("/users/{id}/spend", post(spend))
        .route("/users/{id}/earn", post(earn))
        .route("/users/{id}/balance", get(get_balance))
        .route("/users/{id}/transactions", get(list_transactions))
        .route("/referral/grant-reward", post(grant_reward))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let ledger = Arc::new(Ledger::new());
    let rewards = Arc::new(RewardGranter::new(Arc::clone(&ledger)));

    // Background maintenance: retry stranded log appends and flip overdue
    // rewards to expired.
    {
        let ledger = Arc::clone(&ledger);
        let rewards = Arc::clone(&rewards);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let flushed = ledger.flush_backfill();
                if flushed > 0 {
                    tracing::info!(flushed, "backfilled transaction records");
                }
                let expired = rewards.expire_due();
                if expired > 0 {
                    tracing::info!(expired, "expired overdue rewards");
                }
            }
        });
    }

    let state = AppState { ledger, rewards };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Points ledger API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /users/:id/register      - Provision a balance row");
    println!("  POST /users/:id/spend         - Spend points (idempotent)");
    println!("  POST /users/:id/earn          - Credit points");
    println!("  GET  /users/:id/balance       - Current balance");
    println!("  GET  /users/:id/transactions  - History with summary");
    println!("  POST /referral/grant-reward   - Issue a referral reward");

    axum::serve(listener, app).await.unwrap();
}
