// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Integration tests for the REST API with concurrent requests.
//!
//! These tests verify that the HTTP surface maps ledger semantics
//! faithfully: 402 refusals, idempotent retries, and exact accounting
//! under concurrent spends.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use points_ledger::{
    ActionType, Ledger, LedgerError, Pagination, References, RewardGranter, TransactionFilter,
    TransactionId, UserId,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

// === DTOs (duplicated from the demo server for test isolation) ===

#[derive(Debug, Serialize, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    signup_grant: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpendRequest {
    amount: i64,
    description: String,
    idempotency_key: String,
    lead_id: Option<String>,
    message_id: Option<String>,
    campaign_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EarnRequest {
    amount: i64,
    description: String,
    source_type: ActionType,
}

#[derive(Debug, Serialize, Deserialize)]
struct GrantRewardRequest {
    user_id: u64,
    reward_type: String,
    value: i64,
    ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    #[serde(rename = "type")]
    action_type: Option<ActionType>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BalanceResponse {
    ok: bool,
    balance: i64,
}

#[derive(Debug, Serialize)]
struct TransactionsResponse {
    ok: bool,
    items: Vec<points_ledger::Transaction>,
    total: usize,
    summary: points_ledger::TransactionSummary,
}

#[derive(Debug, Serialize)]
struct RewardResponse {
    ok: bool,
    reward_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    insufficient_points: Option<bool>,
}

#[derive(Clone)]
struct AppState {
    ledger: Arc<Ledger>,
    rewards: Arc<RewardGranter>,
}

struct AppError(LedgerError);

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

async fn register_user(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<BalanceResponse>), AppError> {
    let balance = state.ledger.register_user(UserId(id), request.signup_grant)?;
    Ok((StatusCode::CREATED, Json(BalanceResponse { ok: true, balance })))
}

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

async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BalanceResponse>, AppError> {
    let balance = state.ledger.balance_of(UserId(id))?;
    Ok(Json(BalanceResponse { ok: true, balance }))
}

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

// === Test Harness ===

async fn spawn_server() -> (SocketAddr, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::new());
    let state = AppState {
        rewards: Arc::new(RewardGranter::new(Arc::clone(&ledger))),
        ledger: Arc::clone(&ledger),
    };
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, ledger)
}

fn spend_body(amount: i64, key: &str) -> SpendRequest {
    SpendRequest {
        amount,
        description: "AI reply".to_owned(),
        idempotency_key: key.to_owned(),
        lead_id: None,
        message_id: None,
        campaign_id: None,
    }
}

// === Tests ===

#[tokio::test]
async fn register_spend_balance_round_trip() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    let response = client
        .post(format!("http://{addr}/users/1/register"))
        .json(&RegisterRequest { signup_grant: 100 })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let response = client
        .post(format!("http://{addr}/users/1/spend"))
        .json(&spend_body(30, "req-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: BalanceResponse = response.json().await.unwrap();
    assert!(body.ok);
    assert_eq!(body.balance, 70);

    let response = client
        .get(format!("http://{addr}/users/1/balance"))
        .send()
        .await
        .unwrap();
    let body: BalanceResponse = response.json().await.unwrap();
    assert_eq!(body.balance, 70);
}

#[tokio::test]
async fn insufficient_balance_is_402_with_flag() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    client
        .post(format!("http://{addr}/users/1/register"))
        .json(&RegisterRequest { signup_grant: 10 })
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("http://{addr}/users/1/spend"))
        .json(&spend_body(11, "req-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 402);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "INSUFFICIENT_POINTS");
    assert_eq!(body["insufficient_points"], true);
}

#[tokio::test]
async fn unknown_user_is_404() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    let response = client
        .get(format!("http://{addr}/users/404/balance"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn retried_spend_is_idempotent_over_http() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    client
        .post(format!("http://{addr}/users/1/register"))
        .json(&RegisterRequest { signup_grant: 5 })
        .send()
        .await
        .unwrap();

    for _ in 0..3 {
        let response = client
            .post(format!("http://{addr}/users/1/spend"))
            .json(&spend_body(3, "req-1"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: BalanceResponse = response.json().await.unwrap();
        assert_eq!(body.balance, 2, "every retry reports the first post-state");
    }
}

#[tokio::test]
async fn transactions_listing_with_summary() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    client
        .post(format!("http://{addr}/users/1/register"))
        .json(&RegisterRequest { signup_grant: 0 })
        .send()
        .await
        .unwrap();
    client
        .post(format!("http://{addr}/users/1/earn"))
        .json(&EarnRequest {
            amount: 100,
            description: "bonus".to_owned(),
            source_type: ActionType::Earn,
        })
        .send()
        .await
        .unwrap();
    for key in ["req-1", "req-2"] {
        client
            .post(format!("http://{addr}/users/1/spend"))
            .json(&spend_body(20, key))
            .send()
            .await
            .unwrap();
    }

    let response = client
        .get(format!("http://{addr}/users/1/transactions"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();

    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 3);
    assert_eq!(body["summary"]["total_earned"], 100);
    assert_eq!(body["summary"]["total_spent"], 40);

    // Filtered by type
    let response = client
        .get(format!("http://{addr}/users/1/transactions?type=spend&limit=1"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn reward_grant_credits_user() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    client
        .post(format!("http://{addr}/users/7/register"))
        .json(&RegisterRequest { signup_grant: 0 })
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("http://{addr}/referral/grant-reward"))
        .json(&GrantRewardRequest {
            user_id: 7,
            reward_type: "friend_signup".to_owned(),
            value: 25,
            ttl_seconds: 3600,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["reward_id"].as_str().is_some_and(|id| !id.is_empty()));

    let response = client
        .get(format!("http://{addr}/users/7/balance"))
        .send()
        .await
        .unwrap();
    let body: BalanceResponse = response.json().await.unwrap();
    assert_eq!(body.balance, 25);
}

#[tokio::test]
async fn zero_ttl_reward_credits_nothing() {
    let (addr, _ledger) = spawn_server().await;
    let client = Client::new();

    client
        .post(format!("http://{addr}/users/7/register"))
        .json(&RegisterRequest { signup_grant: 0 })
        .send()
        .await
        .unwrap();

    let response = client
        .post(format!("http://{addr}/referral/grant-reward"))
        .json(&GrantRewardRequest {
            user_id: 7,
            reward_type: "friend_signup".to_owned(),
            value: 25,
            ttl_seconds: 0,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let response = client
        .get(format!("http://{addr}/users/7/balance"))
        .send()
        .await
        .unwrap();
    let body: BalanceResponse = response.json().await.unwrap();
    assert_eq!(body.balance, 0);
}

/// Hundreds of concurrent spend requests against one user: the admitted
/// subset must match the funds exactly, and the rest must be 402s.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_spends_account_exactly() {
    let (addr, ledger) = spawn_server().await;
    let client = Client::new();

    client
        .post(format!("http://{addr}/users/1/register"))
        .json(&RegisterRequest { signup_grant: 100 })
        .send()
        .await
        .unwrap();

    // 200 concurrent spends of 1 against a balance of 100
    let requests = (0..200).map(|i| {
        let client = client.clone();
        async move {
            let response = client
                .post(format!("http://{addr}/users/1/spend"))
                .json(&spend_body(1, &format!("req-{i}")))
                .send()
                .await
                .unwrap();
            response.status().as_u16()
        }
    });

    let statuses = join_all(requests).await;
    let ok = statuses.iter().filter(|s| **s == 200).count();
    let refused = statuses.iter().filter(|s| **s == 402).count();

    assert_eq!(ok, 100, "exactly the funded spends succeed");
    assert_eq!(refused, 100);
    assert_eq!(ledger.balance_of(UserId(1)), Ok(0));
    assert_eq!(ledger.reconciliation_drift(UserId(1)), Ok(0));
}
