// src/rpc.rs
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chain::ChainError;
use crate::node::Node;
use crate::types::{now_nanos, Address, Block, Transaction};

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
}

#[derive(Deserialize)]
struct SubmitTxReq {
    from: String,
    to: String,
    amount: u64,
    #[serde(default)]
    nonce: u64,
}

#[derive(Serialize)]
struct SubmitTxResp {
    tx_hash: String,
}

#[derive(Serialize)]
struct TipResp {
    height: u64,
    hash: String,
}

#[derive(Serialize)]
struct BalanceResp {
    address: String,
    balance: u64,
    nonce: u64,
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn bad_request(msg: impl ToString) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResp { error: msg.to_string() }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/tx", post(submit_tx))
        .route("/block/:height", get(get_block))
        .route("/balance/:addr", get(get_balance))
        .route("/tip", get(get_tip))
        .with_state(state)
}

/// Bind and serve the query/submit façade until the process exits.
pub async fn serve(state: AppState, listen_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("bind rpc listener on {listen_addr}"))?;
    info!(addr = %listener.local_addr()?, "rpc listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn submit_tx(
    State(state): State<AppState>,
    Json(req): Json<SubmitTxReq>,
) -> Result<Json<SubmitTxResp>, ApiError> {
    let from: Address = req.from.parse().map_err(bad_request)?;
    let to: Address = req.to.parse().map_err(bad_request)?;

    let tx = Transaction::new(from, to, req.amount, req.nonce, now_nanos());
    let hash = state.node.submit_transaction(tx).map_err(bad_request)?;
    Ok(Json(SubmitTxResp { tx_hash: hash.to_string() }))
}

async fn get_block(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> Result<Json<Block>, ApiError> {
    match state.node.get_block_by_height(height) {
        Ok(block) => Ok(Json(block)),
        Err(ChainError::BlockNotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResp { error: format!("no block at height {height}") }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResp { error: e.to_string() }),
        )),
    }
}

async fn get_balance(
    State(state): State<AppState>,
    Path(addr): Path<String>,
) -> Result<Json<BalanceResp>, ApiError> {
    let addr: Address = addr.parse().map_err(bad_request)?;
    let acct = state.node.get_account(addr).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResp { error: e.to_string() }),
        )
    })?;
    Ok(Json(BalanceResp {
        address: addr.to_string(),
        balance: acct.balance,
        nonce: acct.nonce,
    }))
}

async fn get_tip(State(state): State<AppState>) -> Json<TipResp> {
    let (height, hash) = state.node.tip();
    Json(TipResp { height, hash: hash.to_string() })
}
