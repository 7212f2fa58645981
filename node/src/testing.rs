//! In-process ledger gateway for tests.

use crate::gateway::{Batches, Height, Operators, Rejection, Submission, QUORUM_NOT_MET};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};
use tally_aggregator::{
    certificate::Invalid,
    ledger::Receipt,
    roster::{Operator, Roster},
    types::Batch,
};
use tokio::net::TcpListener;

struct Inner {
    operators: Vec<Operator>,
    threshold: u8,
    history: Vec<Batch>,
    certified: BTreeMap<u64, Receipt>,
    height: u64,
    roster_requests: Vec<u64>,
    unavailable: bool,
}

/// Serves the gateway endpoints from memory, verifying certificates against a fixed roster.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Deserialize)]
struct FromBlock {
    from_block: u64,
}

#[derive(Deserialize)]
struct AtBlock {
    block: u64,
}

impl Gateway {
    pub fn new(operators: Vec<Operator>, threshold: u8) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                operators,
                threshold,
                history: Vec::new(),
                certified: BTreeMap::new(),
                height: 0,
                roster_requests: Vec::new(),
                unavailable: false,
            })),
        }
    }

    pub fn publish(&self, batch: Batch) {
        self.inner.lock().unwrap().history.push(batch);
    }

    /// Answers every subsequent request with `503`.
    pub fn shutdown(&self) {
        self.inner.lock().unwrap().unavailable = true;
    }

    /// Sets the latest block (certificates are included in the blocks after it).
    pub fn set_height(&self, height: u64) {
        self.inner.lock().unwrap().height = height;
    }

    /// Blocks the roster was requested at.
    pub fn roster_requests(&self) -> Vec<u64> {
        self.inner.lock().unwrap().roster_requests.clone()
    }

    pub fn certified(&self) -> Vec<(u64, Receipt)> {
        self.inner
            .lock()
            .unwrap()
            .certified
            .iter()
            .map(|(index, receipt)| (*index, receipt.clone()))
            .collect()
    }

    /// Binds an ephemeral port and returns the base URL.
    pub async fn serve(&self) -> String {
        let app = Router::new()
            .route("/batches", get(batches))
            .route("/operators", get(operators))
            .route("/block", get(block))
            .route("/certificates", post(certificates))
            .with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{address}")
    }
}

async fn batches(State(gateway): State<Gateway>, Query(query): Query<FromBlock>) -> Response {
    let inner = gateway.inner.lock().unwrap();
    if inner.unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let batches = inner
        .history
        .iter()
        .filter(|batch| batch.created_at_block >= query.from_block)
        .cloned()
        .collect();
    Json(Batches { batches }).into_response()
}

async fn operators(State(gateway): State<Gateway>, Query(query): Query<AtBlock>) -> Response {
    let mut inner = gateway.inner.lock().unwrap();
    if inner.unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    inner.roster_requests.push(query.block);
    Json(Operators {
        operators: inner.operators.clone(),
    })
    .into_response()
}

async fn block(State(gateway): State<Gateway>) -> Response {
    let inner = gateway.inner.lock().unwrap();
    if inner.unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(Height {
        block: inner.height,
    })
    .into_response()
}

async fn certificates(
    State(gateway): State<Gateway>,
    Json(submission): Json<Submission>,
) -> Response {
    let mut inner = gateway.inner.lock().unwrap();
    if inner.unavailable {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let Submission { batch, certificate } = submission;
    if inner.certified.contains_key(&batch.index) {
        return StatusCode::CONFLICT.into_response();
    }
    let roster = match Roster::new(batch.created_at_block, inner.operators.clone()) {
        Ok(roster) => roster,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };
    if let Err(err) = certificate.verify(&batch, &roster, inner.threshold) {
        let error = match err {
            Invalid::QuorumNotMet => QUORUM_NOT_MET.to_string(),
            err => err.to_string(),
        };
        return (StatusCode::UNPROCESSABLE_ENTITY, Json(Rejection { error })).into_response();
    }
    inner.height += 1;
    let receipt = Receipt {
        transaction: certificate.identifier,
        block: inner.height,
        gas_used: 100_000,
    };
    inner.certified.insert(batch.index, receipt.clone());
    Json(receipt).into_response()
}
