//! Ledger access through an HTTP/JSON gateway.
//!
//! The gateway exposes four endpoints:
//!
//! * `GET /batches?from_block=N` returns `{"batches": [..]}` with every batch created at or after
//!   block `N`.
//! * `GET /operators?block=N` returns `{"operators": [..]}` registered at block `N`.
//! * `GET /block` returns `{"block": N}` with the number of the latest block.
//! * `POST /certificates` accepts `{"batch": .., "certificate": ..}` and returns the receipt
//!   once the certificate is included. Rejections are reported with a status code:
//!   `409` if the batch was already responded to, `422` with `{"error": ..}` if the certificate
//!   was refused, and `400` if it could not be decoded.
//!
//! Subscriptions poll `/batches`, resuming from the newest block observed.

use crate::config;
use commonware_runtime::Clock;
use futures::{stream, Stream};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, pin::Pin, time::Duration};
use tally_aggregator::{
    certificate::Certificate,
    ledger::{self, Error, Receipt},
    roster::{Operator, Roster},
    types::Batch,
};
use tracing::debug;

/// Error reported by the gateway when a certificate lacks stake.
pub const QUORUM_NOT_MET: &str = "quorum_not_met";

#[derive(Serialize, Deserialize)]
pub struct Batches {
    pub batches: Vec<Batch>,
}

#[derive(Serialize, Deserialize)]
pub struct Operators {
    pub operators: Vec<Operator>,
}

#[derive(Serialize, Deserialize)]
pub struct Height {
    pub block: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Submission {
    pub batch: Batch,
    pub certificate: Certificate,
}

#[derive(Serialize, Deserialize)]
pub struct Rejection {
    pub error: String,
}

fn transport(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout;
    }
    Error::Transport(err.to_string())
}

/// Maps a failed certificate submission to a [ledger::Error].
pub fn classify(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::CONFLICT => Error::AlreadyResponded,
        StatusCode::UNPROCESSABLE_ENTITY => {
            let reason = serde_json::from_str::<Rejection>(body)
                .map(|rejection| rejection.error)
                .unwrap_or_else(|_| body.to_string());
            if reason == QUORUM_NOT_MET {
                Error::QuorumNotMet
            } else {
                Error::MalformedCertificate(reason)
            }
        }
        StatusCode::BAD_REQUEST => Error::MalformedCertificate(body.to_string()),
        status => Error::Transport(format!("unexpected status: {status}")),
    }
}

/// Client of the ledger gateway.
#[derive(Clone)]
pub struct Gateway<E: Clock> {
    context: E,
    client: Client,
    url: String,
    poll_interval: Duration,
}

impl<E: Clock> Gateway<E> {
    pub fn new(context: E, cfg: &config::Ledger) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        Ok(Self {
            context,
            client,
            url: cfg.url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
        })
    }

    async fn batches(&self, from_block: u64) -> Result<Vec<Batch>, Error> {
        let response = self
            .client
            .get(format!("{}/batches", self.url))
            .query(&[("from_block", from_block)])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(transport)?;
        let batches: Batches = response.json().await.map_err(transport)?;
        Ok(batches.batches)
    }
}

/// Batches fetched but not yet yielded.
struct Poll<E: Clock> {
    gateway: Gateway<E>,
    cursor: u64,
    last: Option<u64>,
    pending: VecDeque<Batch>,
    failed: bool,
}

impl<E: Clock> Poll<E> {
    fn absorb(&mut self, mut batches: Vec<Batch>) {
        batches.sort_by_key(|batch| batch.index);
        for batch in batches {
            if self.last.is_some_and(|last| batch.index <= last) {
                continue;
            }
            self.last = Some(batch.index);
            self.cursor = self.cursor.max(batch.created_at_block);
            self.pending.push_back(batch);
        }
    }
}

impl<E: Clock> ledger::Reader for Gateway<E> {
    async fn operator_roster(&self, reference_block: u64) -> Result<Roster, Error> {
        let response = self
            .client
            .get(format!("{}/operators", self.url))
            .query(&[("block", reference_block)])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(transport)?;
        let operators: Operators = response.json().await.map_err(transport)?;
        Roster::new(reference_block, operators.operators)
            .map_err(|err| Error::Transport(format!("invalid roster: {err}")))
    }

    async fn current_block(&self) -> Result<u64, Error> {
        let response = self
            .client
            .get(format!("{}/block", self.url))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(transport)?;
        let height: Height = response.json().await.map_err(transport)?;
        Ok(height.block)
    }
}

impl<E: Clock> ledger::Writer for Gateway<E> {
    async fn submit_certificate(
        &self,
        batch: &Batch,
        certificate: &Certificate,
    ) -> Result<Receipt, Error> {
        let submission = Submission {
            batch: batch.clone(),
            certificate: certificate.clone(),
        };
        let response = self
            .client
            .post(format!("{}/certificates", self.url))
            .json(&submission)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(transport);
        }
        let body = response.text().await.map_err(transport)?;
        Err(classify(status, &body))
    }
}

impl<E: Clock> ledger::Subscriber for Gateway<E> {
    type Events = Pin<Box<dyn Stream<Item = Result<Batch, Error>> + Send>>;

    async fn subscribe(&mut self, from_block: u64) -> Result<Self::Events, Error> {
        let mut poll = Poll {
            gateway: self.clone(),
            cursor: from_block,
            last: None,
            pending: VecDeque::new(),
            failed: false,
        };
        poll.absorb(self.batches(from_block).await?);
        Ok(Box::pin(stream::unfold(poll, |mut poll| async move {
            loop {
                if poll.failed {
                    return None;
                }
                if let Some(batch) = poll.pending.pop_front() {
                    return Some((Ok(batch), poll));
                }
                poll.gateway.context.sleep(poll.gateway.poll_interval).await;
                match poll.gateway.batches(poll.cursor).await {
                    Ok(batches) => {
                        debug!(cursor = poll.cursor, fetched = batches.len(), "polled batches");
                        poll.absorb(batches);
                    }
                    Err(err) => {
                        poll.failed = true;
                        return Some((Err(err), poll));
                    }
                }
            }
        })))
    }
}
