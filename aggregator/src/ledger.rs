//! Interfaces to the ledger that announces batches, stores the operator roster, and accepts
//! certificates.

use crate::{certificate::Certificate, roster::Roster, types::hex_serde, types::Batch};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use thiserror::Error;

/// Errors that can occur when interacting with the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("transport: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("batch already responded")]
    AlreadyResponded,
    #[error("quorum not met")]
    QuorumNotMet,
    #[error("malformed certificate: {0}")]
    MalformedCertificate(String),
}

impl Error {
    /// Returns true if retrying the same request cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::AlreadyResponded | Error::QuorumNotMet | Error::MalformedCertificate(_)
        )
    }
}

/// Inclusion proof of a submitted certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(with = "hex_serde")]
    pub transaction: [u8; 32],
    pub block: u64,
    pub gas_used: u64,
}

/// Reads operator and chain state.
pub trait Reader: Clone + Send + Sync + 'static {
    /// Returns the operators registered at `reference_block`.
    fn operator_roster(
        &self,
        reference_block: u64,
    ) -> impl Future<Output = Result<Roster, Error>> + Send;

    /// Returns the number of the latest block.
    fn current_block(&self) -> impl Future<Output = Result<u64, Error>> + Send;
}

/// Publishes certificates.
pub trait Writer: Clone + Send + Sync + 'static {
    /// Submits `certificate` for `batch` and waits for it to be included.
    fn submit_certificate(
        &self,
        batch: &Batch,
        certificate: &Certificate,
    ) -> impl Future<Output = Result<Receipt, Error>> + Send;
}

/// Streams newly created batches.
pub trait Subscriber: Send + 'static {
    type Events: Stream<Item = Result<Batch, Error>> + Send + Unpin;

    /// Streams every batch created at or after `from_block`.
    ///
    /// The stream ends (or yields an error) when the connection is lost.
    fn subscribe(
        &mut self,
        from_block: u64,
    ) -> impl Future<Output = Result<Self::Events, Error>> + Send;
}
