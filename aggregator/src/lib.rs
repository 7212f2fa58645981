//! Aggregate operator attestations into stake-weighted BLS quorum certificates.
//!
//! # Overview
//!
//! Operators independently verify each batch of proofs announced by the ledger and send back a
//! signed [Attestation](types::Attestation). The [Aggregator](aggregator::Aggregator) collects
//! these attestations and, as soon as operators holding at least `threshold` percent of the stake
//! registered at the batch's creation block have signed, aggregates their signatures into a
//! single [Certificate](certificate::Certificate) and submits it to the ledger. Each batch is
//! certified at most once, regardless of how many attestations arrive concurrently.
//!
//! # Architecture
//!
//! ```txt
//!           +------------+  register   +----------+  entry   +------------+
//! ledger -->| Subscriber |------------>| Registry |<---------| Aggregator |<-- operators (rpc)
//!           +------------+             +----------+          +------------+
//!                                                                  |
//!                                              evaluate + submit   v
//!                                                            +-----------+
//!                                                            | Submitter |--> ledger
//!                                                            +-----------+
//! ```
//!
//! Every interaction with the ledger (roster lookups and certificate submissions) is retried
//! with [tally_retry]. The subscription reconnects at a constant interval and replays missed
//! batches from the last block it observed.
//!
//! # Status
//!
//! `tally-aggregator` is **ALPHA** software and is not yet recommended for production use.
//! Developers should expect breaking changes and occasional instability.

pub mod aggregator;
pub mod bls;
pub mod certificate;
pub mod ledger;
pub mod mocks;
pub mod registry;
pub mod roster;
pub mod rpc;
pub mod submitter;
pub mod subscriber;
pub mod telemetry;
pub mod types;

pub use aggregator::{Aggregator, Config, Reason, Status};
