//! Serve the batch attestation aggregator over HTTP.
//!
//! The node wires [tally_aggregator] to the outside world:
//!
//! * [gateway] reads batches and rosters from a ledger gateway and submits certificates to it.
//! * [telemetry] reports batch traces to a collector.
//! * [server] accepts operator attestations and exposes metrics.
//!
//! The `tally-node` binary reads a [config::Config] from YAML and runs all of them on the
//! `tokio` runtime.

pub mod config;
pub mod gateway;
pub mod server;
pub mod telemetry;
#[cfg(test)]
mod testing;
