//! Requests operators send to the aggregator.
//!
//! Requests are JSON objects naming a `method` and (if the method takes one) its `params`:
//!
//! ```json
//! {"method": "ProcessSignedResponse", "params": {"batch_index": 7, "operator": "0x..",
//!     "signature": "0x..", "verdict": true}}
//! {"method": "ServerRunning"}
//! ```
//!
//! Every reply is a single code.

use crate::types::Attestation;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// The attestation was accepted.
pub const ACCEPTED: u8 = 0;

/// The attestation was rejected (or could not be processed) and may be resent.
pub const REJECTED: u8 = 1;

/// Reply to [Request::ServerRunning].
pub const RUNNING: u8 = 1;

/// A call made by an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    ProcessSignedResponse(Attestation),
    ServerRunning,
}

/// Result of a [Request].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Status(u8),
    Running(u8),
}

impl Reply {
    pub fn code(&self) -> u8 {
        match self {
            Reply::Status(code) | Reply::Running(code) => *code,
        }
    }
}

/// Handles operator calls.
pub trait Service: Clone + Send + Sync + 'static {
    /// Processes an attestation, returning [ACCEPTED] or [REJECTED].
    fn process_signed_response(&self, attestation: Attestation) -> impl Future<Output = u8> + Send;
}

/// Routes `request` to `service`.
pub async fn dispatch<S: Service>(service: &S, request: Request) -> Reply {
    match request {
        Request::ProcessSignedResponse(attestation) => {
            Reply::Status(service.process_signed_response(attestation).await)
        }
        Request::ServerRunning => Reply::Running(RUNNING),
    }
}
