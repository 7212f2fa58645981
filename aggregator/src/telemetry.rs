//! Lifecycle traces of each batch.
//!
//! Implementations must not block: reporting is fire and forget and never affects
//! certification.

use crate::types::{Batch, OperatorId};

/// Receives batch lifecycle events.
pub trait Telemetry: Clone + Send + Sync + 'static {
    /// A batch was registered.
    fn trace_started(&self, batch: &Batch);

    /// An operator attestation was accepted for a batch.
    fn operator_responded(&self, batch: &Batch, operator: &OperatorId);

    /// A certificate was submitted for a batch.
    fn quorum_reached(&self, batch: &Batch);

    /// No further events are expected for a batch.
    fn trace_finished(&self, batch: &Batch);
}

/// Discards all events.
#[derive(Clone, Copy, Debug, Default)]
pub struct Noop;

impl Telemetry for Noop {
    fn trace_started(&self, _: &Batch) {}

    fn operator_responded(&self, _: &Batch, _: &OperatorId) {}

    fn quorum_reached(&self, _: &Batch) {}

    fn trace_finished(&self, _: &Batch) {}
}

impl<T: Telemetry> Telemetry for Option<T> {
    fn trace_started(&self, batch: &Batch) {
        if let Some(telemetry) = self {
            telemetry.trace_started(batch);
        }
    }

    fn operator_responded(&self, batch: &Batch, operator: &OperatorId) {
        if let Some(telemetry) = self {
            telemetry.operator_responded(batch, operator);
        }
    }

    fn quorum_reached(&self, batch: &Batch) {
        if let Some(telemetry) = self {
            telemetry.quorum_reached(batch);
        }
    }

    fn trace_finished(&self, batch: &Batch) {
        if let Some(telemetry) = self {
            telemetry.trace_finished(batch);
        }
    }
}
