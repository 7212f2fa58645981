//! In-memory store of known batches and the attestations collected for each.
//!
//! Every batch has its own asynchronous lock. Holding an [Entry] gives exclusive access to a
//! batch's attestations and submission flag (so recording, evaluating, and submitting can be
//! linearized per batch) without blocking work on any other batch.

use crate::{
    roster::Roster,
    types::{Attestation, Batch, OperatorId},
};
use async_lock::{Mutex as AsyncMutex, MutexGuardArc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Errors that can occur when accessing the registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("task not found: {0}")]
    TaskNotFound(u64),
}

/// Result of recording an attestation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recorded {
    /// The attestation is the first from its operator.
    Added,
    /// The operator already attested (the earlier attestation is kept).
    Duplicate,
    /// The attestation was stored, but a certificate was already submitted.
    Submitted,
}

/// Attestation state of a single batch.
pub struct Responses {
    batch: Batch,
    attestations: BTreeMap<OperatorId, Attestation>,
    submitted: bool,
    roster: Option<Arc<Roster>>,
}

impl Responses {
    fn new(batch: Batch) -> Self {
        Self {
            batch,
            attestations: BTreeMap::new(),
            submitted: false,
            roster: None,
        }
    }
}

/// Exclusive access to the [Responses] of a batch.
pub struct Entry {
    guard: MutexGuardArc<Responses>,
}

impl Entry {
    pub fn batch(&self) -> &Batch {
        &self.guard.batch
    }

    /// Stores `attestation` unless its operator already attested.
    pub fn record(&mut self, attestation: Attestation) -> Recorded {
        if self.guard.attestations.contains_key(&attestation.operator) {
            return Recorded::Duplicate;
        }
        self.guard
            .attestations
            .insert(attestation.operator, attestation);
        if self.guard.submitted {
            return Recorded::Submitted;
        }
        Recorded::Added
    }

    /// Returns stored attestations, ordered by operator.
    pub fn attestations(&self) -> impl Iterator<Item = &Attestation> {
        self.guard.attestations.values()
    }

    pub fn len(&self) -> usize {
        self.guard.attestations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.attestations.is_empty()
    }

    pub fn is_submitted(&self) -> bool {
        self.guard.submitted
    }

    /// Records that a certificate was accepted by the ledger.
    ///
    /// Returns false if the batch was already marked.
    pub fn mark_submitted(&mut self) -> bool {
        if self.guard.submitted {
            return false;
        }
        self.guard.submitted = true;
        true
    }

    /// Returns the cached roster for the batch's reference block.
    pub fn roster(&self) -> Option<Arc<Roster>> {
        self.guard.roster.clone()
    }

    pub fn set_roster(&mut self, roster: Arc<Roster>) {
        self.guard.roster = Some(roster);
    }
}

/// Batches known to the aggregator.
///
/// Lock order is `tasks` then `responses`.
#[derive(Default)]
pub struct Registry {
    tasks: Mutex<BTreeMap<u64, Batch>>,
    responses: Mutex<HashMap<u64, Arc<AsyncMutex<Responses>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `batch` if its index is not yet known.
    ///
    /// Returns false (and leaves the existing batch untouched) on replay.
    pub fn register(&self, batch: Batch) -> bool {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&batch.index) {
            return false;
        }
        let mut responses = self.responses.lock().unwrap();
        responses.insert(batch.index, Arc::new(AsyncMutex::new(Responses::new(batch.clone()))));
        tasks.insert(batch.index, batch);
        true
    }

    pub fn get(&self, index: u64) -> Option<Batch> {
        let tasks = self.tasks.lock().unwrap();
        tasks.get(&index).cloned()
    }

    /// Returns the highest registered index.
    pub fn newest(&self) -> Option<u64> {
        let tasks = self.tasks.lock().unwrap();
        tasks.last_key_value().map(|(index, _)| *index)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for exclusive access to the responses of batch `index`.
    pub async fn entry(&self, index: u64) -> Result<Entry, Error> {
        let responses = {
            let responses = self.responses.lock().unwrap();
            responses
                .get(&index)
                .cloned()
                .ok_or(Error::TaskNotFound(index))?
        };
        Ok(Entry {
            guard: responses.lock_arc().await,
        })
    }

    /// Records `attestation` against the batch it refers to.
    pub async fn record_response(&self, attestation: Attestation) -> Result<Recorded, Error> {
        let mut entry = self.entry(attestation.batch_index).await?;
        Ok(entry.record(attestation))
    }

    /// Removes every batch with an index below `below`, returning how many were removed.
    ///
    /// Holders of an [Entry] for a removed batch keep exclusive access until they drop it.
    pub fn prune(&self, below: u64) -> usize {
        let mut tasks = self.tasks.lock().unwrap();
        let kept = tasks.split_off(&below);
        let removed = std::mem::replace(&mut *tasks, kept);
        let mut responses = self.responses.lock().unwrap();
        for index in removed.keys() {
            responses.remove(index);
        }
        removed.len()
    }
}
