//! Test doubles for the ledger, telemetry, and registration.

use crate::{
    bls::PrivateKey,
    roster::{Operator, Roster},
    types::{Attestation, Batch, OperatorId},
};

mod ledger;
pub use ledger::{Ledger, Outcome};
mod registrar;
pub use registrar::Registrar;
mod telemetry;
pub use telemetry::{Event, Telemetry};

/// An operator that can sign attestations.
#[derive(Clone, Debug)]
pub struct Signer {
    pub id: OperatorId,
    pub key: PrivateKey,
    pub stake: u128,
}

impl Signer {
    /// Derives an operator (and its key) from `seed`.
    pub fn new(seed: u8, stake: u128) -> Self {
        Self {
            id: OperatorId([seed; 32]),
            key: PrivateKey::from_seed(seed as u64),
            stake,
        }
    }

    /// Returns the roster entry of the operator.
    pub fn operator(&self) -> Operator {
        Operator {
            id: self.id,
            address: [self.id.0[0]; 20],
            stake: self.stake,
            public_key: self.key.public_key(),
        }
    }

    /// Signs `batch`.
    pub fn attest(&self, batch: &Batch, verdict: bool) -> Attestation {
        Attestation::sign(&self.key, self.id, batch, verdict)
    }
}

/// Creates one operator per stake (seeded `1..`, so index `i` in the roster is `signers[i]`).
///
/// # Panics
///
/// Panics if more than 255 stakes are provided or their sum overflows.
pub fn roster(stakes: &[u128], reference_block: u64) -> (Vec<Signer>, Roster) {
    assert!(stakes.len() < u8::MAX as usize, "too many operators");
    let signers: Vec<_> = stakes
        .iter()
        .enumerate()
        .map(|(i, stake)| Signer::new(i as u8 + 1, *stake))
        .collect();
    let roster = Roster::new(
        reference_block,
        signers.iter().map(Signer::operator).collect(),
    )
    .expect("valid roster");
    (signers, roster)
}

/// Returns a batch with index `index`, created at block `100 + index`.
pub fn batch(index: u64) -> Batch {
    Batch {
        index,
        merkle_root: [index as u8; 32],
        sender: [0xaa; 20],
        data_pointer: format!("https://storage.example/batches/{index}"),
        fee_limit: 1_000_000_000,
        created_at_block: 100 + index,
    }
}
