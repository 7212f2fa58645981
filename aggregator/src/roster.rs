//! Snapshot of the registered operator set at a reference block.

use crate::{bls::PublicKey, types::OperatorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors that can occur when assembling a [Roster].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("duplicate operator: {0}")]
    DuplicateOperator(OperatorId),
    #[error("duplicate public key for operator: {0}")]
    DuplicatePublicKey(OperatorId),
    #[error("total stake overflows")]
    StakeOverflow,
}

/// A registered operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: OperatorId,
    #[serde(with = "crate::types::hex_serde")]
    pub address: [u8; 20],
    pub stake: u128,
    pub public_key: PublicKey,
}

/// Operators registered at `reference_block`, sorted ascending by id.
///
/// An operator's index is its position in this order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Roster {
    reference_block: u64,
    operators: Vec<Operator>,
    total_stake: u128,
}

impl Roster {
    /// Creates a roster from an unordered list of operators.
    pub fn new(reference_block: u64, mut operators: Vec<Operator>) -> Result<Self, Error> {
        operators.sort_by(|a, b| a.id.cmp(&b.id));
        for pair in operators.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(Error::DuplicateOperator(pair[1].id));
            }
        }
        let mut keys = BTreeSet::new();
        let mut total_stake = 0u128;
        for operator in &operators {
            if !keys.insert(operator.public_key) {
                return Err(Error::DuplicatePublicKey(operator.id));
            }
            total_stake = total_stake
                .checked_add(operator.stake)
                .ok_or(Error::StakeOverflow)?;
        }
        Ok(Self {
            reference_block,
            operators,
            total_stake,
        })
    }

    pub fn reference_block(&self) -> u64 {
        self.reference_block
    }

    pub fn total_stake(&self) -> u128 {
        self.total_stake
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Returns the operators in index order.
    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    /// Returns the index and entry of `id`, if registered.
    pub fn get(&self, id: &OperatorId) -> Option<(u32, &Operator)> {
        let index = self
            .operators
            .binary_search_by(|operator| operator.id.cmp(id))
            .ok()?;
        Some((index as u32, &self.operators[index]))
    }
}
