//! Stake-weighted quorum certificates over a batch.
//!
//! [evaluate] verifies each attestation against the [Roster] snapshot taken at the batch's
//! creation block, sums the stake of operators that signed a positive verdict, and (once
//! `signed_stake * 100 >= total_stake * threshold`) aggregates their signatures into a
//! [Certificate].
//!
//! A certificate names the operators that did _not_ sign rather than the ones that did. The
//! ledger already knows the aggregate key of the whole roster, so it can recover the signers'
//! key by subtracting the (usually few) non-signers and check the aggregate signature against
//! it. [Certificate::verify] performs the same check off-chain.

use crate::{
    bls::{self, PublicKey, Signature},
    roster::Roster,
    types::{hex_serde, namespace, Attestation, Batch, OperatorId, NAMESPACE},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Errors that prevent an evaluation from running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid threshold: {0}")]
    InvalidThreshold(u8),
    #[error("empty roster")]
    EmptyRoster,
    #[error("roster has zero stake")]
    ZeroStake,
    #[error("aggregation failed")]
    Aggregation,
}

/// Reasons a [Certificate] does not attest to a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Invalid {
    #[error("certificate is for a different batch")]
    WrongBatch,
    #[error("certificate references block {0}")]
    WrongReferenceBlock(u64),
    #[error("non-signers are not strictly ascending")]
    Unordered,
    #[error("non-signer does not match roster")]
    NonSignerMismatch,
    #[error("signer bitmap does not match non-signers")]
    BitmapMismatch,
    #[error("stake does not match roster")]
    StakeMismatch,
    #[error("quorum public key does not match roster")]
    QuorumKeyMismatch,
    #[error("signer public key does not match roster")]
    SignerKeyMismatch,
    #[error("quorum not met")]
    QuorumNotMet,
    #[error("invalid aggregate signature")]
    InvalidSignature,
}

/// Why an attestation was left out of an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// The attestation refers to another batch.
    WrongBatch,
    /// The operator is not in the roster.
    UnknownOperator,
    /// The signature does not verify against the operator's roster key.
    InvalidSignature,
    /// The operator already contributed an attestation.
    Duplicate,
    /// The operator signed, but reported the batch as invalid.
    Dissent,
}

/// Proof that a quorum of stake attested to a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub batch_index: u64,
    #[serde(with = "hex_serde")]
    pub identifier: [u8; 32],
    pub reference_block: u64,

    /// Aggregate of all counted signatures.
    pub signature: Signature,

    /// Aggregate public key of the signers.
    pub signers_public_key: PublicKey,

    /// Aggregate public key of the entire roster.
    pub quorum_public_key: PublicKey,

    /// Operators that did not sign, ascending by roster index.
    pub non_signers: Vec<OperatorId>,
    pub non_signer_indices: Vec<u32>,
    pub non_signer_public_keys: Vec<PublicKey>,

    /// Bit `i` (least significant first) is set if the operator at roster index `i` signed.
    pub signer_bitmap: Vec<u8>,

    pub signed_stake: u128,
    pub total_stake: u128,
}

/// Outcome of [evaluate].
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Present once the quorum threshold is met.
    pub certificate: Option<Certificate>,
    pub signed_stake: u128,
    pub total_stake: u128,
    pub rejected: Vec<(OperatorId, Rejection)>,
}

/// Returns true if `signed` out of `total` meets `threshold` percent.
///
/// Equivalent to `signed * 100 >= total * threshold` without overflowing.
pub fn quorum(signed: u128, total: u128, threshold: u8) -> bool {
    let threshold = threshold as u128;
    let required = (total / 100) * threshold + ((total % 100) * threshold).div_ceil(100);
    signed >= required
}

fn bitmap(len: usize, signed: impl Fn(usize) -> bool) -> Vec<u8> {
    let mut bitmap = vec![0u8; len.div_ceil(8)];
    for index in 0..len {
        if signed(index) {
            bitmap[index / 8] |= 1 << (index % 8);
        }
    }
    bitmap
}

/// Determines whether `attestations` reach `threshold` percent of the stake in `roster` and, if
/// so, produces a [Certificate].
///
/// Invalid attestations never fail an evaluation. They are skipped and reported in
/// [Evaluation::rejected].
pub fn evaluate<'a, I>(
    batch: &Batch,
    attestations: I,
    roster: &Roster,
    threshold: u8,
) -> Result<Evaluation, Error>
where
    I: IntoIterator<Item = &'a Attestation>,
{
    tally(batch, attestations, roster, threshold, true)
}

/// Like [evaluate], but trusts that every attestation already passed [Attestation::verify]
/// against its operator's key in `roster`.
///
/// Signatures are only checked again in aggregate, when the resulting [Certificate] is verified.
pub fn evaluate_verified<'a, I>(
    batch: &Batch,
    attestations: I,
    roster: &Roster,
    threshold: u8,
) -> Result<Evaluation, Error>
where
    I: IntoIterator<Item = &'a Attestation>,
{
    tally(batch, attestations, roster, threshold, false)
}

fn tally<'a, I>(
    batch: &Batch,
    attestations: I,
    roster: &Roster,
    threshold: u8,
    check_signatures: bool,
) -> Result<Evaluation, Error>
where
    I: IntoIterator<Item = &'a Attestation>,
{
    if threshold == 0 || threshold > 100 {
        return Err(Error::InvalidThreshold(threshold));
    }
    if roster.is_empty() {
        return Err(Error::EmptyRoster);
    }
    let total_stake = roster.total_stake();
    if total_stake == 0 {
        return Err(Error::ZeroStake);
    }

    // Verify each attestation
    let identifier = batch.identifier();
    let mut signers = BTreeMap::new();
    let mut dissenters = BTreeSet::new();
    let mut rejected = Vec::new();
    for attestation in attestations {
        let operator = attestation.operator;
        if attestation.batch_index != batch.index {
            rejected.push((operator, Rejection::WrongBatch));
            continue;
        }
        let Some((index, entry)) = roster.get(&operator) else {
            rejected.push((operator, Rejection::UnknownOperator));
            continue;
        };
        if signers.contains_key(&index) || dissenters.contains(&index) {
            rejected.push((operator, Rejection::Duplicate));
            continue;
        }
        if check_signatures
            && !attestation.signature.verify(
                &entry.public_key,
                namespace(attestation.verdict),
                &identifier,
            )
        {
            debug!(index = batch.index, %operator, "invalid signature");
            rejected.push((operator, Rejection::InvalidSignature));
            continue;
        }
        if !attestation.verdict {
            dissenters.insert(index);
            rejected.push((operator, Rejection::Dissent));
            continue;
        }
        signers.insert(index, (entry, attestation.signature));
    }
    let signed_stake: u128 = signers.values().map(|(entry, _)| entry.stake).sum();
    if signers.is_empty() || !quorum(signed_stake, total_stake, threshold) {
        return Ok(Evaluation {
            certificate: None,
            signed_stake,
            total_stake,
            rejected,
        });
    }

    // Aggregate
    let signature = bls::aggregate_signatures(signers.values().map(|(_, signature)| signature))
        .ok_or(Error::Aggregation)?;
    let signers_public_key =
        bls::aggregate_public_keys(signers.values().map(|(entry, _)| &entry.public_key))
            .ok_or(Error::Aggregation)?;
    let quorum_public_key =
        bls::aggregate_public_keys(roster.operators().iter().map(|entry| &entry.public_key))
            .ok_or(Error::Aggregation)?;
    let mut non_signers = Vec::new();
    let mut non_signer_indices = Vec::new();
    let mut non_signer_public_keys = Vec::new();
    for (index, entry) in roster.operators().iter().enumerate() {
        let index = index as u32;
        if signers.contains_key(&index) {
            continue;
        }
        non_signers.push(entry.id);
        non_signer_indices.push(index);
        non_signer_public_keys.push(entry.public_key);
    }
    let signer_bitmap = bitmap(roster.len(), |index| signers.contains_key(&(index as u32)));
    Ok(Evaluation {
        certificate: Some(Certificate {
            batch_index: batch.index,
            identifier: batch.identifier(),
            reference_block: roster.reference_block(),
            signature,
            signers_public_key,
            quorum_public_key,
            non_signers,
            non_signer_indices,
            non_signer_public_keys,
            signer_bitmap,
            signed_stake,
            total_stake,
        }),
        signed_stake,
        total_stake,
        rejected,
    })
}

impl Certificate {
    /// Checks that the certificate attests to `batch` with at least `threshold` percent of the
    /// stake in `roster`.
    pub fn verify(&self, batch: &Batch, roster: &Roster, threshold: u8) -> Result<(), Invalid> {
        if self.batch_index != batch.index || self.identifier != batch.identifier() {
            return Err(Invalid::WrongBatch);
        }
        if self.reference_block != roster.reference_block() {
            return Err(Invalid::WrongReferenceBlock(self.reference_block));
        }
        if self.total_stake != roster.total_stake() {
            return Err(Invalid::StakeMismatch);
        }
        let quorum_public_key =
            bls::aggregate_public_keys(roster.operators().iter().map(|entry| &entry.public_key));
        if quorum_public_key != Some(self.quorum_public_key) {
            return Err(Invalid::QuorumKeyMismatch);
        }

        // Check non-signers against the roster
        if self.non_signers.len() != self.non_signer_indices.len()
            || self.non_signers.len() != self.non_signer_public_keys.len()
        {
            return Err(Invalid::NonSignerMismatch);
        }
        if self
            .non_signer_indices
            .windows(2)
            .any(|pair| pair[0] >= pair[1])
        {
            return Err(Invalid::Unordered);
        }
        for ((id, index), public_key) in self
            .non_signers
            .iter()
            .zip(&self.non_signer_indices)
            .zip(&self.non_signer_public_keys)
        {
            let entry = roster
                .operators()
                .get(*index as usize)
                .ok_or(Invalid::NonSignerMismatch)?;
            if entry.id != *id || entry.public_key != *public_key {
                return Err(Invalid::NonSignerMismatch);
            }
        }
        let absent: BTreeSet<u32> = self.non_signer_indices.iter().copied().collect();
        if self.signer_bitmap != bitmap(roster.len(), |index| !absent.contains(&(index as u32))) {
            return Err(Invalid::BitmapMismatch);
        }

        // Derive the signers from the roster
        let signers: Vec<_> = roster
            .operators()
            .iter()
            .enumerate()
            .filter(|(index, _)| !absent.contains(&(*index as u32)))
            .map(|(_, entry)| entry)
            .collect();
        let signed_stake: u128 = signers.iter().map(|entry| entry.stake).sum();
        if signed_stake != self.signed_stake {
            return Err(Invalid::StakeMismatch);
        }
        if signers.is_empty() || !quorum(signed_stake, self.total_stake, threshold) {
            return Err(Invalid::QuorumNotMet);
        }
        let signers_public_key =
            bls::aggregate_public_keys(signers.iter().map(|entry| &entry.public_key));
        if signers_public_key != Some(self.signers_public_key) {
            return Err(Invalid::SignerKeyMismatch);
        }
        if !self
            .signature
            .verify(&self.signers_public_key, NAMESPACE, &batch.identifier())
        {
            return Err(Invalid::InvalidSignature);
        }
        Ok(())
    }
}
