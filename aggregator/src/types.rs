//! Batches, operator identities, and the attestations operators sign over them.

use crate::bls::{PrivateKey, PublicKey, Signature};
use commonware_utils::hex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Debug, Display, Formatter};

/// Namespace of attestations approving a batch (and of quorum certificates).
pub const NAMESPACE: &[u8] = b"_TALLY_BATCH";

/// Namespace of attestations rejecting a batch.
pub const DISSENT_NAMESPACE: &[u8] = b"_TALLY_BATCH_DISSENT";

/// Returns the namespace an attestation with `verdict` is signed under.
///
/// An attestation only verifies under the namespace of the verdict it carries.
pub fn namespace(verdict: bool) -> &'static [u8] {
    if verdict {
        NAMESPACE
    } else {
        DISSENT_NAMESPACE
    }
}

/// Hex encoding (with a `0x` prefix) of fixed-size byte arrays.
pub(crate) mod hex_serde {
    use commonware_utils::{from_hex_formatted, hex};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(
        value: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex(value.as_ref())))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = from_hex_formatted(&encoded).ok_or_else(|| D::Error::custom("invalid hex"))?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, got {len}")))
    }
}

/// Identity of an operator, as registered with the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(#[serde(with = "hex_serde")] pub [u8; 32]);

impl Debug for OperatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Display for OperatorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl From<[u8; 32]> for OperatorId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

/// A group of proofs awaiting certification, as announced by the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Ledger-assigned index (monotonically increasing).
    pub index: u64,

    /// Root of the merkle tree over the proofs in the batch.
    #[serde(with = "hex_serde")]
    pub merkle_root: [u8; 32],

    /// Account that submitted the batch.
    #[serde(with = "hex_serde")]
    pub sender: [u8; 20],

    /// Where the batch contents can be fetched.
    pub data_pointer: String,

    /// Maximum fee the sender pays for verification.
    pub fee_limit: u128,

    /// Block at which the batch was created (the roster reference block).
    pub created_at_block: u64,
}

impl Batch {
    /// Returns `sha256(merkle_root || sender)`.
    pub fn identifier(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.merkle_root);
        hasher.update(self.sender);
        hasher.finalize().into()
    }
}

/// An operator's signed claim about a batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub batch_index: u64,
    pub operator: OperatorId,
    pub signature: Signature,

    /// Whether the operator found every proof in the batch to be valid.
    pub verdict: bool,
}

impl Attestation {
    /// Signs the identifier of `batch` on behalf of `operator`, under the namespace of `verdict`.
    pub fn sign(
        private_key: &PrivateKey,
        operator: OperatorId,
        batch: &Batch,
        verdict: bool,
    ) -> Self {
        Self {
            batch_index: batch.index,
            operator,
            signature: private_key.sign(namespace(verdict), &batch.identifier()),
            verdict,
        }
    }

    /// Returns true if the attestation refers to `batch` and is signed by `public_key` with the
    /// verdict it carries.
    pub fn verify(&self, batch: &Batch, public_key: &PublicKey) -> bool {
        self.batch_index == batch.index
            && self
                .signature
                .verify(public_key, namespace(self.verdict), &batch.identifier())
    }
}
