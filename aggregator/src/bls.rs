//! BLS12-381 keys and signatures used for operator attestations.
//!
//! Thin wrappers over the min-pk variant of `commonware_cryptography` (public keys in G1,
//! signatures in G2) that add hex serde and the ordering the roster relies on. Every message is
//! signed under a namespace, so the same payload signed under two namespaces yields unrelated
//! signatures.
//!
//! # Warning
//!
//! Points decoded with [PublicKey::from_bytes] and [Signature::from_bytes] are checked to belong
//! to the correct subgroup (and not to be the identity). Aggregation assumes every operator key
//! was registered with a proof of possession by the ledger, which is what makes summing keys of
//! signers over a shared message safe against rogue-key attacks.

use crate::types::hex_serde;
use commonware_codec::{DecodeExt, Encode, FixedSize};
use commonware_cryptography::bls12381::primitives::{
    group::{self, G1, G2},
    ops,
    variant::MinPk,
};
use commonware_utils::hex;
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    fmt::{Debug, Display, Formatter},
    hash::{Hash, Hasher},
};
use thiserror::Error;

/// Length of a compressed public key.
pub const PUBLIC_KEY_LENGTH: usize = G1::SIZE;

/// Length of a compressed signature.
pub const SIGNATURE_LENGTH: usize = G2::SIZE;

/// Errors that can occur when decoding keys and signatures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Secret key of an operator.
#[derive(Clone)]
pub struct PrivateKey(group::Private);

impl PrivateKey {
    /// Generates a key from the provided randomness.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let (private, _) = ops::keypair::<_, MinPk>(rng);
        Self(private)
    }

    /// Deterministically derives a key from `seed` (for tests and local fixtures).
    pub fn from_seed(seed: u64) -> Self {
        Self::random(&mut StdRng::seed_from_u64(seed))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(ops::compute_public::<MinPk>(&self.0))
    }

    /// Signs `message` under `namespace`.
    pub fn sign(&self, namespace: &[u8], message: &[u8]) -> Signature {
        Signature(ops::sign_message::<MinPk>(&self.0, Some(namespace), message))
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Public key of an operator (a point in G1).
///
/// Compared and hashed by compressed encoding, which is unique per point.
#[derive(Clone, Copy)]
pub struct PublicKey(G1);

impl PublicKey {
    /// Decodes a compressed public key, performing a group check.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        G1::decode(bytes)
            .map(Self)
            .map_err(|err| Error::InvalidPublicKey(err.to_string()))
    }

    /// Returns the compressed encoding of the key.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.encode().to_vec()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.to_bytes()))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.to_bytes()))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_serde::serialize(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] = hex_serde::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Signature over a namespaced message (a point in G2).
#[derive(Clone, Copy)]
pub struct Signature(G2);

impl Signature {
    /// Decodes a compressed signature, performing a group check.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        G2::decode(bytes)
            .map(Self)
            .map_err(|err| Error::InvalidSignature(err.to_string()))
    }

    /// Returns the compressed encoding of the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.encode().to_vec()
    }

    /// Verifies the signature over `message` under `namespace` from `public_key`.
    pub fn verify(&self, public_key: &PublicKey, namespace: &[u8], message: &[u8]) -> bool {
        ops::verify_message::<MinPk>(&public_key.0, Some(namespace), message, &self.0).is_ok()
    }

    /// Verifies an aggregate signature over a single `message` from all `public_keys`.
    pub fn verify_aggregate<'a, I>(&self, public_keys: I, namespace: &[u8], message: &[u8]) -> bool
    where
        I: IntoIterator<Item = &'a PublicKey>,
    {
        let points: Vec<&G1> = public_keys.into_iter().map(|key| &key.0).collect();
        if points.is_empty() {
            return false;
        }
        ops::aggregate_verify_multiple_public_keys::<MinPk, _>(
            points,
            Some(namespace),
            message,
            &self.0,
        )
        .is_ok()
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Signature {}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.to_bytes()))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex_serde::serialize(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: [u8; SIGNATURE_LENGTH] = hex_serde::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Sums `signatures` into a single aggregate signature.
///
/// Returns `None` if no signatures are provided.
pub fn aggregate_signatures<'a, I>(signatures: I) -> Option<Signature>
where
    I: IntoIterator<Item = &'a Signature>,
{
    let points: Vec<&G2> = signatures.into_iter().map(|signature| &signature.0).collect();
    if points.is_empty() {
        return None;
    }
    Some(Signature(ops::aggregate_signatures::<MinPk, _>(points)))
}

/// Sums `public_keys` into a single aggregate public key.
///
/// Returns `None` if no keys are provided.
pub fn aggregate_public_keys<'a, I>(public_keys: I) -> Option<PublicKey>
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    let points: Vec<&G1> = public_keys.into_iter().map(|key| &key.0).collect();
    if points.is_empty() {
        return None;
    }
    Some(PublicKey(ops::aggregate_public_keys::<MinPk, _>(points)))
}
