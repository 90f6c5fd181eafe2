// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use digest::Digest;
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub const HASH_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

type Hasher = blake2::Blake2b<digest::consts::U32>;

/// 32-byte blake2b digest. Used for transaction essence digests, chain ids,
/// state root commitments and ED25519 addresses.
#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Default, Hash, Serialize, Deserialize)]
pub struct Hash32(pub [u8; HASH_SIZE]);

impl Hash32 {
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Hasher::default();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Hasher::default();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let bytes: [u8; HASH_SIZE] = data.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Address owning an output: blake2b digest of the ED25519 verification key.
pub type Address = Hash32;

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SignatureBytes(pub [u8; SIGNATURE_SIZE]);

impl Default for SignatureBytes {
    fn default() -> Self {
        Self([0; SIGNATURE_SIZE])
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}..", hex::encode(&self.0[..4]))
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let bytes: [u8; SIGNATURE_SIZE] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("signature must be 64 bytes"))?;
        Ok(Self(bytes))
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey(ed25519_consensus::VerificationKey);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Option<Self> {
        ed25519_consensus::VerificationKey::try_from(bytes)
            .ok()
            .map(Self)
    }

    pub fn to_bytes(&self) -> [u8; HASH_SIZE] {
        self.0.to_bytes()
    }

    /// The ledger address controlled by this key.
    pub fn address(&self) -> Address {
        Hash32::digest(&self.0.to_bytes())
    }

    pub fn verify(&self, signature: &SignatureBytes, message: &[u8]) -> bool {
        let signature = ed25519_consensus::Signature::from(signature.0);
        self.0.verify(&signature, message).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pk:{}..", hex::encode(&self.0.to_bytes()[..4]))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let bytes: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("public key must be 32 bytes"))?;
        Self::from_bytes(bytes).ok_or_else(|| de::Error::custom("malformed ED25519 point"))
    }
}

// Box ensures the key is not copied around in memory when the Signer moves.
pub struct Signer(Box<ed25519_consensus::SigningKey>);

impl Signer {
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(Box::new(ed25519_consensus::SigningKey::new(rng)))
    }

    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(&mut rng)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verification_key())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer({:?})", self.public_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let signer = Signer::from_seed(7);
        let message = b"some essence bytes";
        let signature = signer.sign(message);
        assert!(signer.public_key().verify(&signature, message));
        assert!(!signer.public_key().verify(&signature, b"other bytes"));
    }

    #[test]
    fn address_is_stable() {
        let signer = Signer::from_seed(7);
        assert_eq!(signer.address(), Signer::from_seed(7).address());
        assert_ne!(signer.address(), Signer::from_seed(8).address());
    }
}
