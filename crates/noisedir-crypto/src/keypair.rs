//! Long-term X25519 key pair for the directory server and its clients.
//!
//! The envelope codec authenticates the sender's long-term key inside the
//! encrypted header rather than with a separate signature, so a keypair here
//! is exchange-only: there is no signing half to carry.

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, thiserror::Error)]
pub enum KeyPairError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid hex encoding")]
    InvalidHex,
}

/// An X25519 static key pair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)] // StaticSecret zeroizes itself on drop
    secret: StaticSecret,
}

impl KeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Load a key pair from a 32-byte raw private scalar.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(*bytes),
        }
    }

    /// Parse a key pair from a 64-character lowercase hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyPairError> {
        let bytes = decode_key(hex_str)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// The public key corresponding to this secret.
    pub fn public(&self) -> [u8; 32] {
        *PublicKey::from(&self.secret).as_bytes()
    }

    /// Perform X25519 Diffie-Hellman against a peer's public key.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        *self.secret.diffie_hellman(&peer).as_bytes()
    }

    /// Access the raw static secret, for use by the envelope codec.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// Decode a 64-character hex public/private key into 32 raw bytes.
pub fn decode_key(hex_str: &str) -> Result<[u8; 32], KeyPairError> {
    if hex_str.len() != 64 {
        return Err(KeyPairError::InvalidKeyLength {
            expected: 64,
            got: hex_str.len(),
        });
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut out).map_err(|_| KeyPairError::InvalidHex)?;
    Ok(out)
}

/// Encode 32 raw bytes as a 64-character lowercase hex string.
pub fn encode_key(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_is_symmetric() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_shared = alice.diffie_hellman(&bob.public());
        let bob_shared = bob.diffie_hellman(&alice.public());

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn hex_round_trip() {
        let kp = KeyPair::generate();
        let encoded = encode_key(&kp.public());
        assert_eq!(encoded.len(), 64);
        let decoded = decode_key(&encoded).unwrap();
        assert_eq!(decoded, kp.public());
    }

    #[test]
    fn rejects_wrong_length_hex() {
        assert!(KeyPair::from_hex("abcd").is_err());
    }
}
