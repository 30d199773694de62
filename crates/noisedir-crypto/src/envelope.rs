//! Anonymous sender-authenticated envelope codec ("noise box").
//!
//! Wire layout: `[ephemeral_pub(32)][encrypted_header(48)][encrypted_padded_body(>=20)]`.
//! Two key-agreement rounds derive independent header and body keys so that
//! only a holder of the receiver's long-term private key can recover the
//! sender's long-term public key, and in turn the message body.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand_core::{OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::kdf::kdf;

const SUITE_NAME: &[u8; 24] = b"Noise255/AES256-GCM\0\0\0\0\0";
const HEADER_CIPHERTEXT_LEN: usize = 48;
const EPHEMERAL_PUB_LEN: usize = 32;
const CHAIN_LEN: usize = 48;
const SYMM_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const MAC_LEN: usize = 16;
const PADDING_LEN_FIELD: usize = 4;
const MIN_BODY_CIPHERTEXT_LEN: usize = MAC_LEN + PADDING_LEN_FIELD;

/// Opaque decryption failure. Never distinguishes which step failed.
#[derive(Debug, thiserror::Error)]
#[error("envelope could not be opened")]
pub struct EnvelopeError;

type Round = ([u8; CHAIN_LEN], [u8; SYMM_KEY_LEN], [u8; NONCE_LEN]);

fn derive_round(secret: &[u8; 32], chain: &[u8], round: u8) -> Round {
    let mut info = SUITE_NAME.to_vec();
    info.push(round);
    let out = kdf(secret, chain, &info, CHAIN_LEN + SYMM_KEY_LEN + NONCE_LEN);

    let mut cv = [0u8; CHAIN_LEN];
    let mut key = [0u8; SYMM_KEY_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    cv.copy_from_slice(&out[0..CHAIN_LEN]);
    key.copy_from_slice(&out[CHAIN_LEN..CHAIN_LEN + SYMM_KEY_LEN]);
    nonce.copy_from_slice(&out[CHAIN_LEN + SYMM_KEY_LEN..]);
    (cv, key, nonce)
}

fn aead_encrypt(key: &[u8; 32], nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .expect("encryption with a fresh nonce does not fail")
}

fn aead_decrypt(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| EnvelopeError)
}

/// Seal `payload` so that only the holder of `receiver_pub`'s private key
/// can open it, authenticating `sender_secret`'s public key to them.
///
/// `padding_len` pads the body to obscure its true length; it contributes
/// `padding_len` extra bytes beyond the mandatory 4-byte length trailer.
pub fn envelope_seal(
    receiver_pub: &[u8; 32],
    sender_secret: &StaticSecret,
    payload: &[u8],
    padding_len: u32,
) -> Vec<u8> {
    let receiver_pub_key = PublicKey::from(*receiver_pub);
    let sender_pub = *PublicKey::from(sender_secret).as_bytes();

    let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = *PublicKey::from(&ephemeral_secret).as_bytes();

    let dh1 = *ephemeral_secret.diffie_hellman(&receiver_pub_key).as_bytes();
    let (cv1, k1, n1) = derive_round(&dh1, &[0u8; CHAIN_LEN], 0);

    let header_aad = [receiver_pub.as_slice(), &ephemeral_pub].concat();
    let encrypted_header = aead_encrypt(&k1, &n1, &header_aad, &sender_pub);
    debug_assert_eq!(encrypted_header.len(), HEADER_CIPHERTEXT_LEN);

    let dh2 = *sender_secret.diffie_hellman(&receiver_pub_key).as_bytes();
    let (_cv2, k2, n2) = derive_round(&dh2, &cv1, 1);

    let mut body_plain = Vec::with_capacity(payload.len() + padding_len as usize + PADDING_LEN_FIELD);
    body_plain.extend_from_slice(payload);
    body_plain.extend(std::iter::repeat(0u8).take(padding_len as usize));
    body_plain.extend_from_slice(&padding_len.to_be_bytes());

    let body_aad = [receiver_pub.as_slice(), &ephemeral_pub, &encrypted_header].concat();
    let encrypted_body = aead_encrypt(&k2, &n2, &body_aad, &body_plain);

    let mut out = Vec::with_capacity(EPHEMERAL_PUB_LEN + HEADER_CIPHERTEXT_LEN + encrypted_body.len());
    out.extend_from_slice(&ephemeral_pub);
    out.extend_from_slice(&encrypted_header);
    out.extend_from_slice(&encrypted_body);
    out
}

/// Decrypt an envelope addressed to `receiver_secret`, returning the
/// sender's long-term public key and the plaintext payload.
pub fn envelope_open(
    receiver_secret: &StaticSecret,
    envelope: &[u8],
) -> Result<([u8; 32], String), EnvelopeError> {
    if envelope.len() < EPHEMERAL_PUB_LEN + HEADER_CIPHERTEXT_LEN + MIN_BODY_CIPHERTEXT_LEN {
        return Err(EnvelopeError);
    }

    let receiver_pub = *PublicKey::from(receiver_secret).as_bytes();
    let ephemeral_pub_bytes: [u8; 32] = envelope[0..EPHEMERAL_PUB_LEN]
        .try_into()
        .map_err(|_| EnvelopeError)?;
    let encrypted_header = &envelope[EPHEMERAL_PUB_LEN..EPHEMERAL_PUB_LEN + HEADER_CIPHERTEXT_LEN];
    let encrypted_body = &envelope[EPHEMERAL_PUB_LEN + HEADER_CIPHERTEXT_LEN..];

    let ephemeral_pub = PublicKey::from(ephemeral_pub_bytes);
    let dh1 = *receiver_secret.diffie_hellman(&ephemeral_pub).as_bytes();
    let (cv1, k1, n1) = derive_round(&dh1, &[0u8; CHAIN_LEN], 0);

    let header_aad = [receiver_pub.as_slice(), ephemeral_pub_bytes.as_slice()].concat();
    let sender_pub_bytes = aead_decrypt(&k1, &n1, &header_aad, encrypted_header)?;
    let sender_pub: [u8; 32] = sender_pub_bytes.try_into().map_err(|_| EnvelopeError)?;

    let sender_pub_key = PublicKey::from(sender_pub);
    let dh2 = *receiver_secret.diffie_hellman(&sender_pub_key).as_bytes();
    let (_cv2, k2, n2) = derive_round(&dh2, &cv1, 1);

    let body_aad = [
        receiver_pub.as_slice(),
        ephemeral_pub_bytes.as_slice(),
        encrypted_header,
    ]
    .concat();
    let body_plain = aead_decrypt(&k2, &n2, &body_aad, encrypted_body)?;

    if body_plain.len() < PADDING_LEN_FIELD {
        return Err(EnvelopeError);
    }
    let split = body_plain.len() - PADDING_LEN_FIELD;
    let padding_len = u32::from_be_bytes(
        body_plain[split..]
            .try_into()
            .map_err(|_| EnvelopeError)?,
    ) as usize;
    let stripped = split.checked_sub(padding_len).ok_or(EnvelopeError)?;

    let body = String::from_utf8(body_plain[..stripped].to_vec()).map_err(|_| EnvelopeError)?;

    Ok((sender_pub, body))
}

/// Draw a fresh random padding length in `0..=max_extra` bytes.
pub fn random_padding_len(max_extra: u32) -> u32 {
    if max_extra == 0 {
        return 0;
    }
    OsRng.next_u32() % (max_extra + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_payload() {
        let receiver = StaticSecret::random_from_rng(OsRng);
        let receiver_pub = *PublicKey::from(&receiver).as_bytes();
        let sender = StaticSecret::random_from_rng(OsRng);
        let sender_pub = *PublicKey::from(&sender).as_bytes();

        let sealed = envelope_seal(&receiver_pub, &sender, b"orange submarine", 8);
        let (recovered_sender, payload) = envelope_open(&receiver, &sealed).unwrap();

        assert_eq!(recovered_sender, sender_pub);
        assert_eq!(payload, "orange submarine");
    }

    #[test]
    fn round_trips_empty_payload_with_no_padding() {
        let receiver = StaticSecret::random_from_rng(OsRng);
        let receiver_pub = *PublicKey::from(&receiver).as_bytes();
        let sender = StaticSecret::random_from_rng(OsRng);

        let sealed = envelope_seal(&receiver_pub, &sender, b"", 0);
        let (_, payload) = envelope_open(&receiver, &sealed).unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn wrong_receiver_key_fails_to_open() {
        let receiver = StaticSecret::random_from_rng(OsRng);
        let receiver_pub = *PublicKey::from(&receiver).as_bytes();
        let other = StaticSecret::random_from_rng(OsRng);
        let sender = StaticSecret::random_from_rng(OsRng);

        let sealed = envelope_seal(&receiver_pub, &sender, b"hello", 0);
        assert!(envelope_open(&other, &sealed).is_err());
    }

    #[test]
    fn single_byte_mutation_fails_to_open() {
        let receiver = StaticSecret::random_from_rng(OsRng);
        let receiver_pub = *PublicKey::from(&receiver).as_bytes();
        let sender = StaticSecret::random_from_rng(OsRng);

        let mut sealed = envelope_seal(&receiver_pub, &sender, b"hello world", 0);
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(envelope_open(&receiver, &sealed).is_err());
    }

    #[test]
    fn truncated_envelope_fails_to_open() {
        let receiver = StaticSecret::random_from_rng(OsRng);
        let receiver_pub = *PublicKey::from(&receiver).as_bytes();
        let sender = StaticSecret::random_from_rng(OsRng);

        let sealed = envelope_seal(&receiver_pub, &sender, b"hello world", 0);
        assert!(envelope_open(&receiver, &sealed[..sealed.len() - 5]).is_err());
    }

    #[test]
    fn too_short_input_is_rejected() {
        let receiver = StaticSecret::random_from_rng(OsRng);
        assert!(envelope_open(&receiver, &[0u8; 10]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn round_trips_any_payload_and_padding(
            payload in "\\PC*",
            padding_len in 0u32..256,
            flip_byte in proptest::prelude::any::<bool>(),
        ) {
            let receiver = StaticSecret::random_from_rng(OsRng);
            let receiver_pub = *PublicKey::from(&receiver).as_bytes();
            let sender = StaticSecret::random_from_rng(OsRng);
            let sender_pub = *PublicKey::from(&sender).as_bytes();

            let mut sealed = envelope_seal(&receiver_pub, &sender, payload.as_bytes(), padding_len);

            if flip_byte {
                let last = sealed.len() - 1;
                sealed[last] ^= 0x01;
                prop_assert!(envelope_open(&receiver, &sealed).is_err());
            } else {
                let (recovered_sender, recovered_payload) =
                    envelope_open(&receiver, &sealed).unwrap();
                prop_assert_eq!(recovered_sender, sender_pub);
                prop_assert_eq!(recovered_payload, payload);
            }
        }

        #[test]
        fn any_prefix_truncation_fails_to_open(
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
            drop_from_end in 1usize..32,
        ) {
            let receiver = StaticSecret::random_from_rng(OsRng);
            let receiver_pub = *PublicKey::from(&receiver).as_bytes();
            let sender = StaticSecret::random_from_rng(OsRng);

            let sealed = envelope_seal(&receiver_pub, &sender, &payload, 0);
            let cut = sealed.len().saturating_sub(drop_from_end);
            prop_assert!(envelope_open(&receiver, &sealed[..cut]).is_err());
        }

        #[test]
        fn non_utf8_body_is_rejected(
            invalid_suffix in proptest::collection::vec(0x80u8..0xC0, 1..16),
        ) {
            let receiver = StaticSecret::random_from_rng(OsRng);
            let receiver_pub = *PublicKey::from(&receiver).as_bytes();
            let sender = StaticSecret::random_from_rng(OsRng);

            // A lone continuation byte (0x80..0xC0) is never valid UTF-8 on
            // its own, so this payload can never decode successfully.
            let sealed = envelope_seal(&receiver_pub, &sender, &invalid_suffix, 0);
            prop_assert!(envelope_open(&receiver, &sealed).is_err());
        }
    }
}
