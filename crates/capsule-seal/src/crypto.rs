//! Verification primitives behind the token layer
//!
//! The algorithm is never chosen by the token itself; it is derived from the
//! COSE type tag by the caller and the key must match it.

use ed25519_dalek::{Signature, Verifier};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{SealError, SealResult};
use crate::keys::Key;

/// Algorithms selectable through the COSE type dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// EdDSA over Curve25519 (COSE_Sign1)
    Ed25519,
    /// HMAC with SHA-256 (COSE_Mac0)
    HmacSha256,
    /// AES-128 in CBC mode (COSE_Encrypt0; selectable but not verifiable)
    Aes128Cbc,
    /// Plain SHA-256, used for section digests
    Sha256,
}

/// Verify an Ed25519 signature over `message`.
pub(crate) fn verify_signature(
    key: &Key,
    algo: Algorithm,
    message: &[u8],
    signature: &[u8],
) -> SealResult<()> {
    if algo != Algorithm::Ed25519 {
        return Err(SealError::UnsupportedAlgorithm(algo));
    }
    let Key::Ed25519(verifying_key) = key else {
        return Err(SealError::KeyMismatch(algo));
    };
    let signature = Signature::from_slice(signature).map_err(|_| SealError::BadSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| SealError::BadSignature)
}

/// Verify an HMAC-SHA-256 tag over `message`.
pub(crate) fn verify_mac(key: &Key, algo: Algorithm, message: &[u8], tag: &[u8]) -> SealResult<()> {
    if algo != Algorithm::HmacSha256 {
        return Err(SealError::UnsupportedAlgorithm(algo));
    }
    let Key::HmacSha256(secret) = key else {
        return Err(SealError::KeyMismatch(algo));
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SealError::BadMac)?;
    mac.update(message);
    mac.verify_slice(tag).map_err(|_| SealError::BadMac)
}

/// SHA-256 digest of `data`.
pub fn digest_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Recompute the digest of `data` and compare it against `expected`.
pub(crate) fn verify_digest(algo: Algorithm, data: &[u8], expected: &[u8]) -> SealResult<()> {
    if algo != Algorithm::Sha256 {
        return Err(SealError::UnsupportedAlgorithm(algo));
    }
    if digest_sha256(data).as_slice() == expected {
        Ok(())
    } else {
        Err(SealError::DigestMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    #[test]
    fn signature_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key = Key::Ed25519(signing_key.verifying_key());
        let message = b"claim set bytes";
        let signature = signing_key.sign(message);

        assert!(
            verify_signature(&key, Algorithm::Ed25519, message, &signature.to_bytes()).is_ok()
        );
    }

    #[test]
    fn flipped_signature_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let key = Key::Ed25519(signing_key.verifying_key());
        let message = b"claim set bytes";
        let mut signature = signing_key.sign(message).to_bytes();
        signature[17] ^= 0x01;

        assert!(matches!(
            verify_signature(&key, Algorithm::Ed25519, message, &signature),
            Err(SealError::BadSignature)
        ));
    }

    #[test]
    fn mac_roundtrip() {
        let secret = b"0123456789abcdef0123456789abcdef".to_vec();
        let key = Key::HmacSha256(secret.clone());
        let message = b"claim set bytes";

        let mut mac = Hmac::<Sha256>::new_from_slice(&secret).unwrap();
        mac.update(message);
        let tag = mac.finalize().into_bytes();

        assert!(verify_mac(&key, Algorithm::HmacSha256, message, &tag).is_ok());
        assert!(matches!(
            verify_mac(&key, Algorithm::HmacSha256, b"other message", &tag),
            Err(SealError::BadMac)
        ));
    }

    #[test]
    fn key_and_algorithm_must_agree() {
        let key = Key::HmacSha256(vec![0u8; 32]);
        assert!(matches!(
            verify_signature(&key, Algorithm::Ed25519, b"m", &[0u8; 64]),
            Err(SealError::KeyMismatch(Algorithm::Ed25519))
        ));
        assert!(matches!(
            verify_mac(&key, Algorithm::Aes128Cbc, b"m", &[0u8; 32]),
            Err(SealError::UnsupportedAlgorithm(Algorithm::Aes128Cbc))
        ));
    }

    #[test]
    fn digest_compare() {
        let data = b"section bytes";
        let digest = digest_sha256(data);
        assert!(verify_digest(Algorithm::Sha256, data, &digest).is_ok());
        assert!(matches!(
            verify_digest(Algorithm::Sha256, b"tampered", &digest),
            Err(SealError::DigestMismatch)
        ));
    }
}
