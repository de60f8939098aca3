//! Signed metadata envelopes for the Capsule supervisor
//!
//! A container image carries a CBOR envelope describing the guest (uid,
//! engine type, capability mask), its endpoints, and a security object with
//! per-section authentication tokens. This crate parses and re-encodes the
//! envelope, verifies the embedded CWT/COSE tokens, and holds the device
//! key-slot table.

pub mod builder;
pub mod crypto;
pub mod cwt;
pub mod envelope;
mod error;
pub mod keys;

pub use builder::{EnvelopeBuilder, TokenSigner};
pub use crypto::Algorithm;
pub use cwt::{Token, TokenKind, CLAIM_DIGEST, CLAIM_MASK};
pub use envelope::{
    endpoints_all, endpoints_search, endpoints_validate, ContainerInfo, Direction, Endpoint,
    Envelope, PeerType, Security, METADATA_TAG, UID_MAX,
};
pub use error::{SealError, SealResult};
pub use keys::{Key, KeyStore, DEVICE_KEY_SLOT, KEY_SLOTS};

use crypto::verify_digest;
use envelope::metadata_digest_coverage;

/// Verify a complete container image against `key`.
///
/// Checks all three authentication tokens: the metadata token (whose digest
/// covers the envelope minus the trailing token itself), then the data and
/// code tokens against the supplied section bytes.
pub fn verify_image(meta: &[u8], data: &[u8], code: &[u8], key: &Key) -> SealResult<()> {
    let parsed = Envelope::parse(meta)?;
    ContainerInfo::parse(parsed.container)?;
    endpoints_validate(parsed.endpoints)?;
    let security = Security::parse(parsed.security)?;

    let token = Token::parse(security.metadata_token)?;
    token.verify(key)?;
    let digest = token.digest_claim()?;
    let covered = metadata_digest_coverage(&parsed, &security)?;
    verify_digest(Algorithm::Sha256, &meta[..covered], &digest)?;

    for (token_bytes, section) in [(security.data_token, data), (security.code_token, code)] {
        let token = Token::parse(token_bytes)?;
        token.verify(key)?;
        let digest = token.digest_claim()?;
        verify_digest(Algorithm::Sha256, section, &digest)?;
    }

    Ok(())
}

/// Extract and verify the syscall capability mask from an envelope.
pub fn syscall_mask(meta: &[u8], key: &Key) -> SealResult<u32> {
    let parsed = Envelope::parse(meta)?;
    let container = ContainerInfo::parse(parsed.container)?;
    let token = Token::parse(container.syscall_mask_token)?;
    token.verify(key)?;
    token.mask_claim()
}

/// The container uid recorded in an envelope.
pub fn uid_of(meta: &[u8]) -> SealResult<Vec<u8>> {
    let parsed = Envelope::parse(meta)?;
    Ok(ContainerInfo::parse(parsed.container)?.uid.to_vec())
}

/// The engine discriminant recorded in an envelope.
pub fn runtime_type_of(meta: &[u8]) -> SealResult<u8> {
    let parsed = Envelope::parse(meta)?;
    Ok(ContainerInfo::parse(parsed.container)?.runtime_type)
}

/// The scheduling budgets recorded in an envelope.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub start_max_duration: u32,
    pub loop_period: u32,
    pub loop_max_duration: u32,
    pub loop_max_lifetime: u32,
    pub stop_max_duration: u32,
}

pub fn timing_of(meta: &[u8]) -> SealResult<Timing> {
    let parsed = Envelope::parse(meta)?;
    let security = Security::parse(parsed.security)?;
    Ok(Timing {
        start_max_duration: security.start_max_duration,
        loop_period: security.loop_period,
        loop_max_duration: security.loop_max_duration,
        loop_max_lifetime: security.loop_max_lifetime,
        stop_max_duration: security.stop_max_duration,
    })
}

/// Find an endpoint record by id in an envelope.
pub fn endpoint_of(meta: &[u8], endpoint_id: u32) -> SealResult<Option<Endpoint>> {
    let parsed = Envelope::parse(meta)?;
    endpoints_search(parsed.endpoints, endpoint_id)
}
