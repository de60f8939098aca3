//! Provisioning-side construction of signed envelopes
//!
//! The metadata token covers the envelope bytes minus the trailing token
//! itself. The builder first signs a placeholder token to learn its encoded
//! length, digests everything before it, then splices in the real token of
//! identical length.

use std::convert::Infallible;

use ed25519_dalek::{Signer as _, SigningKey};
use hmac::{Hmac, Mac};
use minicbor::data::Tag;
use minicbor::Encoder;
use sha2::Sha256;

use crate::crypto::digest_sha256;
use crate::cwt::{CLAIM_DIGEST, CLAIM_MASK};
use crate::envelope::{
    bstr_wire_len, encode_container, encode_endpoints, encode_envelope, encode_security, Endpoint,
    Security,
};
use crate::error::{SealError, SealResult};

const TAG_COSE_MAC0: u64 = 17;
const TAG_COSE_SIGN1: u64 = 18;

type EncodeError = minicbor::encode::Error<Infallible>;

fn encode_failed(error: EncodeError) -> SealError {
    SealError::Encode(error.to_string())
}

/// Signing-side counterpart of [`crate::keys::Key`].
pub enum TokenSigner {
    Ed25519(SigningKey),
    HmacSha256(Vec<u8>),
}

/// Produce a COSE_Sign1 or COSE_Mac0 token over a claim map.
pub fn sign_token(signer: &TokenSigner, claims: &[u8]) -> SealResult<Vec<u8>> {
    let (type_tag, security) = match signer {
        TokenSigner::Ed25519(key) => (TAG_COSE_SIGN1, key.sign(claims).to_bytes().to_vec()),
        TokenSigner::HmacSha256(secret) => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .map_err(|e| SealError::Encode(e.to_string()))?;
            mac.update(claims);
            (TAG_COSE_MAC0, mac.finalize().into_bytes().to_vec())
        }
    };

    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.tag(Tag::new(type_tag))?;
        encoder.array(4)?;
        encoder.bytes(&[])?;
        encoder.map(0)?;
        encoder.bytes(claims)?;
        encoder.bytes(&security)?;
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

fn digest_claims(digest: &[u8; 32]) -> SealResult<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.map(1)?;
        encoder.i64(CLAIM_DIGEST)?.bytes(digest)?;
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

fn mask_claims(mask: u32) -> SealResult<Vec<u8>> {
    // minimal big-endian encoding; an empty string decodes to zero
    let bytes = mask.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());

    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.map(1)?;
        encoder.i64(CLAIM_MASK)?.bytes(&bytes[first..])?;
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

/// Builder for a complete signed metadata envelope.
pub struct EnvelopeBuilder {
    uid: Vec<u8>,
    runtime_type: u8,
    endpoints: Vec<Endpoint>,
    syscall_mask: u32,
    start_max_duration: u32,
    loop_period: u32,
    loop_max_duration: u32,
    loop_max_lifetime: u32,
    stop_max_duration: u32,
}

impl EnvelopeBuilder {
    pub fn new(uid: impl Into<Vec<u8>>, runtime_type: u8) -> Self {
        Self {
            uid: uid.into(),
            runtime_type,
            endpoints: Vec::new(),
            syscall_mask: 0b11111,
            start_max_duration: 0,
            loop_period: 1000,
            loop_max_duration: 0,
            loop_max_lifetime: 0,
            stop_max_duration: 0,
        }
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn syscall_mask(mut self, mask: u32) -> Self {
        self.syscall_mask = mask;
        self
    }

    pub fn loop_period(mut self, ms: u32) -> Self {
        self.loop_period = ms;
        self
    }

    pub fn loop_max_duration(mut self, ms: u32) -> Self {
        self.loop_max_duration = ms;
        self
    }

    pub fn loop_max_lifetime(mut self, invocations: u32) -> Self {
        self.loop_max_lifetime = invocations;
        self
    }

    pub fn start_max_duration(mut self, ms: u32) -> Self {
        self.start_max_duration = ms;
        self
    }

    pub fn stop_max_duration(mut self, ms: u32) -> Self {
        self.stop_max_duration = ms;
        self
    }

    /// Build the envelope for the given section contents, signing every
    /// token with `signer`.
    pub fn build(&self, signer: &TokenSigner, data: &[u8], code: &[u8]) -> SealResult<Vec<u8>> {
        let mask_token = sign_token(signer, &mask_claims(self.syscall_mask)?)?;
        let container = encode_container(&self.uid, self.runtime_type, &mask_token)?;
        let endpoints = encode_endpoints(&self.endpoints)?;

        let data_token = sign_token(signer, &digest_claims(&digest_sha256(data))?)?;
        let code_token = sign_token(signer, &digest_claims(&digest_sha256(code))?)?;
        let placeholder = sign_token(signer, &digest_claims(&[0u8; 32])?)?;

        let security = Security {
            start_max_duration: self.start_max_duration,
            loop_period: self.loop_period,
            loop_max_duration: self.loop_max_duration,
            loop_max_lifetime: self.loop_max_lifetime,
            stop_max_duration: self.stop_max_duration,
            data_token: &data_token,
            code_token: &code_token,
            metadata_token: &placeholder,
        };
        let security_bytes = encode_security(&security)?;
        let mut envelope = encode_envelope(&container, &endpoints, &security_bytes)?;

        let covered = envelope.len() - bstr_wire_len(placeholder.len());
        let digest = digest_sha256(&envelope[..covered]);
        let metadata_token = sign_token(signer, &digest_claims(&digest)?)?;
        if metadata_token.len() != placeholder.len() {
            return Err(SealError::Encode("metadata token length drifted".into()));
        }

        let splice_at = envelope.len() - metadata_token.len();
        envelope[splice_at..].copy_from_slice(&metadata_token);
        Ok(envelope)
    }
}
