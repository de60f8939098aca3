//! Error types for envelope parsing and token verification

use thiserror::Error;

use crate::crypto::Algorithm;

/// Errors raised while parsing or verifying container metadata
#[derive(Debug, Error)]
pub enum SealError {
    /// Malformed CBOR input
    #[error("malformed CBOR: {0}")]
    Decode(#[from] minicbor::decode::Error),

    /// Structurally valid CBOR that does not match the envelope schema
    #[error("invalid envelope structure: {0}")]
    InvalidStructure(&'static str),

    /// A map carried a key the schema does not define
    #[error("unknown map key: {0}")]
    UnknownKey(i64),

    /// A required field was absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// An enum discriminant was outside its defined range
    #[error("value out of range for {field}: {value}")]
    OutOfRange { field: &'static str, value: u64 },

    /// Multi-recipient COSE forms (SIGN, MAC, ENCRYPT) are not supported
    #[error("unsupported token form")]
    UnsupportedTokenForm,

    /// The selected algorithm cannot be used for verification
    #[error("unsupported algorithm: {0:?}")]
    UnsupportedAlgorithm(Algorithm),

    /// The key slot holds no key
    #[error("key slot {0} is empty")]
    NoSuchKey(usize),

    /// Key slot index outside the table
    #[error("key slot {0} out of range")]
    KeySlotOutOfRange(usize),

    /// The key in the slot cannot verify under the selected algorithm
    #[error("key cannot verify {0:?}")]
    KeyMismatch(Algorithm),

    /// Signature verification failed
    #[error("signature verification failed")]
    BadSignature,

    /// MAC verification failed
    #[error("MAC verification failed")]
    BadMac,

    /// Recomputed section digest does not match the token claim
    #[error("section digest mismatch")]
    DigestMismatch,

    /// Envelope encoding failed
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Result type for seal operations
pub type SealResult<T> = Result<T, SealError>;
