//! CWT / COSE token parsing and verification
//!
//! Tokens are COSE single-recipient objects (RFC 8152) whose payload is a
//! CBOR claim map. The COSE headers must be empty: the verification
//! algorithm is derived from the COSE type tag alone, never negotiated.

use minicbor::data::{Tag, Type};
use minicbor::Decoder;
use tracing::warn;

use crate::crypto::{self, Algorithm};
use crate::error::{SealError, SealResult};
use crate::keys::Key;

/// Claim key carrying a SHA-256 digest of a container section.
pub const CLAIM_DIGEST: i64 = -65536;

/// Claim key carrying the syscall capability bitmask.
pub const CLAIM_MASK: i64 = -65537;

const TAG_CWT: u64 = 61;
const TAG_COSE_ENCRYPT0: u64 = 16;
const TAG_COSE_MAC0: u64 = 17;
const TAG_COSE_SIGN1: u64 = 18;
const TAG_COSE_ENCRYPT: u64 = 96;
const TAG_COSE_MAC: u64 = 97;
const TAG_COSE_SIGN: u64 = 98;

/// COSE form of a token, from its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// No COSE tag; treated as Sign1 for verification
    Untagged,
    Sign1,
    Mac0,
    Encrypt0,
    /// Multi-recipient forms, parsed but never verifiable
    Sign,
    Mac,
    Encrypt,
}

/// A parsed authentication token.
#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub kind: TokenKind,
    /// Raw claim map bytes (the COSE payload)
    pub claim_set: &'a [u8],
    /// Signature or authentication tag
    pub security: &'a [u8],
}

fn kind_from_tag(tag: Tag) -> SealResult<TokenKind> {
    if tag == Tag::new(TAG_COSE_ENCRYPT0) {
        Ok(TokenKind::Encrypt0)
    } else if tag == Tag::new(TAG_COSE_MAC0) {
        Ok(TokenKind::Mac0)
    } else if tag == Tag::new(TAG_COSE_SIGN1) {
        Ok(TokenKind::Sign1)
    } else if tag == Tag::new(TAG_COSE_ENCRYPT) {
        Ok(TokenKind::Encrypt)
    } else if tag == Tag::new(TAG_COSE_MAC) {
        Ok(TokenKind::Mac)
    } else if tag == Tag::new(TAG_COSE_SIGN) {
        Ok(TokenKind::Sign)
    } else {
        Err(SealError::InvalidStructure("unexpected tag on token"))
    }
}

impl<'a> Token<'a> {
    /// Parse a token, with or without its CWT and COSE tags.
    ///
    /// An outer CWT tag (61) makes the COSE type tag mandatory; a bare COSE
    /// array is accepted and defaults to Sign1 at verification time.
    pub fn parse(bytes: &'a [u8]) -> SealResult<Token<'a>> {
        let mut decoder = Decoder::new(bytes);

        let mut kind = TokenKind::Untagged;
        let mut untagged_allowed = true;

        if decoder.datatype()? == Type::Tag {
            let tag = decoder.tag()?;
            if tag == Tag::new(TAG_CWT) {
                untagged_allowed = false;
            } else {
                kind = kind_from_tag(tag)?;
            }
        }

        if kind == TokenKind::Untagged {
            if decoder.datatype()? == Type::Tag {
                kind = kind_from_tag(decoder.tag()?)?;
            } else if !untagged_allowed {
                return Err(SealError::InvalidStructure("CWT tag without COSE tag"));
            }
        }

        let len = decoder
            .array()?
            .ok_or(SealError::InvalidStructure("indefinite COSE array"))?;
        if len != 4 {
            return Err(SealError::InvalidStructure("COSE array length"));
        }

        // protected headers: an empty byte string
        if !decoder.bytes()?.is_empty() {
            return Err(SealError::InvalidStructure("non-empty protected header"));
        }

        // unprotected headers: an empty map
        let unprotected = decoder
            .map()?
            .ok_or(SealError::InvalidStructure("indefinite header map"))?;
        if unprotected != 0 {
            return Err(SealError::InvalidStructure("non-empty unprotected header"));
        }

        // payload: the claim map, or nil
        let claim_set = match decoder.datatype()? {
            Type::Bytes => decoder.bytes()?,
            Type::Null => {
                decoder.null()?;
                &[]
            }
            _ => return Err(SealError::InvalidStructure("token payload")),
        };

        // signature or authentication tag
        let security = match decoder.datatype()? {
            Type::Bytes => decoder.bytes()?,
            Type::Null if kind == TokenKind::Encrypt0 => {
                decoder.null()?;
                &[]
            }
            _ => return Err(SealError::InvalidStructure("token security value")),
        };

        Ok(Token {
            kind,
            claim_set,
            security,
        })
    }

    /// The verification algorithm implied by the COSE type.
    pub fn algorithm(&self) -> SealResult<Algorithm> {
        match self.kind {
            TokenKind::Untagged | TokenKind::Sign1 => Ok(Algorithm::Ed25519),
            TokenKind::Mac0 => Ok(Algorithm::HmacSha256),
            TokenKind::Encrypt0 => Ok(Algorithm::Aes128Cbc),
            TokenKind::Sign | TokenKind::Mac | TokenKind::Encrypt => {
                Err(SealError::UnsupportedTokenForm)
            }
        }
    }

    /// Verify the token's signature or MAC with `key`.
    pub fn verify(&self, key: &Key) -> SealResult<()> {
        let algorithm = self.algorithm()?;
        let result = match self.kind {
            TokenKind::Untagged | TokenKind::Sign1 => {
                crypto::verify_signature(key, algorithm, self.claim_set, self.security)
            }
            TokenKind::Mac0 => crypto::verify_mac(key, algorithm, self.claim_set, self.security),
            TokenKind::Encrypt0 => Err(SealError::UnsupportedAlgorithm(algorithm)),
            TokenKind::Sign | TokenKind::Mac | TokenKind::Encrypt => {
                Err(SealError::UnsupportedTokenForm)
            }
        };
        if let Err(ref error) = result {
            warn!(kind = ?self.kind, %error, "token verification failed");
        }
        result
    }

    /// Look up a byte-string claim in the claim map.
    pub fn claim_bytes(&self, claim_key: i64) -> SealResult<&'a [u8]> {
        let mut decoder = Decoder::new(self.claim_set);
        let entries = decoder
            .map()?
            .ok_or(SealError::InvalidStructure("indefinite claim map"))?;
        for _ in 0..entries {
            let key = decoder.i64()?;
            if key == claim_key {
                return Ok(decoder.bytes()?);
            }
            decoder.skip()?;
        }
        Err(SealError::MissingField("claim"))
    }

    /// The SHA-256 digest claim (key −65536).
    pub fn digest_claim(&self) -> SealResult<[u8; 32]> {
        let bytes = self.claim_bytes(CLAIM_DIGEST)?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SealError::InvalidStructure("digest claim length"))?;
        Ok(digest)
    }

    /// The capability bitmask claim (key −65537), big-endian, at most 4 bytes.
    pub fn mask_claim(&self) -> SealResult<u32> {
        let bytes = self.claim_bytes(CLAIM_MASK)?;
        if bytes.len() > 4 {
            return Err(SealError::OutOfRange {
                field: "capability bitmask",
                value: bytes.len() as u64,
            });
        }
        Ok(bytes.iter().fold(0u32, |mask, b| (mask << 8) | *b as u32))
    }
}
