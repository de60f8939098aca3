//! The container metadata envelope
//!
//! A metadata image is a CBOR map under the application tag, with three
//! sections each embedded as a byte string: the container object, the
//! endpoints array and the security object. Unknown map keys fail the
//! parse; the format is closed.

use std::convert::Infallible;

use minicbor::data::{Tag, Type};
use minicbor::{Decoder, Encoder};

use crate::error::{SealError, SealResult};

/// Application tag marking a metadata envelope.
pub const METADATA_TAG: u64 = 6_082_514_239_057_121_876;

/// Maximum container uid length in bytes.
pub const UID_MAX: usize = 64;

const KEY_CONTAINER: i64 = 1;
const KEY_ENDPOINTS: i64 = 2;
const KEY_SECURITY: i64 = 3;

const KEY_CONTAINER_UID: i64 = 1;
const KEY_CONTAINER_TYPE: i64 = 2;
const KEY_CONTAINER_MASK: i64 = 3;

const KEY_ENDPOINT_ID: i64 = 1;
const KEY_ENDPOINT_PEER_TYPE: i64 = 2;
const KEY_ENDPOINT_PEER_UID: i64 = 3;
const KEY_ENDPOINT_PEER_ID: i64 = 4;
const KEY_ENDPOINT_DIRECTION: i64 = 5;
const KEY_ENDPOINT_TOKEN: i64 = 6;

type EncodeError = minicbor::encode::Error<Infallible>;

fn encode_failed(error: EncodeError) -> SealError {
    SealError::Encode(error.to_string())
}

/// What an endpoint is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    /// Another container on this device
    Container = 0,
    /// A local hardware peripheral behind the I/O driver
    Local = 1,
    /// A remote network peer behind the I/O driver
    Remote = 2,
}

impl PeerType {
    fn from_u8(value: u8) -> SealResult<Self> {
        match value {
            0 => Ok(PeerType::Container),
            1 => Ok(PeerType::Local),
            2 => Ok(PeerType::Remote),
            other => Err(SealError::OutOfRange {
                field: "peer_type",
                value: other as u64,
            }),
        }
    }
}

/// Data direction of an endpoint, from the container's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In = 0,
    Out = 1,
    Both = 2,
}

impl Direction {
    fn from_u8(value: u8) -> SealResult<Self> {
        match value {
            0 => Ok(Direction::In),
            1 => Ok(Direction::Out),
            2 => Ok(Direction::Both),
            other => Err(SealError::OutOfRange {
                field: "direction",
                value: other as u64,
            }),
        }
    }

    /// True when the container may read from this endpoint.
    pub fn readable(self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }

    /// True when the container may write to this endpoint.
    pub fn writable(self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }
}

/// One endpoint record from the endpoints array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: u32,
    pub peer_type: PeerType,
    /// Required when the peer is another container
    pub peer_uid: Option<Vec<u8>>,
    pub peer_endpoint_id: u32,
    pub direction: Direction,
    /// Optional per-endpoint authentication token
    pub token: Option<Vec<u8>>,
}

/// The three raw sections of a parsed envelope.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub raw: &'a [u8],
    pub container: &'a [u8],
    pub endpoints: &'a [u8],
    pub security: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn parse(raw: &'a [u8]) -> SealResult<Self> {
        let mut decoder = Decoder::new(raw);

        if decoder.datatype()? != Type::Tag || decoder.tag()? != Tag::new(METADATA_TAG) {
            return Err(SealError::InvalidStructure("missing metadata tag"));
        }

        let entries = decoder
            .map()?
            .ok_or(SealError::InvalidStructure("indefinite envelope map"))?;

        let mut container = None;
        let mut endpoints = None;
        let mut security = None;

        for _ in 0..entries {
            let key = decoder.i64()?;
            let value = decoder.bytes()?;
            match key {
                KEY_CONTAINER => container = Some(value),
                KEY_ENDPOINTS => endpoints = Some(value),
                KEY_SECURITY => security = Some(value),
                other => return Err(SealError::UnknownKey(other)),
            }
        }

        Ok(Envelope {
            raw,
            container: container.ok_or(SealError::MissingField("container"))?,
            endpoints: endpoints.ok_or(SealError::MissingField("endpoints"))?,
            security: security.ok_or(SealError::MissingField("security"))?,
        })
    }
}

/// Encode an envelope from its three pre-encoded sections.
pub fn encode_envelope(container: &[u8], endpoints: &[u8], security: &[u8]) -> SealResult<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.tag(Tag::new(METADATA_TAG))?;
        encoder.map(3)?;
        encoder.i64(KEY_CONTAINER)?.bytes(container)?;
        encoder.i64(KEY_ENDPOINTS)?.bytes(endpoints)?;
        encoder.i64(KEY_SECURITY)?.bytes(security)?;
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

/// The container object: identity, engine selection and capability token.
#[derive(Debug, Clone, Copy)]
pub struct ContainerInfo<'a> {
    pub uid: &'a [u8],
    pub runtime_type: u8,
    /// Signed token whose claim set carries the syscall bitmask
    pub syscall_mask_token: &'a [u8],
}

impl<'a> ContainerInfo<'a> {
    pub fn parse(bytes: &'a [u8]) -> SealResult<Self> {
        let mut decoder = Decoder::new(bytes);
        let entries = decoder
            .map()?
            .ok_or(SealError::InvalidStructure("indefinite container map"))?;

        let mut uid = None;
        let mut runtime_type = None;
        let mut mask_token = None;

        for _ in 0..entries {
            let key = decoder.i64()?;
            match key {
                KEY_CONTAINER_UID => uid = Some(decoder.bytes()?),
                KEY_CONTAINER_TYPE => runtime_type = Some(decoder.u8()?),
                KEY_CONTAINER_MASK => mask_token = Some(decoder.bytes()?),
                other => return Err(SealError::UnknownKey(other)),
            }
        }

        let uid = uid.ok_or(SealError::MissingField("uid"))?;
        if uid.is_empty() || uid.len() > UID_MAX {
            return Err(SealError::OutOfRange {
                field: "uid length",
                value: uid.len() as u64,
            });
        }

        Ok(ContainerInfo {
            uid,
            runtime_type: runtime_type.ok_or(SealError::MissingField("runtime_type"))?,
            syscall_mask_token: mask_token.ok_or(SealError::MissingField("syscall_mask"))?,
        })
    }
}

/// Encode a container object section.
pub fn encode_container(uid: &[u8], runtime_type: u8, mask_token: &[u8]) -> SealResult<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.map(3)?;
        encoder.i64(KEY_CONTAINER_UID)?.bytes(uid)?;
        encoder.i64(KEY_CONTAINER_TYPE)?.u8(runtime_type)?;
        encoder.i64(KEY_CONTAINER_MASK)?.bytes(mask_token)?;
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

fn parse_endpoint(decoder: &mut Decoder<'_>) -> SealResult<Endpoint> {
    let entries = decoder
        .map()?
        .ok_or(SealError::InvalidStructure("indefinite endpoint map"))?;

    let mut id = None;
    let mut peer_type = None;
    let mut peer_uid = None;
    let mut peer_endpoint_id = None;
    let mut direction = None;
    let mut token = None;

    for _ in 0..entries {
        let key = decoder.i64()?;
        match key {
            KEY_ENDPOINT_ID => id = Some(decoder.u32()?),
            KEY_ENDPOINT_PEER_TYPE => peer_type = Some(PeerType::from_u8(decoder.u8()?)?),
            KEY_ENDPOINT_PEER_UID => peer_uid = Some(decoder.bytes()?.to_vec()),
            KEY_ENDPOINT_PEER_ID => peer_endpoint_id = Some(decoder.u32()?),
            KEY_ENDPOINT_DIRECTION => direction = Some(Direction::from_u8(decoder.u8()?)?),
            KEY_ENDPOINT_TOKEN => token = Some(decoder.bytes()?.to_vec()),
            other => return Err(SealError::UnknownKey(other)),
        }
    }

    let peer_type = peer_type.ok_or(SealError::MissingField("peer_type"))?;
    if peer_type == PeerType::Container && peer_uid.is_none() {
        return Err(SealError::MissingField("peer_uid"));
    }

    Ok(Endpoint {
        id: id.ok_or(SealError::MissingField("endpoint id"))?,
        peer_type,
        peer_uid,
        peer_endpoint_id: peer_endpoint_id.ok_or(SealError::MissingField("peer_endpoint_id"))?,
        direction: direction.ok_or(SealError::MissingField("direction"))?,
        token,
    })
}

/// Walk the endpoints array and return the first record with `id`, without
/// materializing the whole array.
pub fn endpoints_search(endpoints: &[u8], id: u32) -> SealResult<Option<Endpoint>> {
    let mut decoder = Decoder::new(endpoints);
    let entries = decoder
        .array()?
        .ok_or(SealError::InvalidStructure("indefinite endpoints array"))?;
    for _ in 0..entries {
        let endpoint = parse_endpoint(&mut decoder)?;
        if endpoint.id == id {
            return Ok(Some(endpoint));
        }
    }
    Ok(None)
}

/// Decode the whole endpoints array.
pub fn endpoints_all(endpoints: &[u8]) -> SealResult<Vec<Endpoint>> {
    let mut decoder = Decoder::new(endpoints);
    let entries = decoder
        .array()?
        .ok_or(SealError::InvalidStructure("indefinite endpoints array"))?;
    (0..entries).map(|_| parse_endpoint(&mut decoder)).collect()
}

/// Validate every record of the endpoints array; returns the record count.
pub fn endpoints_validate(endpoints: &[u8]) -> SealResult<usize> {
    let mut decoder = Decoder::new(endpoints);
    let entries = decoder
        .array()?
        .ok_or(SealError::InvalidStructure("indefinite endpoints array"))?;
    for _ in 0..entries {
        parse_endpoint(&mut decoder)?;
    }
    Ok(entries as usize)
}

/// Encode an endpoints array section.
pub fn encode_endpoints(endpoints: &[Endpoint]) -> SealResult<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.array(endpoints.len() as u64)?;
        for endpoint in endpoints {
            let mut entries = 4;
            if endpoint.peer_uid.is_some() {
                entries += 1;
            }
            if endpoint.token.is_some() {
                entries += 1;
            }
            encoder.map(entries)?;
            encoder.i64(KEY_ENDPOINT_ID)?.u32(endpoint.id)?;
            encoder
                .i64(KEY_ENDPOINT_PEER_TYPE)?
                .u8(endpoint.peer_type as u8)?;
            if let Some(ref uid) = endpoint.peer_uid {
                encoder.i64(KEY_ENDPOINT_PEER_UID)?.bytes(uid)?;
            }
            encoder
                .i64(KEY_ENDPOINT_PEER_ID)?
                .u32(endpoint.peer_endpoint_id)?;
            encoder
                .i64(KEY_ENDPOINT_DIRECTION)?
                .u8(endpoint.direction as u8)?;
            if let Some(ref token) = endpoint.token {
                encoder.i64(KEY_ENDPOINT_TOKEN)?.bytes(token)?;
            }
        }
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

/// The security object: scheduling budgets and the three section tokens.
#[derive(Debug, Clone, Copy)]
pub struct Security<'a> {
    pub start_max_duration: u32,
    /// Loop period in milliseconds
    pub loop_period: u32,
    pub loop_max_duration: u32,
    /// Maximum number of loop invocations; zero is unbounded
    pub loop_max_lifetime: u32,
    pub stop_max_duration: u32,
    pub data_token: &'a [u8],
    pub code_token: &'a [u8],
    pub metadata_token: &'a [u8],
}

impl<'a> Security<'a> {
    pub fn parse(bytes: &'a [u8]) -> SealResult<Self> {
        let mut decoder = Decoder::new(bytes);
        let entries = decoder
            .array()?
            .ok_or(SealError::InvalidStructure("indefinite security array"))?;
        if entries != 8 {
            return Err(SealError::InvalidStructure("security array length"));
        }

        Ok(Security {
            start_max_duration: decoder.u32()?,
            loop_period: decoder.u32()?,
            loop_max_duration: decoder.u32()?,
            loop_max_lifetime: decoder.u32()?,
            stop_max_duration: decoder.u32()?,
            data_token: decoder.bytes()?,
            code_token: decoder.bytes()?,
            metadata_token: decoder.bytes()?,
        })
    }
}

/// Encode a security object section.
pub fn encode_security(security: &Security<'_>) -> SealResult<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new());
    (|| -> Result<(), EncodeError> {
        encoder.array(8)?;
        encoder.u32(security.start_max_duration)?;
        encoder.u32(security.loop_period)?;
        encoder.u32(security.loop_max_duration)?;
        encoder.u32(security.loop_max_lifetime)?;
        encoder.u32(security.stop_max_duration)?;
        encoder.bytes(security.data_token)?;
        encoder.bytes(security.code_token)?;
        encoder.bytes(security.metadata_token)?;
        Ok(())
    })()
    .map_err(encode_failed)?;
    Ok(encoder.into_writer())
}

/// On-wire size of a definite-length byte string holding `len` payload
/// bytes, header included.
pub fn bstr_wire_len(len: usize) -> usize {
    let header = match len {
        0..=23 => 1,
        24..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    };
    len + header
}

/// Byte count of the envelope covered by the metadata token's digest: the
/// whole envelope minus the trailing token byte string, computed from the
/// parsed structure.
pub fn metadata_digest_coverage(envelope: &Envelope<'_>, security: &Security<'_>) -> SealResult<usize> {
    let excluded = bstr_wire_len(security.metadata_token.len());
    envelope
        .raw
        .len()
        .checked_sub(excluded)
        .ok_or(SealError::InvalidStructure("metadata token exceeds envelope"))
}
