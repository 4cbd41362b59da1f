// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery wire protocol: fixed-layout little-endian frames.
//!
//! Every frame starts with a 6-byte header (magic, version major/minor,
//! message kind, reserved). The message body is a closed set of variants
//! matched exhaustively at decode time; frames whose kind byte falls
//! outside the closed set decode to [`CodecError::UnknownKind`] but remain
//! relayable as raw bytes once the header passes the version check.
//!
//! Wire format:
//! ```text
//! +-------------+-------+-------+------+----------+------------------+
//! | Magic (2B)  | Major | Minor | Kind | Reserved | Body (per kind)  |
//! +-------------+-------+-------+------+----------+------------------+
//! ```

pub mod cursor;

use cursor::{Cursor, CursorMut};
use std::fmt;
use std::net::Ipv4Addr;

/// Frame magic ("SO" little-endian).
pub const MAGIC: u16 = 0x4F53;
/// Protocol version advertised and required by this build.
pub const VERSION_MAJOR: u8 = 0x01;
pub const VERSION_MINOR: u8 = 0x02;
/// Header length in bytes.
pub const HEADER_LEN: usize = 6;

/// Upper bound on topic-name bytes on the wire.
pub const MAX_NAME_LEN: usize = 256;
/// Upper bound on request/response payload bytes on the wire.
pub const MAX_PAYLOAD_LEN: usize = 60 * 1024;

const KIND_CLIENT_REGISTRATION: u8 = 0x01;
const KIND_PEER_ADVERT: u8 = 0x02;
const KIND_TOPIC_ADVERT: u8 = 0x03;
const KIND_TOPIC_ENDPOINT_ADVERT: u8 = 0x04;
const KIND_REQUEST: u8 = 0x05;
const KIND_RESPONSE: u8 = 0x06;

/// Stable identifier of a relay client.
pub type ClientId = u64;
/// Stable identifier of a discovered peer.
pub type PeerId = u64;

/// Codec failures. Transport-format errors: logged and dropped by the
/// reactors, never surfaced to listeners, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    ReadFailed { offset: usize },
    WriteFailed { offset: usize },
    BadMagic(u16),
    UnsupportedVersion(u8),
    UnknownKind(u8),
    InvalidString,
    OversizedField(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { offset } => write!(f, "read past end at offset {}", offset),
            Self::WriteFailed { offset } => write!(f, "write past end at offset {}", offset),
            Self::BadMagic(magic) => write!(f, "invalid magic {:#06x}", magic),
            Self::UnsupportedVersion(major) => write!(f, "unsupported version {}", major),
            Self::UnknownKind(kind) => write!(f, "unknown message kind {:#04x}", kind),
            Self::InvalidString => write!(f, "string field is not valid UTF-8"),
            Self::OversizedField(len) => write!(f, "field length {} exceeds limit", len),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
    pub kind: u8,
}

impl Header {
    /// Decode the header without touching the body. Validates magic and
    /// bounds only; version compatibility is a separate predicate so that
    /// callers can log the offending version.
    pub fn peek(buffer: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(buffer);
        let magic = cursor.read_u16_le()?;
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let major = cursor.read_u8()?;
        let minor = cursor.read_u8()?;
        let kind = cursor.read_u8()?;
        cursor.read_u8()?; // reserved
        Ok(Self { major, minor, kind })
    }

    /// Version-compatibility predicate, evaluated on every inbound header
    /// before further dispatch. Minor revisions are additive.
    #[must_use]
    #[inline]
    pub fn is_compatible(&self) -> bool {
        self.major == VERSION_MAJOR
    }

    /// True for frames the relay registration side consumes itself.
    #[must_use]
    #[inline]
    pub fn is_client_registration(&self) -> bool {
        self.kind == KIND_CLIENT_REGISTRATION
    }

    fn encode(kind: u8, cursor: &mut CursorMut<'_>) -> Result<(), CodecError> {
        cursor.write_u16_le(MAGIC)?;
        cursor.write_u8(VERSION_MAJOR)?;
        cursor.write_u8(VERSION_MINOR)?;
        cursor.write_u8(kind)?;
        cursor.write_u8(0x00) // reserved
    }
}

/// Identity of one pooled outbound socket: destination address, port, and
/// endpoint id. Structural equality is the pooling key; multiple clients
/// resolving to the same triple share one physical socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicationTarget {
    pub addr: Ipv4Addr,
    pub port: u16,
    pub endpoint_id: u32,
}

impl fmt::Display for PublicationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.addr, self.port, self.endpoint_id)
    }
}

/// Relay-client registration payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub target: PublicationTarget,
}

/// Peer advert payload (multicast discovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Topic advert payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
}

/// Topic-endpoint advert payload: one endpoint of one peer on one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicEndpointInfo {
    pub topic: String,
    pub peer_id: PeerId,
    pub endpoint_id: u32,
}

/// Correlated request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub correlation_id: u64,
    pub payload: Vec<u8>,
}

/// Correlated response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub correlation_id: u64,
    pub payload: Vec<u8>,
}

/// The closed set of discovery/request message variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ClientRegistration(ClientInfo),
    PeerAdvert(PeerInfo),
    TopicAdvert(TopicInfo),
    TopicEndpointAdvert(TopicEndpointInfo),
    Request(RequestInfo),
    Response(ResponseInfo),
}

impl Message {
    /// Decode a full frame into an owned message.
    ///
    /// Checks magic and version before dispatching on the kind byte; each
    /// variant decodes into a fresh owned value (no in-place reuse).
    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        let header = Header::peek(buffer)?;
        if !header.is_compatible() {
            return Err(CodecError::UnsupportedVersion(header.major));
        }
        let mut cursor = Cursor::new(&buffer[HEADER_LEN..]);
        match header.kind {
            KIND_CLIENT_REGISTRATION => {
                let client_id = cursor.read_u64_le()?;
                let addr = Ipv4Addr::from(cursor.read_u32_le()?);
                let port = cursor.read_u16_le()?;
                let endpoint_id = cursor.read_u32_le()?;
                Ok(Self::ClientRegistration(ClientInfo {
                    client_id,
                    target: PublicationTarget {
                        addr,
                        port,
                        endpoint_id,
                    },
                }))
            }
            KIND_PEER_ADVERT => {
                let peer_id = cursor.read_u64_le()?;
                let addr = Ipv4Addr::from(cursor.read_u32_le()?);
                let port = cursor.read_u16_le()?;
                Ok(Self::PeerAdvert(PeerInfo {
                    peer_id,
                    addr,
                    port,
                }))
            }
            KIND_TOPIC_ADVERT => {
                let name = read_string(&mut cursor)?;
                Ok(Self::TopicAdvert(TopicInfo { name }))
            }
            KIND_TOPIC_ENDPOINT_ADVERT => {
                let topic = read_string(&mut cursor)?;
                let peer_id = cursor.read_u64_le()?;
                let endpoint_id = cursor.read_u32_le()?;
                Ok(Self::TopicEndpointAdvert(TopicEndpointInfo {
                    topic,
                    peer_id,
                    endpoint_id,
                }))
            }
            KIND_REQUEST => {
                let correlation_id = cursor.read_u64_le()?;
                let payload = read_payload(&mut cursor)?;
                Ok(Self::Request(RequestInfo {
                    correlation_id,
                    payload,
                }))
            }
            KIND_RESPONSE => {
                let correlation_id = cursor.read_u64_le()?;
                let payload = read_payload(&mut cursor)?;
                Ok(Self::Response(ResponseInfo {
                    correlation_id,
                    payload,
                }))
            }
            kind => Err(CodecError::UnknownKind(kind)),
        }
    }

    /// Encode into `buffer`, returning the frame length.
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize, CodecError> {
        let mut cursor = CursorMut::new(buffer);
        match self {
            Self::ClientRegistration(info) => {
                Header::encode(KIND_CLIENT_REGISTRATION, &mut cursor)?;
                cursor.write_u64_le(info.client_id)?;
                cursor.write_u32_le(u32::from(info.target.addr))?;
                cursor.write_u16_le(info.target.port)?;
                cursor.write_u32_le(info.target.endpoint_id)?;
            }
            Self::PeerAdvert(info) => {
                Header::encode(KIND_PEER_ADVERT, &mut cursor)?;
                cursor.write_u64_le(info.peer_id)?;
                cursor.write_u32_le(u32::from(info.addr))?;
                cursor.write_u16_le(info.port)?;
            }
            Self::TopicAdvert(info) => {
                Header::encode(KIND_TOPIC_ADVERT, &mut cursor)?;
                write_string(&mut cursor, &info.name)?;
            }
            Self::TopicEndpointAdvert(info) => {
                Header::encode(KIND_TOPIC_ENDPOINT_ADVERT, &mut cursor)?;
                write_string(&mut cursor, &info.topic)?;
                cursor.write_u64_le(info.peer_id)?;
                cursor.write_u32_le(info.endpoint_id)?;
            }
            Self::Request(info) => {
                Header::encode(KIND_REQUEST, &mut cursor)?;
                cursor.write_u64_le(info.correlation_id)?;
                write_payload(&mut cursor, &info.payload)?;
            }
            Self::Response(info) => {
                Header::encode(KIND_RESPONSE, &mut cursor)?;
                cursor.write_u64_le(info.correlation_id)?;
                write_payload(&mut cursor, &info.payload)?;
            }
        }
        Ok(cursor.offset())
    }
}

fn read_string(cursor: &mut Cursor<'_>) -> Result<String, CodecError> {
    let len = usize::from(cursor.read_u16_le()?);
    if len > MAX_NAME_LEN {
        return Err(CodecError::OversizedField(len));
    }
    let bytes = cursor.read_bytes(len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidString)
}

fn write_string(cursor: &mut CursorMut<'_>, value: &str) -> Result<(), CodecError> {
    if value.len() > MAX_NAME_LEN {
        return Err(CodecError::OversizedField(value.len()));
    }
    // Length bounded by MAX_NAME_LEN, always fits in u16.
    cursor.write_u16_le(value.len() as u16)?;
    cursor.write_bytes(value.as_bytes())
}

fn read_payload(cursor: &mut Cursor<'_>) -> Result<Vec<u8>, CodecError> {
    let len = cursor.read_u32_le()? as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(CodecError::OversizedField(len));
    }
    cursor.read_bytes(len).map(<[u8]>::to_vec)
}

fn write_payload(cursor: &mut CursorMut<'_>, payload: &[u8]) -> Result<(), CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::OversizedField(payload.len()));
    }
    cursor.write_u32_le(payload.len() as u32)?;
    cursor.write_bytes(payload)
}
