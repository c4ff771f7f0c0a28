//! Binary message envelope shared by every transport.
//!
//! Wire layout (version 1, integers big-endian):
//! `[magic:2 "MW"][version:1][type:1][id_len:2][id][rid_len:2][request_id][payload_len:4][payload]`
//!
//! The same bytes travel over a WebSocket binary frame, a length-prefixed TCP
//! frame or a datagram; framing belongs to the driver.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Leading bytes of every encoded envelope.
pub const MAGIC: [u8; 2] = *b"MW";

/// Current wire format version.
pub const VERSION: u8 = 1;

/// Fixed bytes before the variable-length fields.
const FIXED_HEADER: usize = MAGIC.len() + 2;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of `id` and `request_id` in bytes.
pub const MAX_ID_LEN: usize = u16::MAX as usize;

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Request,
    Response,
    Error,
    Broadcast,
    /// Unsolicited notification that expects no reply.
    Event,
}

impl EnvelopeType {
    const fn to_wire(self) -> u8 {
        match self {
            Self::Request => 1,
            Self::Response => 2,
            Self::Error => 3,
            Self::Broadcast => 4,
            Self::Event => 5,
        }
    }

    const fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Error),
            4 => Some(Self::Broadcast),
            5 => Some(Self::Event),
            _ => None,
        }
    }

    /// Whether this type answers an earlier request.
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

/// Reasons an inbound byte sequence is not a valid envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEnvelope {
    #[error("insufficient data: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("bad magic bytes: {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown envelope type tag: {0}")]
    UnknownType(u8),
    #[error("{field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("envelope id is empty")]
    EmptyId,
    #[error("payload too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { size: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Envelope construction or parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] MalformedEnvelope),
}

/// Generate a fresh correlation token: 128 random bits as 32 lowercase hex chars.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The unit of exchange across all transports.
///
/// Immutable once built. A reply is a new envelope that carries the
/// original's correlation key in its `request_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: String,
    request_id: String,
    kind: EnvelopeType,
    payload: Bytes,
}

impl Envelope {
    /// Build an envelope.
    ///
    /// A blank `id` is replaced by a generated one and a missing `request_id`
    /// becomes the empty string.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `payload` is `None` for a non-error type,
    /// or if a field exceeds the wire limits.
    pub fn create(
        id: &str,
        payload: Option<Bytes>,
        kind: EnvelopeType,
        request_id: Option<&str>,
    ) -> Result<Self, EnvelopeError> {
        let payload = match payload {
            Some(payload) => payload,
            None if kind == EnvelopeType::Error => Bytes::new(),
            None => {
                return Err(EnvelopeError::InvalidArgument(format!(
                    "payload is required for {kind:?} envelopes"
                )));
            }
        };
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EnvelopeError::InvalidArgument(format!(
                "payload too large: {} bytes (max {MAX_PAYLOAD_SIZE})",
                payload.len()
            )));
        }

        let id = if id.trim().is_empty() {
            generate_id()
        } else {
            id.to_string()
        };
        let request_id = request_id.unwrap_or_default().to_string();
        if id.len() > MAX_ID_LEN || request_id.len() > MAX_ID_LEN {
            return Err(EnvelopeError::InvalidArgument(format!(
                "correlation ids are limited to {MAX_ID_LEN} bytes"
            )));
        }

        Ok(Self {
            id,
            request_id,
            kind,
            payload,
        })
    }

    /// Build a `Request` envelope.
    ///
    /// # Errors
    /// See [`Envelope::create`].
    pub fn create_request(
        id: &str,
        payload: Option<Bytes>,
        request_id: Option<&str>,
    ) -> Result<Self, EnvelopeError> {
        Self::create(id, payload, EnvelopeType::Request, request_id)
    }

    /// Build a `Response` envelope.
    ///
    /// # Errors
    /// See [`Envelope::create`].
    pub fn create_response(
        id: &str,
        payload: Option<Bytes>,
        request_id: Option<&str>,
    ) -> Result<Self, EnvelopeError> {
        Self::create(id, payload, EnvelopeType::Response, request_id)
    }

    /// Build an `Error` envelope, correlated to `source` when given.
    ///
    /// The source's `id` is reused when non-empty and its `request_id` is
    /// always carried over. The message becomes the payload as UTF-8 bytes,
    /// truncated to [`MAX_PAYLOAD_SIZE`].
    #[must_use]
    pub fn create_error(source: Option<&Self>, message: Option<&str>) -> Self {
        let id = source
            .map(|s| s.id.as_str())
            .filter(|id| !id.is_empty())
            .map_or_else(generate_id, str::to_string);
        let request_id = source.map(|s| s.request_id.clone()).unwrap_or_default();

        let bytes = message.unwrap_or_default().as_bytes();
        let payload = Bytes::copy_from_slice(&bytes[..bytes.len().min(MAX_PAYLOAD_SIZE)]);

        Self {
            id,
            request_id,
            kind: EnvelopeType::Error,
            payload,
        }
    }

    /// Unique correlation token of this message.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request this envelope belongs to, or `""`.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub const fn kind(&self) -> EnvelopeType {
        self.kind
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Key a reply must carry as its `request_id`: the request id if set,
    /// otherwise the envelope id.
    #[must_use]
    pub fn correlation_key(&self) -> &str {
        if self.request_id.is_empty() {
            &self.id
        } else {
            &self.request_id
        }
    }

    /// Size of the encoded form in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER + 2 + self.id.len() + 2 + self.request_id.len() + 4 + self.payload.len()
    }

    /// Serialize to the binary wire form.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // lengths are bounded at construction
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind.to_wire());
        buf.put_u16(self.id.len() as u16);
        buf.put_slice(self.id.as_bytes());
        buf.put_u16(self.request_id.len() as u16);
        buf.put_slice(self.request_id.as_bytes());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse the binary wire form. Exact inverse of [`Envelope::encode`].
    ///
    /// # Errors
    /// Returns a [`MalformedEnvelope`] reason if the bytes are not a complete,
    /// well-formed version 1 envelope.
    pub fn parse(bytes: &[u8]) -> Result<Self, MalformedEnvelope> {
        let mut buf = bytes;

        ensure(buf, FIXED_HEADER)?;
        let magic = [buf.get_u8(), buf.get_u8()];
        if magic != MAGIC {
            return Err(MalformedEnvelope::BadMagic(magic));
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(MalformedEnvelope::UnsupportedVersion(version));
        }
        let tag = buf.get_u8();
        let kind = EnvelopeType::from_wire(tag).ok_or(MalformedEnvelope::UnknownType(tag))?;

        ensure(buf, 2)?;
        let id_len = usize::from(buf.get_u16());
        let id = take_str(&mut buf, id_len, "id")?;
        if id.is_empty() {
            return Err(MalformedEnvelope::EmptyId);
        }

        ensure(buf, 2)?;
        let rid_len = usize::from(buf.get_u16());
        let request_id = take_str(&mut buf, rid_len, "request_id")?;

        ensure(buf, 4)?;
        let payload_len = buf.get_u32() as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(MalformedEnvelope::PayloadTooLarge { size: payload_len });
        }
        ensure(buf, payload_len)?;
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);

        if buf.has_remaining() {
            return Err(MalformedEnvelope::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            id,
            request_id,
            kind,
            payload,
        })
    }
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), MalformedEnvelope> {
    if buf.len() < needed {
        return Err(MalformedEnvelope::Truncated {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

fn take_str(buf: &mut &[u8], len: usize, field: &'static str) -> Result<String, MalformedEnvelope> {
    ensure(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| MalformedEnvelope::InvalidUtf8 { field })?
        .to_string();
    buf.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn test_blank_id_is_generated() {
        let env = Envelope::create_response("", payload("ok"), None).unwrap();
        assert_eq!(env.id().len(), 32);
        assert!(env.id().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let env = Envelope::create_response("   ", payload("ok"), None).unwrap();
        assert!(!env.id().trim().is_empty());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Envelope::create_request("", payload("x"), None).unwrap();
        let b = Envelope::create_request("", payload("x"), None).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let env = Envelope::create_response("abc", payload("ok"), None).unwrap();
        assert_eq!(env.id(), "abc");
        assert_eq!(env.request_id(), "");
        assert_eq!(env.kind(), EnvelopeType::Response);
    }

    #[test]
    fn test_missing_payload_is_rejected() {
        let err = Envelope::create_request("abc", None, None).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidArgument(_)));

        let env = Envelope::create("abc", None, EnvelopeType::Error, None).unwrap();
        assert!(env.payload().is_empty());
    }

    #[test]
    fn test_error_reuses_source_correlation() {
        let source = Envelope::create_request("X", payload("do it"), Some("R")).unwrap();
        let err = Envelope::create_error(Some(&source), Some("boom"));
        assert_eq!(err.id(), "X");
        assert_eq!(err.request_id(), "R");
        assert_eq!(err.kind(), EnvelopeType::Error);
        assert_eq!(err.payload().as_ref(), b"boom");
    }

    #[test]
    fn test_error_keeps_whitespace_source_id() {
        let mut raw = b"MW\x01\x01".to_vec();
        raw.extend_from_slice(&[0, 2, b' ', b' ', 0, 0, 0, 0, 0, 0]);
        let source = Envelope::parse(&raw).unwrap();
        assert_eq!(source.id(), "  ");

        let err = Envelope::create_error(Some(&source), Some("boom"));
        assert_eq!(err.id(), "  ");
    }

    #[test]
    fn test_error_without_source() {
        let err = Envelope::create_error(None, Some("boom"));
        assert_eq!(err.id().len(), 32);
        assert_eq!(err.request_id(), "");

        let other = Envelope::create_error(None, Some("boom"));
        assert_ne!(err.id(), other.id());
    }

    #[test]
    fn test_error_without_message_has_empty_payload() {
        let err = Envelope::create_error(None, None);
        assert!(err.payload().is_empty());
    }

    #[test]
    fn test_roundtrip() {
        let cases = [
            Envelope::create_request("id-1", payload("hello"), Some("req-1")).unwrap(),
            Envelope::create("b", Some(Bytes::new()), EnvelopeType::Broadcast, None).unwrap(),
            Envelope::create("", Some(Bytes::from_static(&[0, 255, 1])), EnvelopeType::Event, None)
                .unwrap(),
            Envelope::create_error(None, Some("naïve failure")),
        ];
        for env in cases {
            let bytes = env.encode();
            assert_eq!(bytes.len(), env.encoded_len());
            assert_eq!(Envelope::parse(&bytes).unwrap(), env);
        }
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = Envelope::create_request("id", payload("hello"), None)
            .unwrap()
            .encode();
        for len in 0..bytes.len() {
            let err = Envelope::parse(&bytes[..len]).unwrap_err();
            assert!(matches!(err, MalformedEnvelope::Truncated { .. }), "len {len}: {err}");
        }
    }

    #[test]
    fn test_parse_rejects_bad_header() {
        let bytes = Envelope::create_request("id", payload("x"), None)
            .unwrap()
            .encode();

        let mut bad = bytes.to_vec();
        bad[0] = b'X';
        assert!(matches!(Envelope::parse(&bad), Err(MalformedEnvelope::BadMagic(_))));

        let mut bad = bytes.to_vec();
        bad[2] = 9;
        assert_eq!(
            Envelope::parse(&bad),
            Err(MalformedEnvelope::UnsupportedVersion(9))
        );

        let mut bad = bytes.to_vec();
        bad[3] = 42;
        assert_eq!(Envelope::parse(&bad), Err(MalformedEnvelope::UnknownType(42)));

        let mut bad = bytes.to_vec();
        bad.push(0);
        assert_eq!(Envelope::parse(&bad), Err(MalformedEnvelope::TrailingBytes(1)));
    }

    #[test]
    fn test_parse_rejects_empty_id() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&MAGIC);
        raw.extend_from_slice(&[VERSION, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(Envelope::parse(&raw), Err(MalformedEnvelope::EmptyId));
    }

    #[test]
    fn test_parse_rejects_invalid_utf8() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&MAGIC);
        raw.extend_from_slice(&[VERSION, 1, 0, 1, 0xff, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Envelope::parse(&raw),
            Err(MalformedEnvelope::InvalidUtf8 { field: "id" })
        );
    }

    #[test]
    fn test_correlation_key() {
        let plain = Envelope::create_request("id", payload("x"), None).unwrap();
        assert_eq!(plain.correlation_key(), "id");
        let tagged = Envelope::create_request("id", payload("x"), Some("req")).unwrap();
        assert_eq!(tagged.correlation_key(), "req");
    }
}
