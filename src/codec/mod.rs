//! Framed envelope codec for providers that expose a binary `/fetch`
//! endpoint instead of a plain manifest URL.
//!
//! The request is three length-delimited protobuf-style fields; the
//! response is a single length-delimited field whose payload must be run
//! through a [`DecodeTransform`] keyed by a response header.

pub mod transform;

pub use transform::{DecodeTransform, TransformSpec};

use thiserror::Error;

/// Protobuf wire type for length-delimited fields.
pub const WIRE_TYPE_LEN: u8 = 2;

pub const TAG_SOURCE: u8 = (1 << 3) | WIRE_TYPE_LEN; // 0x0a
pub const TAG_ID: u8 = (2 << 3) | WIRE_TYPE_LEN; // 0x12
pub const TAG_STREAM_NUMBER: u8 = (3 << 3) | WIRE_TYPE_LEN; // 0x1a

/// Required length of the key material header value.
pub const KEY_MATERIAL_LEN: usize = 32;

/// A u64 varint never spans more than 10 bytes.
const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected wire type {wire_type} in tag 0x{tag:02x}")]
    UnexpectedWireType { tag: u8, wire_type: u8 },

    #[error("short buffer: needed {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },

    #[error("varint length prefix exceeds 10 bytes")]
    VarintOverflow,

    #[error("unexpected field tag 0x{found:02x}, expected 0x{expected:02x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("field is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("payload did not decode to an http(s) URL")]
    PayloadNotUrl,
}

/// Request side of the framed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub source: String,
    pub id: String,
    pub stream_number: String,
}

impl FetchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.source.len() + self.id.len() + self.stream_number.len() + 6);
        write_field(&mut buf, TAG_SOURCE, self.source.as_bytes());
        write_field(&mut buf, TAG_ID, self.id.as_bytes());
        write_field(&mut buf, TAG_STREAM_NUMBER, self.stream_number.as_bytes());
        buf
    }

    /// Parse an encoded request. Field order is fixed.
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut reader = FieldReader::new(buf);
        let source = reader.expect_string(TAG_SOURCE)?;
        let id = reader.expect_string(TAG_ID)?;
        let stream_number = reader.expect_string(TAG_STREAM_NUMBER)?;
        Ok(Self {
            source,
            id,
            stream_number,
        })
    }
}

/// Extract the ciphertext payload from a response envelope.
///
/// Reads one tag byte (any field number, wire type must be 2), a varint
/// length and that many payload bytes. Trailing bytes are ignored.
pub fn decode_response(buf: &[u8]) -> Result<&[u8], CodecError> {
    let mut reader = FieldReader::new(buf);
    let tag = reader.read_tag()?;
    let wire_type = tag & 0x07;
    if wire_type != WIRE_TYPE_LEN {
        return Err(CodecError::UnexpectedWireType { tag, wire_type });
    }
    reader.read_len_delimited()
}

/// Validate the key material carried in the response header.
pub fn parse_key_material(value: &str) -> Result<Vec<u8>, CodecError> {
    if value.len() != KEY_MATERIAL_LEN {
        return Err(CodecError::InvalidKeyMaterial(format!(
            "expected {} characters, got {}",
            KEY_MATERIAL_LEN,
            value.len()
        )));
    }
    if !value.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(CodecError::InvalidKeyMaterial(
            "non-printable characters".to_string(),
        ));
    }
    Ok(value.as_bytes().to_vec())
}

/// Apply a transform to every ciphertext byte.
pub fn decode_payload(ciphertext: &[u8], key: &[u8], transform: &dyn DecodeTransform) -> Vec<u8> {
    ciphertext
        .iter()
        .enumerate()
        .map(|(position, &byte)| transform.decode_byte(byte, position, key))
        .collect()
}

fn write_field(buf: &mut Vec<u8>, tag: u8, bytes: &[u8]) {
    buf.push(tag);
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    while v > 0x7F {
        buf.push((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_tag(&mut self) -> Result<u8, CodecError> {
        let tag = *self.buf.get(self.pos).ok_or(CodecError::ShortBuffer {
            needed: 1,
            available: 0,
        })?;
        self.pos += 1;
        Ok(tag)
    }

    fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_BYTES {
            let byte = *self.buf.get(self.pos).ok_or(CodecError::ShortBuffer {
                needed: i + 1,
                available: i,
            })?;
            self.pos += 1;
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    fn read_len_delimited(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_varint()?;
        let available = self.remaining();
        let needed = usize::try_from(len).map_err(|_| CodecError::ShortBuffer {
            needed: usize::MAX,
            available,
        })?;
        if needed > available {
            return Err(CodecError::ShortBuffer { needed, available });
        }
        let out = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(out)
    }

    fn expect_string(&mut self, expected: u8) -> Result<String, CodecError> {
        let found = self.read_tag()?;
        if found & 0x07 != WIRE_TYPE_LEN {
            return Err(CodecError::UnexpectedWireType {
                tag: found,
                wire_type: found & 0x07,
            });
        }
        if found != expected {
            return Err(CodecError::UnexpectedTag { expected, found });
        }
        let bytes = self.read_len_delimited()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_matches_wire_format() {
        let req = FetchRequest {
            source: "alpha".into(),
            id: "42".into(),
            stream_number: "1".into(),
        };
        assert_eq!(
            req.encode(),
            vec![
                0x0a, 5, b'a', b'l', b'p', b'h', b'a', 0x12, 2, b'4', b'2', 0x1a, 1, b'1'
            ]
        );
    }

    #[test]
    fn request_round_trips() {
        let req = FetchRequest {
            source: "admin".into(),
            id: "ppv-event-2231".into(),
            stream_number: "3".into(),
        };
        assert_eq!(FetchRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn request_round_trips_empty_fields() {
        let req = FetchRequest {
            source: String::new(),
            id: String::new(),
            stream_number: String::new(),
        };
        assert_eq!(req.encode(), vec![0x0a, 0, 0x12, 0, 0x1a, 0]);
        assert_eq!(FetchRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn request_decode_rejects_reordered_fields() {
        let buf = vec![0x12, 1, b'x', 0x0a, 1, b'y', 0x1a, 1, b'z'];
        assert_eq!(
            FetchRequest::decode(&buf),
            Err(CodecError::UnexpectedTag {
                expected: TAG_SOURCE,
                found: TAG_ID
            })
        );
    }

    #[test]
    fn response_single_byte_length() {
        let buf = [0x0a, 3, 0xde, 0xad, 0xbe];
        assert_eq!(decode_response(&buf).unwrap(), &[0xde, 0xad, 0xbe]);
    }

    #[test]
    fn response_multi_byte_varint_length() {
        // 300 = 0b1_0010_1100 -> 0xac 0x02
        let mut buf = vec![0x0a, 0xac, 0x02];
        buf.extend(std::iter::repeat_n(7u8, 300));
        let payload = decode_response(&buf).unwrap();
        assert_eq!(payload.len(), 300);
        assert!(payload.iter().all(|&b| b == 7));
    }

    #[test]
    fn response_rejects_varint_wire_type() {
        let buf = [0x08, 1, 0];
        assert_eq!(
            decode_response(&buf),
            Err(CodecError::UnexpectedWireType {
                tag: 0x08,
                wire_type: 0
            })
        );
    }

    #[test]
    fn response_rejects_truncated_payload() {
        let buf = [0x0a, 10, 1, 2, 3];
        assert_eq!(
            decode_response(&buf),
            Err(CodecError::ShortBuffer {
                needed: 10,
                available: 3
            })
        );
    }

    #[test]
    fn response_rejects_empty_and_truncated_length() {
        assert!(matches!(
            decode_response(&[]),
            Err(CodecError::ShortBuffer { .. })
        ));
        assert!(matches!(
            decode_response(&[0x0a, 0x80]),
            Err(CodecError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn response_rejects_overlong_varint() {
        let buf = [0x0a, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(decode_response(&buf), Err(CodecError::VarintOverflow));
    }

    #[test]
    fn key_material_must_be_32_printable() {
        assert!(parse_key_material("0123456789abcdef0123456789ABCDEF").is_ok());
        assert!(parse_key_material("short").is_err());
        assert!(parse_key_material("0123456789abcdef0123456789ABCDE\u{7}").is_err());
    }

    #[test]
    fn varint_encoding_matches_protobuf() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 1);
        write_varint(&mut buf, 127);
        write_varint(&mut buf, 128);
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0x01, 0x7f, 0x80, 0x01, 0xac, 0x02]);
    }
}
