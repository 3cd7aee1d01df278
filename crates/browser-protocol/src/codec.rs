//! Binary self-describing codec.
//!
//! The wire format is canonical CBOR (RFC 8949). Decoding goes through
//! `ciborium`'s dynamic `Value` tree (the "dynamic value tree" spec.md
//! calls for); encoding goes through `Writer`, a hand-rolled header writer
//! in the spirit of the teacher's `Frame::encode` (which writes its header
//! fields directly into a `BytesMut` rather than through a generic
//! serializer).
//!
//! `Writer::write_raw` is the splice primitive: the engine writes a
//! response map's header and known fields itself, then appends an
//! already-CBOR-encoded reply payload (e.g. a cache hit) as a raw
//! fragment without re-parsing or re-encoding it.

use ciborium::value::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor decode error: {0}")]
    Decode(String),
    #[error("unexpected shape: {0}")]
    Shape(&'static str),
}

/// Decode a byte slice into the dynamic value tree.
pub fn decode_value(bytes: &[u8]) -> Result<Value, CodecError> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a serializable value using the library's default (non-canonical
/// but deterministic-per-call) CBOR writer. Used for payloads that are not
/// part of a fingerprinted cache key.
pub fn encode_value<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(buf)
}

/// Low-level CBOR header/fragment writer supporting literal byte splicing.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap) }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn write_header(&mut self, major: u8, len: u64) {
        let major = major << 5;
        if len < 24 {
            self.buf.push(major | len as u8);
        } else if len <= u8::MAX as u64 {
            self.buf.push(major | 24);
            self.buf.push(len as u8);
        } else if len <= u16::MAX as u64 {
            self.buf.push(major | 25);
            self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else if len <= u32::MAX as u64 {
            self.buf.push(major | 26);
            self.buf.extend_from_slice(&(len as u32).to_be_bytes());
        } else {
            self.buf.push(major | 27);
            self.buf.extend_from_slice(&len.to_be_bytes());
        }
    }

    /// Unsigned integer (smallest-form, canonical).
    pub fn write_uint(&mut self, v: u64) {
        self.write_header(0, v);
    }

    /// Signed integer (major type 0 for non-negative, 1 for negative).
    pub fn write_int(&mut self, v: i64) {
        if v >= 0 {
            self.write_header(0, v as u64);
        } else {
            self.write_header(1, (-1 - v) as u64);
        }
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.write_header(2, b.len() as u64);
        self.buf.extend_from_slice(b);
    }

    pub fn write_text(&mut self, s: &str) {
        self.write_header(3, s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
    }

    pub fn write_array_header(&mut self, len: u64) {
        self.write_header(4, len);
    }

    pub fn write_map_header(&mut self, len: u64) {
        self.write_header(5, len);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(if v { 0xf5 } else { 0xf4 });
    }

    pub fn write_null(&mut self) {
        self.buf.push(0xf6);
    }

    /// Splice an already-encoded CBOR fragment in verbatim.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}
