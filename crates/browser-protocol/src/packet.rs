//! Inbound/outbound packet data model.
//!
//! Mirrors `original_source/backend-server/app/command/packet.py` and
//! `response.py`: a packet is a channel, a protocol version, and an ordered
//! list of `(id, kind, payload)` sub-requests; the reply is a list of
//! `(id, payload)` pairs plus a bundles side-channel and an optional packed
//! tracks side-channel.

use ciborium::value::Value;
use thiserror::Error;

use crate::codec::{CodecError, Writer, decode_value};

#[derive(Debug, Error)]
pub enum PacketDecodeError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("packet is not a map")]
    NotAMap,
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("malformed sub-request: {0}")]
    MalformedRequest(&'static str),
    #[error("malformed channel")]
    MalformedChannel,
}

/// `[u32 scheme, string value]` — identifies the logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub scheme: u32,
    pub value: String,
}

impl Channel {
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.scheme.into()),
            Value::Text(self.value.clone()),
        ])
    }

    fn from_value(value: &Value) -> Result<Self, PacketDecodeError> {
        let arr = value.as_array().ok_or(PacketDecodeError::MalformedChannel)?;
        if arr.len() != 2 {
            return Err(PacketDecodeError::MalformedChannel);
        }
        let scheme = arr[0]
            .as_integer()
            .and_then(|i| u32::try_from(i).ok())
            .ok_or(PacketDecodeError::MalformedChannel)?;
        let value = arr[1]
            .as_text()
            .ok_or(PacketDecodeError::MalformedChannel)?
            .to_string();
        Ok(Channel { scheme, value })
    }
}

/// `{"egs": u32, ...}` — other keys are preserved opaquely so a newer client
/// can carry fields this backend doesn't interpret.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Version {
    pub egs: u32,
    pub extra: Vec<(String, Value)>,
}

impl Version {
    fn from_value(value: &Value) -> Result<Self, PacketDecodeError> {
        let map = value
            .as_map()
            .ok_or(PacketDecodeError::MissingField("version"))?;
        let mut egs = 0u32;
        let mut extra = Vec::new();
        for (k, v) in map {
            let Some(key) = k.as_text() else { continue };
            if key == "egs" {
                egs = v.as_integer().and_then(|i| u32::try_from(i).ok()).unwrap_or(0);
            } else {
                extra.push((key.to_string(), v.clone()));
            }
        }
        Ok(Version { egs, extra })
    }

    pub fn to_value(&self) -> Value {
        let mut map = vec![(Value::Text("egs".into()), Value::Integer(self.egs.into()))];
        for (k, v) in &self.extra {
            map.push((Value::Text(k.clone()), v.clone()));
        }
        Value::Map(map)
    }
}

/// The sub-request `kind` enumeration (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Boot,
    Program,
    Stick,
    StickAuthority,
    Data,
    Jump,
    Metric,
    Expansion,
    UnsupportedVersion,
    SmallValue,
    Unknown(u8),
}

impl RequestKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Boot,
            1 => Self::Program,
            2 => Self::Stick,
            3 => Self::StickAuthority,
            4 => Self::Data,
            5 => Self::Jump,
            6 => Self::Metric,
            7 => Self::Expansion,
            8 => Self::UnsupportedVersion,
            9 => Self::SmallValue,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Boot => 0,
            Self::Program => 1,
            Self::Stick => 2,
            Self::StickAuthority => 3,
            Self::Data => 4,
            Self::Jump => 5,
            Self::Metric => 6,
            Self::Expansion => 7,
            Self::UnsupportedVersion => 8,
            Self::SmallValue => 9,
            Self::Unknown(v) => v,
        }
    }
}

/// One `(message_id, kind, payload)` triple from the inbound packet.
#[derive(Debug, Clone)]
pub struct SubRequest {
    pub id: u32,
    pub kind: RequestKind,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub channel: Channel,
    pub version: Version,
    pub requests: Vec<SubRequest>,
}

impl InboundPacket {
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketDecodeError> {
        let value = decode_value(bytes)?;
        Self::from_value(&value)
    }

    /// The `{channel, version, requests}` wire shape, used both to
    /// re-encode an inbound packet for a request log and to build the
    /// batched sub-packet a `RemoteDelegator` forwards to an upstream
    /// peer.
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("channel".into()), self.channel.to_value()),
            (Value::Text("version".into()), self.version.to_value()),
            (
                Value::Text("requests".into()),
                Value::Array(
                    self.requests
                        .iter()
                        .map(|r| {
                            Value::Array(vec![
                                Value::Integer(r.id.into()),
                                Value::Integer(r.kind.to_u8().into()),
                                r.payload.clone(),
                            ])
                        })
                        .collect(),
                ),
            ),
        ])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&self.to_value(), &mut buf).expect("inbound packet always encodes");
        buf
    }

    pub fn from_value(value: &Value) -> Result<Self, PacketDecodeError> {
        let map = value.as_map().ok_or(PacketDecodeError::NotAMap)?;
        let mut channel = None;
        let mut version = None;
        let mut requests_raw = None;
        for (k, v) in map {
            match k.as_text() {
                Some("channel") => channel = Some(Channel::from_value(v)?),
                Some("version") => version = Some(Version::from_value(v)?),
                Some("requests") => requests_raw = Some(v),
                _ => {}
            }
        }
        let channel = channel.ok_or(PacketDecodeError::MissingField("channel"))?;
        let version = version.unwrap_or_default();
        let requests_raw = requests_raw.ok_or(PacketDecodeError::MissingField("requests"))?;
        let arr = requests_raw
            .as_array()
            .ok_or(PacketDecodeError::MalformedRequest("requests is not an array"))?;
        let mut requests = Vec::with_capacity(arr.len());
        for item in arr {
            let triple = item
                .as_array()
                .ok_or(PacketDecodeError::MalformedRequest("sub-request is not an array"))?;
            if triple.len() != 3 {
                return Err(PacketDecodeError::MalformedRequest("sub-request needs 3 elements"));
            }
            let id = triple[0]
                .as_integer()
                .and_then(|i| u32::try_from(i).ok())
                .ok_or(PacketDecodeError::MalformedRequest("id is not a u32"))?;
            let kind = triple[1]
                .as_integer()
                .and_then(|i| u8::try_from(i).ok())
                .ok_or(PacketDecodeError::MalformedRequest("kind is not a u8"))?;
            requests.push(SubRequest {
                id,
                kind: RequestKind::from_u8(kind),
                payload: triple[2].clone(),
            });
        }
        Ok(InboundPacket { channel, version, requests })
    }
}

/// An already-encoded reply: `[kind, payload]` CBOR bytes for one sub-request.
#[derive(Debug, Clone)]
pub struct EncodedResponse {
    pub id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundPacket {
    pub responses: Vec<EncodedResponse>,
    /// Bundle descriptors, already CBOR-encoded (opaque to this crate).
    pub programs: Vec<Vec<u8>>,
    /// Pre-encoded tracks-packed fragments (own or merged from a peer).
    pub tracks_packed: Vec<Vec<u8>>,
}

impl OutboundPacket {
    /// Encode the packet, splicing each response/program/tracks fragment in
    /// verbatim rather than re-parsing it through the dynamic value tree.
    pub fn encode(&self) -> Vec<u8> {
        let has_tracks = !self.tracks_packed.is_empty();
        let mut w = Writer::new();
        w.write_map_header(if has_tracks { 3 } else { 2 });

        w.write_text("responses");
        w.write_array_header(self.responses.len() as u64);
        for r in &self.responses {
            w.write_array_header(2);
            w.write_uint(r.id as u64);
            w.write_raw(&r.payload);
        }

        w.write_text("programs");
        w.write_array_header(self.programs.len() as u64);
        for p in &self.programs {
            w.write_raw(p);
        }

        if has_tracks {
            w.write_text("tracks-packed");
            w.write_array_header(self.tracks_packed.len() as u64);
            for t in &self.tracks_packed {
                w.write_bytes(t);
            }
        }

        w.into_bytes()
    }

    /// Decode a peer's reply to a forwarded batch (the same
    /// `{responses, programs, tracks-packed}` shape `encode` produces),
    /// re-encoding each spliced fragment back to owned bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketDecodeError> {
        let value = decode_value(bytes)?;
        let map = value.as_map().ok_or(PacketDecodeError::NotAMap)?;
        let mut responses = Vec::new();
        let mut programs = Vec::new();
        let mut tracks_packed = Vec::new();
        for (k, v) in map {
            match k.as_text() {
                Some("responses") => {
                    let arr = v.as_array().ok_or(PacketDecodeError::MalformedRequest("responses is not an array"))?;
                    for item in arr {
                        let pair = item.as_array().ok_or(PacketDecodeError::MalformedRequest("response is not an array"))?;
                        if pair.len() != 2 {
                            return Err(PacketDecodeError::MalformedRequest("response needs 2 elements"));
                        }
                        let id = pair[0]
                            .as_integer()
                            .and_then(|i| u32::try_from(i).ok())
                            .ok_or(PacketDecodeError::MalformedRequest("response id is not a u32"))?;
                        let mut payload = Vec::new();
                        ciborium::ser::into_writer(&pair[1], &mut payload)
                            .map_err(|e| PacketDecodeError::Codec(CodecError::Decode(e.to_string())))?;
                        responses.push(EncodedResponse { id, payload });
                    }
                }
                Some("programs") => {
                    let arr = v.as_array().ok_or(PacketDecodeError::MalformedRequest("programs is not an array"))?;
                    for item in arr {
                        let mut bytes = Vec::new();
                        ciborium::ser::into_writer(item, &mut bytes)
                            .map_err(|e| PacketDecodeError::Codec(CodecError::Decode(e.to_string())))?;
                        programs.push(bytes);
                    }
                }
                Some("tracks-packed") => {
                    let arr = v.as_array().ok_or(PacketDecodeError::MalformedRequest("tracks-packed is not an array"))?;
                    for item in arr {
                        let bytes = item.as_bytes().ok_or(PacketDecodeError::MalformedRequest("tracks-packed entry is not bytes"))?;
                        tracks_packed.push(bytes.clone());
                    }
                }
                _ => {}
            }
        }
        Ok(OutboundPacket { responses, programs, tracks_packed })
    }
}
