//! Wire protocol for the genome-browser request pipeline.
//!
//! Two things live here: the low-level [`codec`] (canonical CBOR encode/decode
//! plus the splice-friendly [`codec::Writer`]) and the [`packet`] data model
//! (inbound/outbound packets, channels, versions, sub-requests) that sits on
//! top of it. Everything above the HTTP layer (dispatch, caching, handlers)
//! lives in `browser-core`; this crate only knows how bytes become structured
//! values and back.

pub mod codec;
pub mod packet;

pub use codec::{CodecError, Writer, decode_value, encode_value};
pub use packet::{
    Channel, EncodedResponse, InboundPacket, OutboundPacket, RequestKind, SubRequest, Version,
    PacketDecodeError,
};
