//! The genome-browser request pipeline: fingerprinting, cache discipline,
//! the tracks/programs registry, handler dispatch, remote delegation, and
//! the [`engine::PacketEngine`] that ties them together.
//!
//! `browser-protocol` owns the wire format; this crate owns what happens
//! to a decoded packet between arriving at the front door and leaving it
//! again as an [`browser_protocol::OutboundPacket`].

pub mod accessor;
pub mod bundle;
pub mod bundle_router;
pub mod cache;
pub mod data_router;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod expansion;
pub mod fingerprint;
pub mod handler;
pub mod immute;
pub mod metrics;
pub mod panel;
pub mod programs;
pub mod remote;
pub mod scope;
pub mod species;
pub mod tracks;

pub use accessor::DataAccessor;
pub use engine::PacketEngine;
pub use error::CoreError;
pub use handler::{Handler, HandlerContext, HandlerRegistry, Response};
