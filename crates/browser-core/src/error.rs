//! The error taxonomy from spec.md §7, as one `thiserror`-derived enum per
//! layer, following the teacher's `FrameError`/`ProtocolError` split between
//! transport-fatal and message-recoverable errors.

use thiserror::Error;

/// Errors a data endpoint can raise; always caught at [`crate::data_router`]
/// and turned into a well-formed tagged error reply, never propagated to
/// the packet level. Mirrors `DataException` in
/// `original_source/backend-server/app/command/exceptionres.py`.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("{0}")]
    Message(String),
    #[error("unknown chromosome: {0}")]
    UnknownStick(String),
    #[error("no datafile specified")]
    MissingDatafile,
    #[error("request out of domain: {0}")]
    OutOfDomain(String),
}

impl DataError {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

/// Errors surfaced while resolving or invoking a remote peer.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Malformed packets / unknown sub-command kinds / unknown protocol
/// versions. These are reply-level (sub-command succeeds with an error
/// payload) except for a packet that fails to parse at all, which is the
/// only case that becomes an HTTP-level error (spec.md §7).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] browser_protocol::PacketDecodeError),
    #[error("unsupported command type ({0})")]
    UnsupportedCommandType(u8),
    #[error("unsupported egs version {0}")]
    UnsupportedVersion(u32),
}

/// The umbrella error type `browser-core`'s public API returns. Most
/// variants never reach an HTTP response; see §7's propagation rule.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("infrastructure degraded: {0}")]
    Infrastructure(String),
}
