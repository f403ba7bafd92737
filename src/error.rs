//! Typed error kinds for the three error-handling tiers described in the
//! design: wire framing errors, transport errors, and engine-fatal
//! (resource/misuse) errors. Losses are never modeled as errors here — a
//! missed product is reported to the application through a notifier
//! callback, not a `Result`.

use thiserror::Error;

/// Errors raised while decoding a packet header or validating its framing.
/// These are never fatal: the caller drops the offending datagram/frame and
/// continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("packet too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("declared payload length {declared} does not match actual {actual}")]
    PayloadLenMismatch { declared: u16, actual: u16 },

    #[error("BOP metadata size {size} exceeds maximum {max}")]
    MetadataTooLarge { size: usize, max: usize },
}

/// Errors from the datagram or stream transport. Transient instances
/// (`Io`, `PeerClosed`) are handled locally: the receiver reconnects, the
/// sender drops the connection and releases the receiver from retention.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("frame header truncated: got {got} of {want} bytes")]
    ShortHeader { got: usize, want: usize },
}

/// Fatal, engine-level errors. These are the only errors captured by the
/// [`crate::registry::ExceptionCell`] and rethrown by `start`/`stop`/
/// `send_product`. Everything else (parse errors, transient transport
/// errors) is handled at the point it occurs and never reaches this type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to create socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("send_product called with a null/empty payload and non-zero size")]
    NullPayload,

    #[error("metadata size {size} exceeds maximum {max}")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("engine operation attempted after stop()")]
    StoppedEngine,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
