//! RMTP: a reliable multicast transfer protocol engine.
//!
//! A sender multicasts a stream of uniquely indexed *products* to a dynamic
//! set of receivers over UDP multicast, and recovers losses through
//! per-receiver TCP unicast retransmission channels. Receivers deliver each
//! product's bytes to their application exactly once, or report it missed
//! after a bounded timeout.
//!
//! The crate is organized around the four subsystems that make up the
//! protocol core: the wire framing ([`wire`]), the sender engine
//! ([`sender`]), the receiver engine ([`receiver`]), and the shared
//! transport/concurrency plumbing ([`transport`], [`registry`]).

pub mod bitmap;
pub mod config;
pub mod delay_queue;
pub mod error;
pub mod notify;
pub mod rate_shaper;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::{EngineError, TransportError, WireError};
pub use notify::{ReceiveBuffer, ReceiverNotifier, SenderNotifier};
pub use receiver::ReceiverEngine;
pub use sender::SenderEngine;
pub use wire::{Flags, Header, DATA_LEN, HEADER_LEN, MAX_PACKET_LEN, META_MAX};
