//! Datagram and stream transport: the sockets RMTP rides on. Treats the
//! OS socket API as a black box; the modules here just wrap
//! `std::net`/`socket2` with the join/connect/gather-send/framed-read
//! shapes the engines need.

pub mod datagram;
pub mod stream;

pub use datagram::{McastReceiver, McastSender};
pub use stream::{StreamConnection, StreamListener};
