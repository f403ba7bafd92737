//! Stream transport: reliable, ordered, bidirectional byte transport
//! between one receiver and the sender, framed as header+payload.

use crate::error::TransportError;
use crate::wire::{self, Header, HEADER_LEN};
use socket2::{SockRef, TcpKeepalive};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

/// Errno values the receiver's `connect` retries on.
fn is_retryable_connect_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        ConnectionRefused | TimedOut | ConnectionReset | HostUnreachable | AddrNotAvailable
    )
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const LISTEN_BACKLOG: i32 = 50;

/// One established, framed stream connection — shared by both sender and
/// receiver sides once the TCP handshake (or accept) has completed.
pub struct StreamConnection {
    stream: TcpStream,
}

impl StreamConnection {
    /// Receiver-side connect. Retries indefinitely with a fixed 30-second
    /// back-off on `ECONNREFUSED | ETIMEDOUT | ECONNRESET | EHOSTUNREACH`;
    /// any other error fails the call immediately.
    pub fn connect(addr: Ipv4Addr, port: u16) -> Result<StreamConnection, TransportError> {
        let target: SocketAddr = SocketAddrV4::new(addr, port).into();
        loop {
            match TcpStream::connect(target) {
                Ok(stream) => return Ok(StreamConnection { stream }),
                Err(e) if is_retryable_connect_error(&e) => {
                    log::warn!("stream connect to {target} failed ({e}), retrying in 30s");
                    std::thread::sleep(RECONNECT_BACKOFF);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn from_accepted(stream: TcpStream) -> StreamConnection {
        StreamConnection { stream }
    }

    /// Writes `header` followed by `payload` as one logical frame.
    pub fn send_framed(&mut self, header: &Header, payload: &[u8]) -> Result<(), TransportError> {
        let mut buf = vec![0u8; HEADER_LEN + payload.len()];
        wire::encode_header(&mut buf, header);
        buf[HEADER_LEN..].copy_from_slice(payload);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Blocks until exactly `HEADER_LEN` bytes are read, decodes them, and
    /// returns the header. A short read (peer closed mid-header) yields
    /// `PeerClosed`.
    pub fn recv_header(&mut self) -> Result<Header, TransportError> {
        let mut buf = [0u8; HEADER_LEN];
        self.read_exact_or_closed(&mut buf)?;
        match wire::decode_header(&buf) {
            Ok(Some(h)) => Ok(h),
            Ok(None) => Ok(Header::new(0, 0, 0, crate::wire::Flags::Eop)),
            Err(_) => Err(TransportError::ShortHeader { got: buf.len(), want: HEADER_LEN }),
        }
    }

    /// Reads exactly `len` bytes into `dst` at `dst_offset`.
    pub fn recv_payload_into(
        &mut self,
        dst: &mut [u8],
        dst_offset: usize,
        len: usize,
    ) -> Result<(), TransportError> {
        self.read_exact_or_closed(&mut dst[dst_offset..dst_offset + len])
    }

    fn read_exact_or_closed(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(TransportError::PeerClosed)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Underlying peer address, for logging.
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Clones the underlying stream handle so a second thread can drive
    /// reads while this one drives writes, or vice versa.
    pub fn try_clone(&self) -> std::io::Result<StreamConnection> {
        Ok(StreamConnection { stream: self.stream.try_clone()? })
    }
}

/// Sender-side listener: accepts per-receiver retransmission connections.
pub struct StreamListener {
    listener: TcpListener,
}

impl StreamListener {
    /// Binds to `(addr, port_hint)`; `port_hint == 0` lets the OS choose.
    /// Enables TCP keepalive with a 30-second interval and a backlog of 50.
    pub fn bind_and_listen(addr: Ipv4Addr, port_hint: u16) -> Result<StreamListener, TransportError> {
        let target: SocketAddr = SocketAddrV4::new(addr, port_hint).into();
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&target.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(StreamListener { listener: socket.into() })
    }

    /// The port the listener ended up bound to (useful when `port_hint`
    /// was `0`).
    pub fn local_port(&self) -> std::io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Switches the listener between blocking and non-blocking `accept()`.
    /// The sender's accept/coordinator thread uses non-blocking mode so it
    /// can poll a cancellation flag between `accept()` attempts, since
    /// plain `std::net` offers no way to interrupt a blocking `accept()`.
    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }

    /// Accepts the next pending connection, enables keepalive on it, and
    /// returns it. In non-blocking mode, returns
    /// `TransportError::Io` with `ErrorKind::WouldBlock` when no
    /// connection is pending.
    pub fn accept(&self) -> Result<StreamConnection, TransportError> {
        let (stream, _peer) = self.listener.accept()?;
        let sock_ref = SockRef::from(&stream);
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_INTERVAL)
            .with_interval(KEEPALIVE_INTERVAL);
        sock_ref.set_tcp_keepalive(&keepalive)?;
        Ok(StreamConnection::from_accepted(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Flags;

    #[test]
    fn send_framed_then_recv_header_and_payload_round_trip() {
        let listener = StreamListener::bind_and_listen(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = listener.local_port().unwrap();
        let client_thread = std::thread::spawn(move || {
            let mut conn = StreamConnection::connect(Ipv4Addr::LOCALHOST, port).unwrap();
            let header = Header::new(3, 1448, 5, Flags::RetxData);
            conn.send_framed(&header, &[1, 2, 3, 4, 5]).unwrap();
        });
        let mut server = listener.accept().unwrap();
        let header = server.recv_header().unwrap();
        assert_eq!(header, Header::new(3, 1448, 5, Flags::RetxData));
        let mut dst = vec![0u8; 5];
        server.recv_payload_into(&mut dst, 0, 5).unwrap();
        assert_eq!(dst, vec![1, 2, 3, 4, 5]);
        client_thread.join().unwrap();
    }

    #[test]
    fn recv_header_reports_peer_closed_on_short_read() {
        let listener = StreamListener::bind_and_listen(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = listener.local_port().unwrap();
        let client_thread = std::thread::spawn(move || {
            let conn = TcpStream::connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
            drop(conn);
        });
        let mut server = listener.accept().unwrap();
        client_thread.join().unwrap();
        let err = server.recv_header().unwrap_err();
        assert!(matches!(err, TransportError::PeerClosed));
    }
}
