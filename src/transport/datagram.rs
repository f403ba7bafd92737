//! Datagram transport: multicast join/leave, gather-send of header+payload,
//! peek/read, TTL and interface selection.

use crate::error::EngineError;
use crate::wire::{self, Flags, Header, HEADER_LEN, MAX_PACKET_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

/// Sender-side multicast endpoint: bound to a chosen interface with a
/// given TTL and `connect`ed to the multicast group so that `send`/
/// `send_gather` can be used without re-specifying the destination on
/// every call.
pub struct McastSender {
    socket: UdpSocket,
}

impl McastSender {
    /// Opens a sending endpoint bound to `iface` with the requested `ttl`,
    /// connected to `(group_addr, port)`.
    pub fn open(
        group_addr: Ipv4Addr,
        port: u16,
        ttl: u32,
        iface: Ipv4Addr,
    ) -> Result<McastSender, EngineError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(EngineError::SocketCreate)?;
        socket
            .bind(&SocketAddrV4::new(iface, 0).into())
            .map_err(EngineError::Bind)?;
        socket.set_multicast_ttl_v4(ttl).map_err(EngineError::Bind)?;
        socket.set_multicast_if_v4(&iface).map_err(EngineError::Bind)?;
        let dest: SocketAddr = SocketAddrV4::new(group_addr, port).into();
        socket.connect(&dest.into()).map_err(EngineError::Bind)?;
        Ok(McastSender { socket: socket.into() })
    }

    /// Emits `header` followed by `payload` as a single datagram.
    pub fn send_gather(&self, header: &Header, payload: &[u8]) -> std::io::Result<()> {
        debug_assert!(HEADER_LEN + payload.len() <= MAX_PACKET_LEN);
        let mut buf = [0u8; MAX_PACKET_LEN];
        wire::encode_header(&mut buf, header);
        buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        self.socket.send(&buf[..HEADER_LEN + payload.len()])?;
        Ok(())
    }
}

/// Receiver-side multicast endpoint: bound to `(*, port)` with membership
/// in the multicast group.
pub struct McastReceiver {
    socket: UdpSocket,
}

/// Outcome of peeking at the next queued datagram.
pub enum PeekResult {
    /// A well-formed header with a recognized `flags` value.
    Header(Header),
    /// The next datagram has an unrecognized `flags` value and must be
    /// consumed and discarded without interpretation.
    UnknownFlags,
}

impl McastReceiver {
    /// Joins the multicast group `(group_addr, port)` on `INADDR_ANY`.
    pub fn join(group_addr: Ipv4Addr, port: u16) -> Result<McastReceiver, EngineError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(EngineError::SocketCreate)?;
        socket.set_reuse_address(true).map_err(EngineError::Bind)?;
        socket
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
            .map_err(EngineError::Bind)?;
        socket
            .join_multicast_v4(&group_addr, &Ipv4Addr::UNSPECIFIED)
            .map_err(EngineError::Bind)?;
        Ok(McastReceiver { socket: socket.into() })
    }

    /// Bounds how long `peek_header`/`discard_next`/`read_into` block, so a
    /// caller polling a cancellation flag between calls has a bounded wait
    /// rather than an indefinite one. `None` restores blocking-forever.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> std::io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Returns the next datagram's decoded header without consuming the
    /// datagram: the following `recv_into` call will return the same
    /// datagram's bytes.
    pub fn peek_header(&self) -> std::io::Result<PeekResult> {
        let mut buf = [0u8; HEADER_LEN];
        self.socket.peek(&mut buf)?;
        match wire::decode_header(&buf) {
            Ok(Some(h)) => Ok(PeekResult::Header(h)),
            // A datagram shorter than HEADER_LEN can't carry a real RMTP
            // packet; treat it the same as an unrecognized one so the
            // caller discards it rather than looping on `peek`.
            Ok(None) | Err(_) => Ok(PeekResult::UnknownFlags),
        }
    }

    /// Consumes and discards the next queued datagram, whatever it is.
    /// Used both for unknown-flags datagrams and for discard-mode data
    /// delivery, where the full datagram must still be read off the wire.
    pub fn discard_next(&self) -> std::io::Result<usize> {
        let mut scratch = [0u8; MAX_PACKET_LEN];
        self.socket.recv(&mut scratch)
    }

    /// Performs a gather-read of the next datagram: the header is decoded
    /// from the front of the datagram, and the payload bytes (if any) are
    /// copied into `dst` starting at `dst_offset`. Returns the decoded
    /// header and the number of payload bytes copied.
    ///
    /// `dst` must have room for `dst_offset + payload_len`.
    pub fn read_into(
        &self,
        dst: &mut [u8],
        dst_offset: usize,
    ) -> std::io::Result<(Header, usize)> {
        let mut scratch = [0u8; MAX_PACKET_LEN];
        let n = self.socket.recv(&mut scratch)?;
        let header = match wire::decode_header(&scratch[..HEADER_LEN]) {
            Ok(Some(h)) => h,
            _ => {
                // Shouldn't happen if the caller peeked first, but guard
                // anyway: treat as a zero-length EOP-shaped no-op header so
                // callers have something consistent to discard.
                return Ok((
                    Header::new(0, 0, 0, Flags::Eop),
                    0,
                ));
            }
        };
        let payload_len = n.saturating_sub(HEADER_LEN);
        if payload_len > 0 {
            dst[dst_offset..dst_offset + payload_len]
                .copy_from_slice(&scratch[HEADER_LEN..HEADER_LEN + payload_len]);
        }
        Ok((header, payload_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Flags;
    use std::time::Duration;

    fn loopback_pair() -> (McastSender, McastReceiver, Ipv4Addr, u16) {
        // 127.0.0.1 is not a real multicast group, but for loopback
        // exercise of the gather-send/peek/read framing we bind a plain
        // UDP pair instead of joining a true multicast group, since CI
        // sandboxes often restrict multicast. The framing logic under
        // test doesn't care whether the destination is multicast.
        let recv_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = recv_socket.local_addr().unwrap();
        let send_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        send_socket.connect(addr).unwrap();
        recv_socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (
            McastSender { socket: send_socket },
            McastReceiver { socket: recv_socket },
            addr.ip().to_string().parse().unwrap(),
            addr.port(),
        )
    }

    #[test]
    fn send_gather_then_peek_then_read_round_trip() {
        let (sender, receiver, _, _) = loopback_pair();
        let header = Header::new(5, 1448, 100, Flags::MemData);
        let payload = vec![0xCDu8; 100];
        sender.send_gather(&header, &payload).unwrap();

        match receiver.peek_header().unwrap() {
            PeekResult::Header(h) => assert_eq!(h, header),
            PeekResult::UnknownFlags => panic!("expected a known header"),
        }
        // Peeking must not consume the datagram.
        match receiver.peek_header().unwrap() {
            PeekResult::Header(h) => assert_eq!(h, header),
            PeekResult::UnknownFlags => panic!("expected a known header"),
        }

        let mut dst = vec![0u8; 100];
        let (decoded, n) = receiver.read_into(&mut dst, 0).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(n, 100);
        assert_eq!(dst, payload);
    }

    #[test]
    fn unknown_flags_datagram_is_discardable() {
        let (sender, receiver, _, _) = loopback_pair();
        let mut buf = [0u8; HEADER_LEN];
        buf[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        sender.socket.send(&buf).unwrap();
        match receiver.peek_header().unwrap() {
            PeekResult::UnknownFlags => {}
            PeekResult::Header(h) => panic!("expected unknown flags, got {h:?}"),
        }
        let n = receiver.discard_next().unwrap();
        assert_eq!(n, HEADER_LEN);
    }
}
