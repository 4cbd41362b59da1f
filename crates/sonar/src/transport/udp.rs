// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP endpoint: unicast bind, multicast join, bounded receive.
//!
//! Socket setup goes through `socket2` (SO_REUSEADDR, multicast membership,
//! loopback) and then converts into a `std::net::UdpSocket`. The receive
//! path is bounded by a read timeout so that a reactor tick never blocks
//! longer than its poll budget.

use super::{Endpoint, SendOutcome};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Maximum UDP datagram we accept (just under the IPv4 payload ceiling).
const RECV_BUFFER_LEN: usize = 65_507;

/// UDP implementation of [`Endpoint`].
pub struct UdpEndpoint {
    socket: Option<UdpSocket>,
    /// Destination for `send()`; inbound-only endpoints have none.
    peer: Option<SocketAddr>,
    recv_buf: Box<[u8]>,
}

impl UdpEndpoint {
    /// Bind an inbound unicast endpoint. `poll_timeout` bounds each receive.
    pub fn unicast(bind: SocketAddrV4, poll_timeout: Duration) -> io::Result<Self> {
        let socket = Self::bind_socket(bind)?;
        socket.set_read_timeout(Some(poll_timeout))?;
        log::debug!("[udp] unicast endpoint bound addr={}", bind);
        Ok(Self {
            socket: Some(socket),
            peer: None,
            recv_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
        })
    }

    /// Bind an inbound endpoint joined to a multicast group on `iface`.
    ///
    /// Loopback is left enabled so that co-located publishers are sniffed
    /// like remote ones.
    pub fn multicast(
        group: Ipv4Addr,
        port: u16,
        iface: Ipv4Addr,
        poll_timeout: Duration,
    ) -> io::Result<Self> {
        if !group.is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a multicast group", group),
            ));
        }
        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let socket = Self::bind_socket(bind)?;
        socket.join_multicast_v4(&group, &iface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_read_timeout(Some(poll_timeout))?;
        log::debug!(
            "[udp] multicast endpoint joined group={} port={} iface={}",
            group,
            port,
            iface
        );
        Ok(Self {
            socket: Some(socket),
            peer: None,
            recv_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
        })
    }

    /// Open an outbound endpoint connected to `peer`. Sends are
    /// non-blocking; a full kernel buffer reports back-pressure instead of
    /// stalling the reactor.
    pub fn connected(peer: SocketAddrV4) -> io::Result<Self> {
        let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let socket = Self::bind_socket(bind)?;
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        log::debug!("[udp] outbound endpoint connected peer={}", peer);
        Ok(Self {
            socket: Some(socket),
            peer: Some(SocketAddr::V4(peer)),
            recv_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
        })
    }

    fn bind_socket(bind: SocketAddrV4) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(bind).into())?;
        Ok(socket.into())
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

impl Endpoint for UdpEndpoint {
    fn poll(
        &mut self,
        max_messages: usize,
        handler: &mut dyn FnMut(&[u8]),
    ) -> io::Result<usize> {
        let Some(socket) = self.socket.as_ref() else {
            return Ok(0);
        };
        let mut handled = 0;
        while handled < max_messages {
            match socket.recv_from(&mut self.recv_buf) {
                Ok((len, _from)) => {
                    handler(&self.recv_buf[..len]);
                    handled += 1;
                }
                // Timeout surfaces as WouldBlock or TimedOut depending on
                // the platform; both end the poll.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(handled)
    }

    fn send(&mut self, buffer: &[u8]) -> SendOutcome {
        let Some(socket) = self.socket.as_ref() else {
            return SendOutcome::Failed(io::Error::new(
                io::ErrorKind::NotConnected,
                "endpoint closed",
            ));
        };
        if self.peer.is_none() {
            return SendOutcome::Failed(io::Error::new(
                io::ErrorKind::NotConnected,
                "inbound-only endpoint",
            ));
        }
        // Connected socket: kernel already holds the destination.
        let result = socket.send(buffer);
        match result {
            Ok(sent) => SendOutcome::Sent(sent),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SendOutcome::BackPressured,
            Err(e) => SendOutcome::Failed(e),
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::debug!("[udp] endpoint closed peer={:?}", self.peer);
        }
    }
}
