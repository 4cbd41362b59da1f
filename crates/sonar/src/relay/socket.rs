// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pooled outbound sockets for the relay fan-out.
//!
//! One physical socket per [`PublicationTarget`]; the factory seam lets
//! tests substitute recording sockets for the UDP implementation.

use crate::protocol::PublicationTarget;
use crate::transport::{Endpoint, SendOutcome, UdpEndpoint};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddrV4;

/// One pooled outbound socket. Offers are best-effort: back-pressure and
/// transport failures are reported, not propagated.
pub trait RelaySocket: Send + Sync {
    /// Target this socket was opened for.
    fn target(&self) -> PublicationTarget;

    /// Offer a buffer to the destination.
    fn offer(&self, buffer: &[u8]) -> SendOutcome;

    /// Release the underlying socket.
    fn close(&self);
}

/// Opens pooled sockets on first use. Creation failure is the one relay
/// error that propagates to the caller: the reactor cannot recover from
/// resource exhaustion on its own.
pub trait SocketFactory: Send {
    fn open(&self, target: &PublicationTarget) -> io::Result<Box<dyn RelaySocket>>;
}

/// UDP-backed [`RelaySocket`].
pub struct UdpRelaySocket {
    target: PublicationTarget,
    endpoint: Mutex<UdpEndpoint>,
}

impl RelaySocket for UdpRelaySocket {
    fn target(&self) -> PublicationTarget {
        self.target
    }

    fn offer(&self, buffer: &[u8]) -> SendOutcome {
        self.endpoint.lock().send(buffer)
    }

    fn close(&self) {
        self.endpoint.lock().close();
    }
}

/// Production factory opening connected UDP sockets.
pub struct UdpSocketFactory;

impl SocketFactory for UdpSocketFactory {
    fn open(&self, target: &PublicationTarget) -> io::Result<Box<dyn RelaySocket>> {
        let endpoint = UdpEndpoint::connected(SocketAddrV4::new(target.addr, target.port))?;
        log::debug!("[relay] opened outbound socket target={}", target);
        Ok(Box::new(UdpRelaySocket {
            target: *target,
            endpoint: Mutex::new(endpoint),
        }))
    }
}
