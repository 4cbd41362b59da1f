// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay-side state: client groups, socket pool, fan-out set.
//!
//! N clients behind the same (address, port, endpoint) triple share one
//! outbound socket; removing one such client leaves the shared socket open
//! while others remain. The dense [`SwapSet`] of open sockets makes the
//! full-fanout loop allocation-free.

use super::socket::{RelaySocket, SocketFactory};
use crate::core::collections::{MultiMap, Shared, SwapSet};
use crate::protocol::{ClientId, PublicationTarget};
use crate::transport::SendOutcome;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Per-broadcast fan-out tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Sockets the buffer was offered to.
    pub offered: usize,
    /// Offers the transport accepted.
    pub delivered: usize,
    /// Offers refused by back-pressure or transport failure.
    pub failed: usize,
}

/// Client groups plus the pooled sockets serving them.
pub struct FanoutTable {
    /// Target -> client identifiers currently using it.
    clients: MultiMap<PublicationTarget, ClientId>,
    /// Target -> its pooled socket.
    sockets: HashMap<PublicationTarget, Shared<dyn RelaySocket>>,
    /// All open sockets, dense for full-fanout iteration.
    fanout: SwapSet<Shared<dyn RelaySocket>>,
    factory: Box<dyn SocketFactory>,
}

impl FanoutTable {
    pub fn new(factory: Box<dyn SocketFactory>) -> Self {
        Self {
            clients: MultiMap::new(),
            sockets: HashMap::new(),
            fanout: SwapSet::new(),
            factory,
        }
    }

    /// Record a newly registered client against its target, opening the
    /// pooled socket lazily.
    ///
    /// Returns `Ok(false)` if the same client identifier is already
    /// registered for that target: a duplicate registration is ignored as a
    /// consistency check, not refreshed.
    ///
    /// # Errors
    /// Socket creation failure propagates; the reactor cannot recover from
    /// resource exhaustion on its own.
    pub fn add_client(
        &mut self,
        client_id: ClientId,
        target: PublicationTarget,
    ) -> io::Result<bool> {
        if self.clients.contains(&target, &client_id) {
            log::warn!(
                "[relay] duplicate registration ignored client={} target={}",
                client_id,
                target
            );
            return Ok(false);
        }
        if !self.sockets.contains_key(&target) {
            let socket: Shared<dyn RelaySocket> =
                Shared::new(Arc::from(self.factory.open(&target)?));
            self.sockets.insert(target, socket.clone());
            self.fanout.insert(socket);
        }
        self.clients.insert(target, client_id);
        Ok(true)
    }

    /// Drop a client from its target's group. Closes and discards the
    /// pooled socket only when the group empties; returns whether it did.
    pub fn remove_client(&mut self, client_id: ClientId, target: PublicationTarget) -> bool {
        if !self.clients.remove(&target, &client_id) {
            return false;
        }
        if self.clients.contains_key(&target) {
            return false; // co-located clients still share the socket
        }
        if let Some(socket) = self.sockets.remove(&target) {
            self.fanout.remove(&socket);
            socket.close();
            log::debug!("[relay] closed outbound socket target={}", target);
        }
        true
    }

    /// Offer a raw frame to every open socket. Best-effort and unordered
    /// across destinations; per-socket failures are tolerated.
    pub fn relay(&mut self, buffer: &[u8]) -> FanoutReport {
        let mut report = FanoutReport::default();
        for socket in self.fanout.iter() {
            report.offered += 1;
            match socket.offer(buffer) {
                SendOutcome::Sent(_) => report.delivered += 1,
                SendOutcome::BackPressured => {
                    report.failed += 1;
                    log::debug!(
                        "[relay] back-pressure target={} len={}",
                        socket.target(),
                        buffer.len()
                    );
                }
                SendOutcome::Failed(err) => {
                    report.failed += 1;
                    log::debug!(
                        "[relay] send failed target={} err={}",
                        socket.target(),
                        err
                    );
                }
            }
        }
        report
    }

    /// Close every socket and drop all state. Used at shutdown.
    pub fn close_all(&mut self) {
        for socket in self.fanout.iter() {
            socket.close();
        }
        self.fanout.clear();
        self.sockets.clear();
        self.clients.clear();
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.fanout.len()
    }

    #[must_use]
    pub fn client_count(&self, target: &PublicationTarget) -> usize {
        self.clients.value_count(target)
    }

    #[must_use]
    pub fn has_socket(&self, target: &PublicationTarget) -> bool {
        self.sockets.contains_key(target)
    }
}
