// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay reactor: one thread, one tick = receive-and-register then relay.

use super::fanout::FanoutTable;
use super::socket::SocketFactory;
use crate::config::RelayConfig;
use crate::core::collections::{Shared, StagedSet};
use crate::core::lease::{LeaseEvent, LeaseRegistry};
use crate::protocol::{ClientId, ClientInfo, CodecError, Header, Message};
use crate::transport::Endpoint;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Relay reactor failures, split by recoverability: a failed poll is worth
/// retrying next tick, a failed socket open is not.
#[derive(Debug)]
pub enum RelayError {
    /// Inbound endpoint poll failed.
    Poll(io::Error),
    /// Opening a pooled outbound socket failed (resource exhaustion).
    SocketOpen(io::Error),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll(e) => write!(f, "inbound poll failed: {}", e),
            Self::SocketOpen(e) => write!(f, "outbound socket creation failed: {}", e),
        }
    }
}

impl std::error::Error for RelayError {}

/// Downstream observer of relay-client lifecycle events.
///
/// Callbacks run on the reactor thread; panics are caught at the invocation
/// boundary and logged. Updated-in-place registrations surface only as
/// `on_client_seen`.
pub trait RelayListener: Send + Sync {
    /// A client identifier was registered for the first time.
    fn on_client_added(&self, _info: &ClientInfo) {}

    /// A registration was decoded for this client (new or refresh). Useful
    /// for refreshing dependent state even without a topology change.
    fn on_client_seen(&self, _info: &ClientInfo) {}

    /// A client's lease lapsed and it was evicted.
    fn on_client_removed(&self, _info: &ClientInfo) {}
}

/// Reactor counters (relaxed atomics, read from any thread).
#[derive(Debug, Default)]
pub struct RelayStats {
    pub messages_relayed: AtomicU64,
    pub bytes_relayed: AtomicU64,
    pub relay_errors: AtomicU64,
    pub clients_added: AtomicU64,
    pub clients_expired: AtomicU64,
    pub dropped_messages: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub messages_relayed: u64,
    pub bytes_relayed: u64,
    pub relay_errors: u64,
    pub clients_added: u64,
    pub clients_expired: u64,
    pub dropped_messages: u64,
}

impl RelayStats {
    #[must_use]
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            relay_errors: self.relay_errors.load(Ordering::Relaxed),
            clients_added: self.clients_added.load(Ordering::Relaxed),
            clients_expired: self.clients_expired.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}

type Listeners = StagedSet<Shared<dyn RelayListener>>;

/// Single-threaded relay engine: all state owned by one reactor.
///
/// Exposed separately from [`RelayDaemon`] so embedders and tests can drive
/// ticks synchronously with an explicit clock.
pub struct RelayEngine {
    endpoint: Box<dyn Endpoint>,
    registry: LeaseRegistry<ClientId, ClientInfo>,
    fanout: FanoutTable,
    listeners: Arc<Listeners>,
    stats: Arc<RelayStats>,
    max_messages_per_tick: usize,
}

impl RelayEngine {
    pub fn new(
        config: &RelayConfig,
        endpoint: Box<dyn Endpoint>,
        factory: Box<dyn SocketFactory>,
    ) -> Self {
        Self {
            endpoint,
            registry: LeaseRegistry::new(config.client_timeout),
            fanout: FanoutTable::new(factory),
            listeners: Arc::new(StagedSet::new()),
            stats: Arc::new(RelayStats::default()),
            max_messages_per_tick: config.max_messages_per_tick,
        }
    }

    /// Handle for queueing listener changes from any thread.
    #[must_use]
    pub fn listeners(&self) -> Arc<Listeners> {
        Arc::clone(&self.listeners)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn registered_clients(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn open_sockets(&self) -> usize {
        self.fanout.socket_count()
    }

    /// One reactor tick: apply listener changes, drain the inbound
    /// endpoint, then check the eldest lease once.
    ///
    /// # Errors
    /// Socket-creation failure during a registration and inbound poll
    /// failures propagate; all transport-format problems are logged and
    /// dropped per message.
    pub fn tick(&mut self, now: Instant) -> Result<(), RelayError> {
        self.listeners.apply_pending();
        let Self {
            endpoint,
            registry,
            fanout,
            listeners,
            stats,
            max_messages_per_tick,
        } = self;

        let mut socket_failure: io::Result<()> = Ok(());
        endpoint
            .poll(*max_messages_per_tick, &mut |frame| {
                if socket_failure.is_err() {
                    return; // drain budget after a fatal failure, process nothing
                }
                if let Err(err) = handle_frame(frame, now, registry, fanout, listeners, stats) {
                    socket_failure = Err(err);
                }
            })
            .map_err(RelayError::Poll)?;
        socket_failure.map_err(RelayError::SocketOpen)?;

        if let Some(advert) = self.registry.expire_next(now) {
            let info = advert.payload;
            let closed = self.fanout.remove_client(info.client_id, info.target);
            log::info!(
                "[relay] client expired id={} target={} socket_closed={}",
                info.client_id,
                info.target,
                closed
            );
            self.stats.clients_expired.fetch_add(1, Ordering::Relaxed);
            notify(&self.listeners, |l| l.on_client_removed(&info));
        }
        Ok(())
    }

    /// Drop all registrations and close every socket. No notifications.
    pub fn shutdown(&mut self) {
        self.registry.clear();
        self.fanout.close_all();
        self.endpoint.close();
    }
}

/// Process one inbound frame: registration traffic feeds the registry,
/// everything else is relayed raw (payload-agnostic).
fn handle_frame(
    frame: &[u8],
    now: Instant,
    registry: &mut LeaseRegistry<ClientId, ClientInfo>,
    fanout: &mut FanoutTable,
    listeners: &Arc<Listeners>,
    stats: &Arc<RelayStats>,
) -> io::Result<()> {
    let header = match Header::peek(frame) {
        Ok(header) => header,
        Err(err) => {
            log::debug!("[relay] dropped malformed frame: {}", err);
            stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    if !header.is_compatible() {
        log::debug!(
            "[relay] dropped incompatible frame version={}",
            header.major
        );
        stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    if !header.is_client_registration() {
        // Relayed traffic stays opaque: no payload deserialization.
        let report = fanout.relay(frame);
        stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_relayed
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        stats
            .relay_errors
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        return Ok(());
    }

    let info = match Message::decode(frame) {
        Ok(Message::ClientRegistration(info)) => info,
        Ok(_) | Err(CodecError::UnknownKind(_)) => {
            // Kind byte said registration but the body disagreed.
            log::debug!("[relay] dropped inconsistent registration frame");
            stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Err(err) => {
            log::debug!("[relay] dropped undecodable registration: {}", err);
            stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };

    let previous_target = registry.get(&info.client_id).map(|c| c.target);
    match registry.upsert(info.client_id, info, now) {
        LeaseEvent::Inserted => {
            log::info!(
                "[relay] client registered id={} target={}",
                info.client_id,
                info.target
            );
            if fanout.add_client(info.client_id, info.target)? {
                stats.clients_added.fetch_add(1, Ordering::Relaxed);
            }
            notify(listeners, |l| l.on_client_added(&info));
        }
        LeaseEvent::Updated => {
            // A refresh carrying a new target migrates the client so the
            // old socket group does not hold it forever.
            if let Some(old_target) = previous_target {
                if old_target != info.target {
                    log::info!(
                        "[relay] client retargeted id={} old={} new={}",
                        info.client_id,
                        old_target,
                        info.target
                    );
                    fanout.remove_client(info.client_id, old_target);
                    fanout.add_client(info.client_id, info.target)?;
                }
            }
        }
    }
    notify(listeners, |l| l.on_client_seen(&info));
    Ok(())
}

/// Invoke a callback on every listener with panic isolation: a listener
/// error must never unwind into reactor control flow.
fn notify(listeners: &Arc<Listeners>, f: impl Fn(&dyn RelayListener)) {
    listeners.for_each(|listener| {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            f(&**listener);
        }));
        if result.is_err() {
            log::warn!("[relay] listener panicked during notification");
        }
    });
}

/// Relay daemon handle: owns the reactor thread.
///
/// The thread finishes its in-flight tick before exiting; dropping the
/// handle performs the same cooperative shutdown.
pub struct RelayDaemon {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    listeners: Arc<Listeners>,
    stats: Arc<RelayStats>,
}

impl RelayDaemon {
    /// Spawn the reactor thread around a fresh engine.
    #[must_use]
    pub fn spawn(
        config: RelayConfig,
        endpoint: Box<dyn Endpoint>,
        factory: Box<dyn SocketFactory>,
    ) -> Self {
        let engine = RelayEngine::new(&config, endpoint, factory);
        let listeners = engine.listeners();
        let stats = engine.stats();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || relay_loop(engine, shutdown_flag));
        Self {
            shutdown,
            handle: Some(handle),
            listeners,
            stats,
        }
    }

    /// Queue a listener for addition; materialized at the next tick.
    /// Returns the handle to pass to [`RelayDaemon::remove_listener`].
    pub fn add_listener(&self, listener: Arc<dyn RelayListener>) -> Shared<dyn RelayListener> {
        let shared = Shared::new(listener);
        self.listeners.queue_add(shared.clone());
        shared
    }

    pub fn remove_listener(&self, listener: &Shared<dyn RelayListener>) {
        self.listeners.queue_remove(listener);
    }

    #[must_use]
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal the reactor to stop and wait for the in-flight tick.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RelayDaemon {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn relay_loop(mut engine: RelayEngine, shutdown: Arc<AtomicBool>) {
    log::info!("[relay] reactor started");
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        match engine.tick(now) {
            Ok(()) => {}
            Err(err @ RelayError::Poll(_)) => {
                log::warn!("[relay] {}", err);
            }
            Err(err @ RelayError::SocketOpen(_)) => {
                // Resource exhaustion is not recoverable from inside the
                // reactor; fail loudly and stop.
                log::error!("[relay] unrecoverable, stopping: {}", err);
                break;
            }
        }
    }
    engine.shutdown();
    log::info!("[relay] reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PublicationTarget;
    use crate::transport::SendOutcome;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    /// Endpoint replaying a scripted frame sequence.
    struct ScriptedEndpoint {
        frames: VecDeque<Vec<u8>>,
    }

    impl ScriptedEndpoint {
        fn new() -> Self {
            Self {
                frames: VecDeque::new(),
            }
        }

        fn push(&mut self, frame: Vec<u8>) {
            self.frames.push_back(frame);
        }
    }

    impl Endpoint for ScriptedEndpoint {
        fn poll(
            &mut self,
            max_messages: usize,
            handler: &mut dyn FnMut(&[u8]),
        ) -> io::Result<usize> {
            let mut handled = 0;
            while handled < max_messages {
                let Some(frame) = self.frames.pop_front() else {
                    break;
                };
                handler(&frame);
                handled += 1;
            }
            Ok(handled)
        }

        fn send(&mut self, _buffer: &[u8]) -> SendOutcome {
            SendOutcome::BackPressured
        }

        fn close(&mut self) {}
    }

    struct NullSocket(PublicationTarget);

    impl super::super::socket::RelaySocket for NullSocket {
        fn target(&self) -> PublicationTarget {
            self.0
        }
        fn offer(&self, buffer: &[u8]) -> SendOutcome {
            SendOutcome::Sent(buffer.len())
        }
        fn close(&self) {}
    }

    struct NullFactory;

    impl SocketFactory for NullFactory {
        fn open(&self, target: &PublicationTarget) -> io::Result<Box<dyn super::super::socket::RelaySocket>> {
            Ok(Box::new(NullSocket(*target)))
        }
    }

    #[derive(Default)]
    struct CountingListener {
        added: Mutex<Vec<u64>>,
        seen: Mutex<Vec<u64>>,
        removed: Mutex<Vec<u64>>,
    }

    impl RelayListener for CountingListener {
        fn on_client_added(&self, info: &ClientInfo) {
            self.added.lock().push(info.client_id);
        }
        fn on_client_seen(&self, info: &ClientInfo) {
            self.seen.lock().push(info.client_id);
        }
        fn on_client_removed(&self, info: &ClientInfo) {
            self.removed.lock().push(info.client_id);
        }
    }

    fn registration(client_id: u64, last_octet: u8) -> Vec<u8> {
        let msg = Message::ClientRegistration(ClientInfo {
            client_id,
            target: PublicationTarget {
                addr: Ipv4Addr::new(10, 0, 0, last_octet),
                port: 9000,
                endpoint_id: 1,
            },
        });
        let mut buf = vec![0u8; 64];
        let len = msg.encode(&mut buf).expect("encode registration");
        buf.truncate(len);
        buf
    }

    fn engine_with(frames: Vec<Vec<u8>>) -> (RelayEngine, Arc<CountingListener>) {
        let mut endpoint = ScriptedEndpoint::new();
        for frame in frames {
            endpoint.push(frame);
        }
        let config = RelayConfig {
            client_timeout: Duration::from_millis(500),
            ..RelayConfig::default()
        };
        let engine = RelayEngine::new(&config, Box::new(endpoint), Box::new(NullFactory));
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn RelayListener> = listener.clone();
        engine.listeners().queue_add(Shared::new(as_dyn));
        (engine, listener)
    }

    #[test]
    fn test_registration_emits_added_then_seen() {
        let (mut engine, listener) = engine_with(vec![registration(1, 1)]);
        engine.tick(Instant::now()).expect("tick");
        assert_eq!(*listener.added.lock(), vec![1]);
        assert_eq!(*listener.seen.lock(), vec![1]);
        assert_eq!(engine.registered_clients(), 1);
        assert_eq!(engine.open_sockets(), 1);
    }

    #[test]
    fn test_refresh_emits_seen_only() {
        let (mut engine, listener) = engine_with(vec![registration(1, 1), registration(1, 1)]);
        engine.tick(Instant::now()).expect("tick");
        assert_eq!(*listener.added.lock(), vec![1]);
        assert_eq!(*listener.seen.lock(), vec![1, 1]);
        assert_eq!(engine.registered_clients(), 1);
    }

    #[test]
    fn test_expiry_emits_removed() {
        let base = Instant::now();
        let (mut engine, listener) = engine_with(vec![registration(1, 1)]);
        engine.tick(base).expect("tick");
        engine.tick(base + Duration::from_millis(600)).expect("tick");
        assert_eq!(*listener.removed.lock(), vec![1]);
        assert_eq!(engine.registered_clients(), 0);
        assert_eq!(engine.open_sockets(), 0);
    }

    #[test]
    fn test_malformed_frames_dropped_not_fatal() {
        let (mut engine, listener) = engine_with(vec![
            vec![0xFF, 0xFF, 0x00],
            registration(1, 1),
        ]);
        engine.tick(Instant::now()).expect("tick survives bad frame");
        assert_eq!(*listener.added.lock(), vec![1]);
        assert_eq!(engine.stats().snapshot().dropped_messages, 1);
    }

    #[test]
    fn test_incompatible_version_dropped() {
        let mut frame = registration(1, 1);
        frame[2] = 0x7F; // future major version
        let (mut engine, listener) = engine_with(vec![frame]);
        engine.tick(Instant::now()).expect("tick");
        assert!(listener.added.lock().is_empty());
        assert_eq!(engine.stats().snapshot().dropped_messages, 1);
    }

    #[test]
    fn test_non_registration_traffic_relayed() {
        let mut payload = vec![0u8; 64];
        let len = Message::TopicAdvert(crate::protocol::TopicInfo { name: "t".into() })
            .encode(&mut payload)
            .expect("encode");
        payload.truncate(len);
        let (mut engine, _listener) =
            engine_with(vec![registration(1, 1), payload]);
        engine.tick(Instant::now()).expect("tick");
        let stats = engine.stats().snapshot();
        assert_eq!(stats.messages_relayed, 1);
        assert!(stats.bytes_relayed > 0);
    }

    #[test]
    fn test_panicking_listener_isolated() {
        struct PanickingListener;
        impl RelayListener for PanickingListener {
            fn on_client_added(&self, _info: &ClientInfo) {
                panic!("listener bug");
            }
        }
        let (mut engine, listener) = engine_with(vec![registration(1, 1)]);
        let panicking: Arc<dyn RelayListener> = Arc::new(PanickingListener);
        engine.listeners().queue_add(Shared::new(panicking));
        engine.tick(Instant::now()).expect("tick survives panic");
        // The well-behaved listener still observed the event.
        assert_eq!(*listener.added.lock(), vec![1]);
    }

    #[test]
    fn test_retarget_migrates_socket_group() {
        let (mut engine, _listener) =
            engine_with(vec![registration(1, 1), registration(1, 2)]);
        engine.tick(Instant::now()).expect("tick");
        // Old target group emptied, its socket closed; one socket remains.
        assert_eq!(engine.open_sockets(), 1);
        assert_eq!(engine.registered_clients(), 1);
    }

    #[test]
    fn test_daemon_spawn_and_shutdown() {
        let endpoint = ScriptedEndpoint::new();
        let daemon = RelayDaemon::spawn(
            RelayConfig::default(),
            Box::new(endpoint),
            Box::new(NullFactory),
        );
        let snapshot = daemon.stats();
        assert_eq!(snapshot.clients_added, 0);
        daemon.shutdown();
    }
}
