// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast sniffer: read-only discovery observer.
//!
//! Runs three independent liveness registries (peer, topic, topic-endpoint)
//! over the same polling pattern as the relay daemon, with no relay side.
//! One tick decodes one batch of inbound adverts, dispatches each by
//! variant to its registry, then checks the three registries' eldest
//! leases in a fixed order (topic, topic-endpoint, peer) so that under
//! load no registry starves another; each check is O(1) regardless of
//! outcome.

use crate::config::SnifferConfig;
use crate::core::collections::{Shared, StagedSet};
use crate::core::lease::{LeaseEvent, LeaseRegistry};
use crate::protocol::{Message, PeerId, PeerInfo, TopicEndpointInfo, TopicInfo};
use crate::transport::Endpoint;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Key of a topic-endpoint advert: one endpoint of one peer on one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicEndpointKey {
    pub topic: String,
    pub peer_id: PeerId,
    pub endpoint_id: u32,
}

impl TopicEndpointKey {
    fn of(info: &TopicEndpointInfo) -> Self {
        Self {
            topic: info.topic.clone(),
            peer_id: info.peer_id,
            endpoint_id: info.endpoint_id,
        }
    }
}

/// Downstream observer of discovery events.
///
/// Callbacks run on the sniffer thread; panics are caught and logged.
/// Refreshes (Updated-in-place) are silent by design.
pub trait SnifferListener: Send + Sync {
    fn on_peer_added(&self, _info: &PeerInfo) {}
    fn on_peer_expired(&self, _info: &PeerInfo) {}
    fn on_topic_added(&self, _info: &TopicInfo) {}
    fn on_topic_expired(&self, _info: &TopicInfo) {}
    fn on_topic_endpoint_added(&self, _info: &TopicEndpointInfo) {}
    fn on_topic_endpoint_expired(&self, _info: &TopicEndpointInfo) {}
}

/// Sniffer counters (relaxed atomics, read from any thread).
#[derive(Debug, Default)]
pub struct SnifferStats {
    pub adverts_applied: AtomicU64,
    pub dropped_messages: AtomicU64,
    pub expiries: AtomicU64,
}

/// Point-in-time copy of [`SnifferStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnifferStatsSnapshot {
    pub adverts_applied: u64,
    pub dropped_messages: u64,
    pub expiries: u64,
}

impl SnifferStats {
    #[must_use]
    pub fn snapshot(&self) -> SnifferStatsSnapshot {
        SnifferStatsSnapshot {
            adverts_applied: self.adverts_applied.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            expiries: self.expiries.load(Ordering::Relaxed),
        }
    }
}

type Listeners = StagedSet<Shared<dyn SnifferListener>>;

/// Single-threaded sniffer engine. Exposed separately from [`Sniffer`] so
/// embedders and tests can drive ticks synchronously with an explicit
/// clock.
pub struct SnifferEngine {
    endpoint: Box<dyn Endpoint>,
    peers: LeaseRegistry<PeerId, PeerInfo>,
    topics: LeaseRegistry<String, TopicInfo>,
    topic_endpoints: LeaseRegistry<TopicEndpointKey, TopicEndpointInfo>,
    listeners: Arc<Listeners>,
    stats: Arc<SnifferStats>,
    max_messages_per_tick: usize,
}

impl SnifferEngine {
    pub fn new(config: &SnifferConfig, endpoint: Box<dyn Endpoint>) -> Self {
        Self {
            endpoint,
            peers: LeaseRegistry::new(config.peer_timeout),
            topics: LeaseRegistry::new(config.topic_timeout),
            topic_endpoints: LeaseRegistry::new(config.topic_endpoint_timeout),
            listeners: Arc::new(StagedSet::new()),
            stats: Arc::new(SnifferStats::default()),
            max_messages_per_tick: config.max_messages_per_tick,
        }
    }

    #[must_use]
    pub fn listeners(&self) -> Arc<Listeners> {
        Arc::clone(&self.listeners)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<SnifferStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    #[must_use]
    pub fn topic_endpoint_count(&self) -> usize {
        self.topic_endpoints.len()
    }

    /// One reactor tick: apply listener changes, drain inbound adverts,
    /// then check each registry's eldest lease once in fixed order.
    pub fn tick(&mut self, now: Instant) -> io::Result<()> {
        self.listeners.apply_pending();
        let Self {
            endpoint,
            peers,
            topics,
            topic_endpoints,
            listeners,
            stats,
            max_messages_per_tick,
        } = self;

        endpoint.poll(*max_messages_per_tick, &mut |frame| {
            dispatch(frame, now, peers, topics, topic_endpoints, listeners, stats);
        })?;

        // Fixed order: topic, then topic-endpoint, then peer.
        if let Some(advert) = self.topics.expire_next(now) {
            log::info!("[sniffer] topic expired name={}", advert.payload.name);
            self.stats.expiries.fetch_add(1, Ordering::Relaxed);
            notify(&self.listeners, |l| l.on_topic_expired(&advert.payload));
        }
        if let Some(advert) = self.topic_endpoints.expire_next(now) {
            log::info!(
                "[sniffer] topic-endpoint expired topic={} peer={} endpoint={}",
                advert.payload.topic,
                advert.payload.peer_id,
                advert.payload.endpoint_id
            );
            self.stats.expiries.fetch_add(1, Ordering::Relaxed);
            notify(&self.listeners, |l| {
                l.on_topic_endpoint_expired(&advert.payload)
            });
        }
        if let Some(advert) = self.peers.expire_next(now) {
            log::info!("[sniffer] peer expired id={}", advert.payload.peer_id);
            self.stats.expiries.fetch_add(1, Ordering::Relaxed);
            notify(&self.listeners, |l| l.on_peer_expired(&advert.payload));
        }
        Ok(())
    }

    /// Drop all registries without notification and release the endpoint.
    pub fn shutdown(&mut self) {
        self.peers.clear();
        self.topics.clear();
        self.topic_endpoints.clear();
        self.endpoint.close();
    }
}

/// Dispatch one inbound frame to the registry matching its declared type.
/// Unknown or incompatible messages are dropped and logged, never
/// propagated as errors.
fn dispatch(
    frame: &[u8],
    now: Instant,
    peers: &mut LeaseRegistry<PeerId, PeerInfo>,
    topics: &mut LeaseRegistry<String, TopicInfo>,
    topic_endpoints: &mut LeaseRegistry<TopicEndpointKey, TopicEndpointInfo>,
    listeners: &Arc<Listeners>,
    stats: &Arc<SnifferStats>,
) {
    let message = match Message::decode(frame) {
        Ok(message) => message,
        Err(err) => {
            log::debug!("[sniffer] dropped frame: {}", err);
            stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    match message {
        Message::PeerAdvert(info) => {
            if peers.upsert(info.peer_id, info, now) == LeaseEvent::Inserted {
                log::info!("[sniffer] peer discovered id={}", info.peer_id);
                notify(listeners, |l| l.on_peer_added(&info));
            }
            stats.adverts_applied.fetch_add(1, Ordering::Relaxed);
        }
        Message::TopicAdvert(info) => {
            if topics.upsert(info.name.clone(), info.clone(), now) == LeaseEvent::Inserted {
                log::info!("[sniffer] topic discovered name={}", info.name);
                notify(listeners, |l| l.on_topic_added(&info));
            }
            stats.adverts_applied.fetch_add(1, Ordering::Relaxed);
        }
        Message::TopicEndpointAdvert(info) => {
            let key = TopicEndpointKey::of(&info);
            if topic_endpoints.upsert(key, info.clone(), now) == LeaseEvent::Inserted {
                log::info!(
                    "[sniffer] topic-endpoint discovered topic={} peer={} endpoint={}",
                    info.topic,
                    info.peer_id,
                    info.endpoint_id
                );
                notify(listeners, |l| l.on_topic_endpoint_added(&info));
            }
            stats.adverts_applied.fetch_add(1, Ordering::Relaxed);
        }
        Message::ClientRegistration(_) | Message::Request(_) | Message::Response(_) => {
            // Not discovery traffic; a sniffer observes adverts only.
            log::debug!("[sniffer] ignored non-advert frame");
            stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Invoke a callback on every listener with panic isolation.
fn notify(listeners: &Arc<Listeners>, f: impl Fn(&dyn SnifferListener)) {
    listeners.for_each(|listener| {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            f(&**listener);
        }));
        if result.is_err() {
            log::warn!("[sniffer] listener panicked during notification");
        }
    });
}

/// Sniffer handle: owns the reactor thread. Cooperative shutdown on drop.
pub struct Sniffer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    listeners: Arc<Listeners>,
    stats: Arc<SnifferStats>,
}

impl Sniffer {
    /// Spawn the sniffer thread around a fresh engine.
    #[must_use]
    pub fn spawn(config: SnifferConfig, endpoint: Box<dyn Endpoint>) -> Self {
        let engine = SnifferEngine::new(&config, endpoint);
        let listeners = engine.listeners();
        let stats = engine.stats();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let handle = thread::spawn(move || sniffer_loop(engine, shutdown_flag));
        Self {
            shutdown,
            handle: Some(handle),
            listeners,
            stats,
        }
    }

    /// Queue a listener for addition; materialized at the next tick.
    pub fn add_listener(&self, listener: Arc<dyn SnifferListener>) -> Shared<dyn SnifferListener> {
        let shared = Shared::new(listener);
        self.listeners.queue_add(shared.clone());
        shared
    }

    pub fn remove_listener(&self, listener: &Shared<dyn SnifferListener>) {
        self.listeners.queue_remove(listener);
    }

    #[must_use]
    pub fn stats(&self) -> SnifferStatsSnapshot {
        self.stats.snapshot()
    }

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

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn sniffer_loop(mut engine: SnifferEngine, shutdown: Arc<AtomicBool>) {
    log::info!("[sniffer] reactor started");
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if let Err(err) = engine.tick(now) {
            log::warn!("[sniffer] poll failed: {}", err);
        }
    }
    engine.shutdown();
    log::info!("[sniffer] reactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SendOutcome;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct ScriptedEndpoint {
        frames: VecDeque<Vec<u8>>,
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

    #[derive(Default)]
    struct RecordingListener {
        peers_added: Mutex<Vec<PeerId>>,
        peers_expired: Mutex<Vec<PeerId>>,
        topics_added: Mutex<Vec<String>>,
        topics_expired: Mutex<Vec<String>>,
        endpoints_added: Mutex<Vec<u32>>,
        endpoints_expired: Mutex<Vec<u32>>,
    }

    impl SnifferListener for RecordingListener {
        fn on_peer_added(&self, info: &PeerInfo) {
            self.peers_added.lock().push(info.peer_id);
        }
        fn on_peer_expired(&self, info: &PeerInfo) {
            self.peers_expired.lock().push(info.peer_id);
        }
        fn on_topic_added(&self, info: &TopicInfo) {
            self.topics_added.lock().push(info.name.clone());
        }
        fn on_topic_expired(&self, info: &TopicInfo) {
            self.topics_expired.lock().push(info.name.clone());
        }
        fn on_topic_endpoint_added(&self, info: &TopicEndpointInfo) {
            self.endpoints_added.lock().push(info.endpoint_id);
        }
        fn on_topic_endpoint_expired(&self, info: &TopicEndpointInfo) {
            self.endpoints_expired.lock().push(info.endpoint_id);
        }
    }

    fn encode(msg: &Message) -> Vec<u8> {
        let mut buf = vec![0u8; 512];
        let len = msg.encode(&mut buf).expect("encode");
        buf.truncate(len);
        buf
    }

    fn peer_advert(peer_id: PeerId) -> Vec<u8> {
        encode(&Message::PeerAdvert(PeerInfo {
            peer_id,
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 9000,
        }))
    }

    fn topic_advert(name: &str) -> Vec<u8> {
        encode(&Message::TopicAdvert(TopicInfo { name: name.into() }))
    }

    fn endpoint_advert(topic: &str, peer_id: PeerId, endpoint_id: u32) -> Vec<u8> {
        encode(&Message::TopicEndpointAdvert(TopicEndpointInfo {
            topic: topic.into(),
            peer_id,
            endpoint_id,
        }))
    }

    fn engine_with(frames: Vec<Vec<u8>>) -> (SnifferEngine, Arc<RecordingListener>) {
        let endpoint = ScriptedEndpoint {
            frames: frames.into(),
        };
        let config = SnifferConfig {
            peer_timeout: Duration::from_millis(500),
            topic_timeout: Duration::from_millis(500),
            topic_endpoint_timeout: Duration::from_millis(500),
            ..SnifferConfig::default()
        };
        let engine = SnifferEngine::new(&config, Box::new(endpoint));
        let listener = Arc::new(RecordingListener::default());
        let as_dyn: Arc<dyn SnifferListener> = listener.clone();
        engine.listeners().queue_add(Shared::new(as_dyn));
        (engine, listener)
    }

    #[test]
    fn test_adverts_reach_their_registries() {
        let (mut engine, listener) = engine_with(vec![
            peer_advert(1),
            topic_advert("sensor/temperature"),
            endpoint_advert("sensor/temperature", 1, 3),
        ]);
        engine.tick(Instant::now()).expect("tick");
        assert_eq!(engine.peer_count(), 1);
        assert_eq!(engine.topic_count(), 1);
        assert_eq!(engine.topic_endpoint_count(), 1);
        assert_eq!(*listener.peers_added.lock(), vec![1]);
        assert_eq!(
            *listener.topics_added.lock(),
            vec!["sensor/temperature".to_string()]
        );
        assert_eq!(*listener.endpoints_added.lock(), vec![3]);
    }

    #[test]
    fn test_refresh_is_silent() {
        let (mut engine, listener) = engine_with(vec![peer_advert(1), peer_advert(1)]);
        engine.tick(Instant::now()).expect("tick");
        assert_eq!(listener.peers_added.lock().len(), 1);
        assert_eq!(engine.peer_count(), 1);
        assert_eq!(engine.stats().snapshot().adverts_applied, 2);
    }

    #[test]
    fn test_expiry_order_topic_endpoint_peer() {
        let base = Instant::now();
        let (mut engine, listener) = engine_with(vec![
            peer_advert(1),
            topic_advert("t"),
            endpoint_advert("t", 1, 7),
        ]);
        engine.tick(base).expect("tick");
        // All three lapse together; one tick reaps one entry per registry.
        engine.tick(base + Duration::from_millis(600)).expect("tick");
        assert_eq!(*listener.topics_expired.lock(), vec!["t".to_string()]);
        assert_eq!(*listener.endpoints_expired.lock(), vec![7]);
        assert_eq!(*listener.peers_expired.lock(), vec![1]);
        assert_eq!(engine.peer_count(), 0);
        assert_eq!(engine.topic_count(), 0);
        assert_eq!(engine.topic_endpoint_count(), 0);
    }

    #[test]
    fn test_refresh_defers_expiry() {
        let base = Instant::now();
        let (mut engine, listener) = engine_with(vec![peer_advert(1)]);
        engine.tick(base).expect("tick");
        // Refresh at 400ms; the peer must survive the 600ms check.
        let endpoint = ScriptedEndpoint {
            frames: VecDeque::from(vec![peer_advert(1)]),
        };
        engine.endpoint = Box::new(endpoint);
        engine.tick(base + Duration::from_millis(400)).expect("tick");
        engine.tick(base + Duration::from_millis(600)).expect("tick");
        assert!(listener.peers_expired.lock().is_empty());
        engine.tick(base + Duration::from_millis(900)).expect("tick");
        assert_eq!(*listener.peers_expired.lock(), vec![1]);
    }

    #[test]
    fn test_non_advert_traffic_ignored() {
        let registration = encode(&Message::ClientRegistration(crate::protocol::ClientInfo {
            client_id: 1,
            target: crate::protocol::PublicationTarget {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                port: 9000,
                endpoint_id: 1,
            },
        }));
        let (mut engine, _listener) = engine_with(vec![registration, vec![0x00, 0x01]]);
        engine.tick(Instant::now()).expect("tick");
        assert_eq!(engine.peer_count(), 0);
        assert_eq!(engine.stats().snapshot().dropped_messages, 2);
    }

    #[test]
    fn test_distinct_endpoints_same_topic() {
        let (mut engine, listener) = engine_with(vec![
            endpoint_advert("t", 1, 1),
            endpoint_advert("t", 1, 2),
            endpoint_advert("t", 2, 1),
        ]);
        engine.tick(Instant::now()).expect("tick");
        assert_eq!(engine.topic_endpoint_count(), 3);
        assert_eq!(listener.endpoints_added.lock().len(), 3);
    }
}
