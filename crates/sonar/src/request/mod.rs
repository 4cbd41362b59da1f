// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Asynchronous request manager: correlation of outbound requests with
//! zero-or-more responses under individually resettable expiries.
//!
//! The registry pattern of the discovery reactors, specialized for
//! correlation: a background reaper full-scans all tracked requests each
//! sweep (requests do not share one fixed timeout, so a head-only check
//! does not apply). A request is owned jointly by the issuing caller,
//! which may close it early or extend its expiry from any thread, and by
//! the reaper, which evicts it on expiry.

use crate::config::RequestConfig;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::ResponseInfo;

/// Response delivery callback. Runs on whichever thread feeds
/// [`RequestManager::process_response`].
pub type ResponseCallback = Box<dyn Fn(&SentRequest, &ResponseInfo) + Send + Sync>;
/// Timeout callback. Runs on the reaper thread.
pub type TimeoutCallback = Box<dyn Fn(&SentRequest) + Send + Sync>;

/// An outbound request awaiting correlated responses.
///
/// State is atomic because close/extend may race the reaper: the closed
/// flag, response counter, and expiry are each independently synchronized.
pub struct SentRequest {
    correlation_id: u64,
    /// Shared epoch of the owning manager; expiries are nanos past it.
    epoch: Instant,
    expires_at_ns: AtomicU64,
    closed: AtomicBool,
    responses: AtomicU32,
}

impl SentRequest {
    fn new(correlation_id: u64, epoch: Instant, timeout: Duration) -> Self {
        let request = Self {
            correlation_id,
            epoch,
            expires_at_ns: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            responses: AtomicU32::new(0),
        };
        request.extend_expiry(timeout);
        request
    }

    #[must_use]
    #[inline]
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Mark the request finished. Later responses are silently discarded;
    /// the reaper removes the entry without invoking the timeout callback.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of responses delivered so far.
    #[must_use]
    #[inline]
    pub fn response_count(&self) -> u32 {
        self.responses.load(Ordering::Acquire)
    }

    /// Push the expiry to `timeout` past now. Callable from any thread.
    pub fn extend_expiry(&self, timeout: Duration) {
        let now_ns = saturating_ns(self.epoch.elapsed());
        let deadline = now_ns.saturating_add(saturating_ns(timeout));
        self.expires_at_ns.store(deadline, Ordering::Release);
    }

    fn is_expired(&self, now_ns: u64) -> bool {
        now_ns >= self.expires_at_ns.load(Ordering::Acquire)
    }
}

fn saturating_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Callbacks are stored behind `Arc` so they can be invoked after the map
/// guard is released: a callback re-entering the manager (tracking a
/// follow-up request, feeding another response) must not deadlock on a
/// shard lock.
struct Tracked {
    request: Arc<SentRequest>,
    on_response: Arc<dyn Fn(&SentRequest, &ResponseInfo) + Send + Sync>,
    on_timeout: Arc<dyn Fn(&SentRequest) + Send + Sync>,
}

/// Shared state between caller threads and the reaper.
struct RequestTable {
    epoch: Instant,
    requests: DashMap<u64, Tracked>,
    timed_out: AtomicU64,
    delivered: AtomicU64,
    discarded: AtomicU64,
}

enum SweepAction {
    DropClosed,
    Expire,
}

impl RequestTable {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            requests: DashMap::new(),
            timed_out: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// One reaper pass. Full scan: each request carries its own expiry.
    /// Returns the number of entries acted upon.
    fn sweep(&self, now_ns: u64) -> usize {
        // Decide first, then remove: callbacks must not run under the map's
        // shard locks.
        let mut actions: Vec<(u64, SweepAction)> = Vec::new();
        for entry in self.requests.iter() {
            if entry.request.is_closed() {
                actions.push((*entry.key(), SweepAction::DropClosed));
            } else if entry.request.is_expired(now_ns) {
                actions.push((*entry.key(), SweepAction::Expire));
            }
        }
        let acted = actions.len();
        for (id, action) in actions {
            let Some((_, tracked)) = self.requests.remove(&id) else {
                continue;
            };
            if matches!(action, SweepAction::Expire) && !tracked.request.is_closed() {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                log::debug!("[request] timed out id={}", id);
                invoke_timeout(&tracked);
            }
        }
        acted
    }

    fn process_response(&self, response: &ResponseInfo) -> bool {
        let (request, on_response) = {
            let Some(tracked) = self.requests.get(&response.correlation_id) else {
                log::debug!(
                    "[request] response for unknown id={} discarded",
                    response.correlation_id
                );
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return false;
            };
            if tracked.request.is_closed() {
                // Late response after close: silently discarded.
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            tracked.request.responses.fetch_add(1, Ordering::AcqRel);
            (Arc::clone(&tracked.request), Arc::clone(&tracked.on_response))
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        invoke_response(&request, on_response.as_ref(), response);
        true
    }
}

/// Caller errors inside callbacks are caught and logged, never allowed to
/// break the reactor loop.
fn invoke_timeout(tracked: &Tracked) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        (tracked.on_timeout)(&tracked.request);
    }));
    if result.is_err() {
        log::warn!("[request] timeout callback panicked");
    }
}

fn invoke_response(
    request: &SentRequest,
    callback: &(dyn Fn(&SentRequest, &ResponseInfo) + Send + Sync),
    response: &ResponseInfo,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(request, response);
    }));
    if result.is_err() {
        log::warn!("[request] response callback panicked");
    }
}

/// Point-in-time request-manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStatsSnapshot {
    pub in_flight: usize,
    pub timed_out: u64,
    pub delivered: u64,
    pub discarded: u64,
}

/// Tracks sent requests and reaps them on expiry or close.
pub struct RequestManager {
    table: Arc<RequestTable>,
    shutdown: Arc<AtomicBool>,
    reaper: Option<JoinHandle<()>>,
}

impl RequestManager {
    /// Start the manager and its reaper thread.
    #[must_use]
    pub fn start(config: RequestConfig) -> Self {
        let table = Arc::new(RequestTable::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let reaper_table = Arc::clone(&table);
        let reaper_shutdown = Arc::clone(&shutdown);
        let interval = config.sweep_interval;
        let reaper = thread::spawn(move || {
            log::info!("[request] reaper started");
            while !reaper_shutdown.load(Ordering::Relaxed) {
                let now_ns = saturating_ns(reaper_table.epoch.elapsed());
                reaper_table.sweep(now_ns);
                // Sleep in small chunks so shutdown stays responsive even
                // with a long sweep interval.
                let sleep_end = Instant::now() + interval;
                while Instant::now() < sleep_end {
                    if reaper_shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
            log::info!("[request] reaper stopped");
        });
        Self {
            table,
            shutdown,
            reaper: Some(reaper),
        }
    }

    /// Track a freshly sent request. The returned handle may be closed or
    /// have its expiry extended from any thread.
    pub fn track(
        &self,
        correlation_id: u64,
        timeout: Duration,
        on_response: ResponseCallback,
        on_timeout: TimeoutCallback,
    ) -> Arc<SentRequest> {
        let request = Arc::new(SentRequest::new(correlation_id, self.table.epoch, timeout));
        self.table.requests.insert(
            correlation_id,
            Tracked {
                request: Arc::clone(&request),
                on_response: Arc::from(on_response),
                on_timeout: Arc::from(on_timeout),
            },
        );
        log::debug!(
            "[request] tracking id={} timeout={:?}",
            correlation_id,
            timeout
        );
        request
    }

    /// Deliver a correlated response. Closed or unknown requests silently
    /// discard it. Callable from any thread.
    pub fn process_response(&self, response: &ResponseInfo) -> bool {
        self.table.process_response(response)
    }

    #[must_use]
    pub fn stats(&self) -> RequestStatsSnapshot {
        RequestStatsSnapshot {
            in_flight: self.table.requests.len(),
            timed_out: self.table.timed_out.load(Ordering::Relaxed),
            delivered: self.table.delivered.load(Ordering::Relaxed),
            discarded: self.table.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop the reaper and evict all remaining tracked requests, invoking
    /// no callback. Explicit shutdown, not a timeout.
    pub fn close(mut self) {
        self.stop_and_clear();
    }

    fn stop_and_clear(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
        self.table.requests.clear();
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        self.stop_and_clear();
    }
}
