// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # SONAR - Discovery and relay substrate for pub/sub messaging
//!
//! Lets publishers and subscribers find each other, directly via multicast
//! "sniffing" or indirectly through a unicast relay daemon on networks
//! without multicast, and lets callers correlate asynchronous
//! request/response exchanges.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                          Reactors                                  |
//! |   RelayDaemon        Sniffer            RequestManager             |
//! |   (register+fanout)  (peer/topic/       (correlation + reaper)     |
//! |                       endpoint leases)                             |
//! +--------------------------------------------------------------------+
//! |                      Liveness layer                                |
//! |   LeaseRegistry: upsert / expire_next / clear                      |
//! +--------------------------------------------------------------------+
//! |                      Collections                                   |
//! |   SwapSet | StagedSet | MultiMap | OrderedMap                      |
//! +--------------------------------------------------------------------+
//! |                      Transport / Protocol                          |
//! |   Endpoint (UDP unicast & multicast) | tagged Message codec        |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Each reactor owns one dedicated thread running a tight poll -> process
//! -> evict loop; reactor state needs no locking because it has exactly one
//! owner. The only concurrent surfaces are the staged listener sets, the
//! request table, and the atomic state of a [`request::SentRequest`].
//!
//! Nothing is persisted: registries and socket pools rebuild from scratch
//! within one lease window after a restart.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sonar::config::RelayConfig;
//! use sonar::relay::{RelayDaemon, UdpSocketFactory};
//! use sonar::transport::UdpEndpoint;
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! fn main() -> std::io::Result<()> {
//!     let config = RelayConfig::default();
//!     let inbound = UdpEndpoint::unicast(
//!         SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 7400),
//!         config.poll_timeout,
//!     )?;
//!     let daemon = RelayDaemon::spawn(config, Box::new(inbound), Box::new(UdpSocketFactory));
//!     // ... run until shutdown ...
//!     daemon.shutdown();
//!     Ok(())
//! }
//! ```

/// Engine tuning knobs.
pub mod config;
/// Collections and the lease-based liveness registry.
pub mod core;
/// Discovery wire protocol (tagged frames, bounds-checked codec).
pub mod protocol;
/// Asynchronous request/response correlation.
pub mod request;
/// Unicast relay daemon.
pub mod relay;
/// Multicast discovery sniffer.
pub mod sniffer;
/// Transport seam (endpoint trait, UDP implementation).
pub mod transport;

pub use crate::config::{RelayConfig, RequestConfig, SnifferConfig};
pub use crate::core::lease::{Advert, LeaseEvent, LeaseRegistry};
pub use crate::protocol::{ClientId, ClientInfo, Message, PeerId, PublicationTarget};
pub use crate::relay::{RelayDaemon, RelayListener};
pub use crate::request::RequestManager;
pub use crate::sniffer::{Sniffer, SnifferListener};
