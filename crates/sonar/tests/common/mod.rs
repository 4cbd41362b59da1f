// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared scripted transport doubles for integration tests.

// Each integration test binary compiles this module; not every binary uses
// every helper.
#![allow(dead_code)]

use parking_lot::Mutex;
use sonar::protocol::{ClientInfo, Message, PublicationTarget};
use sonar::relay::{RelaySocket, SocketFactory};
use sonar::transport::{Endpoint, SendOutcome};
use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Inbound endpoint replaying frames queued through a [`ScriptHandle`].
pub struct ScriptedEndpoint {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

#[derive(Clone)]
pub struct ScriptHandle {
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl ScriptedEndpoint {
    pub fn new() -> (Self, ScriptHandle) {
        let frames = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                frames: Arc::clone(&frames),
            },
            ScriptHandle { frames },
        )
    }
}

impl ScriptHandle {
    pub fn push(&self, frame: Vec<u8>) {
        self.frames.lock().push_back(frame);
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
            let Some(frame) = self.frames.lock().pop_front() else {
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

/// Outbound socket recording every offered frame.
pub struct RecordingSocket {
    target: PublicationTarget,
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub closed: AtomicBool,
}

impl RecordingSocket {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

impl RelaySocket for RecordingSocket {
    fn target(&self) -> PublicationTarget {
        self.target
    }

    fn offer(&self, buffer: &[u8]) -> SendOutcome {
        self.frames.lock().push(buffer.to_vec());
        SendOutcome::Sent(buffer.len())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

struct SocketView(Arc<RecordingSocket>);

impl RelaySocket for SocketView {
    fn target(&self) -> PublicationTarget {
        self.0.target()
    }
    fn offer(&self, buffer: &[u8]) -> SendOutcome {
        self.0.offer(buffer)
    }
    fn close(&self) {
        self.0.close()
    }
}

/// Factory handing out recording sockets and remembering them in order.
#[derive(Default)]
pub struct RecordingFactory {
    pub opened: Mutex<Vec<Arc<RecordingSocket>>>,
}

impl RecordingFactory {
    pub fn socket_for(&self, target: &PublicationTarget) -> Option<Arc<RecordingSocket>> {
        self.opened
            .lock()
            .iter()
            .find(|socket| socket.target() == *target)
            .cloned()
    }
}

impl SocketFactory for RecordingFactory {
    fn open(&self, target: &PublicationTarget) -> io::Result<Box<dyn RelaySocket>> {
        let socket = Arc::new(RecordingSocket {
            target: *target,
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.opened.lock().push(Arc::clone(&socket));
        Ok(Box::new(SocketView(socket)))
    }
}

/// Boxable `SocketFactory` handle that shares its recording state with the
/// test body's `Arc<RecordingFactory>`. A test keeps one `Arc` to inspect
/// opened sockets while handing an equivalent handle to the engine.
pub struct SharedFactory(pub Arc<RecordingFactory>);

impl SocketFactory for SharedFactory {
    fn open(&self, target: &PublicationTarget) -> io::Result<Box<dyn RelaySocket>> {
        self.0.open(target)
    }
}

pub fn target(last_octet: u8, port: u16, endpoint_id: u32) -> PublicationTarget {
    PublicationTarget {
        addr: Ipv4Addr::new(10, 0, 0, last_octet),
        port,
        endpoint_id,
    }
}

pub fn registration_frame(client_id: u64, target: PublicationTarget) -> Vec<u8> {
    encode(&Message::ClientRegistration(ClientInfo { client_id, target }))
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = vec![0u8; 1024];
    let len = msg.encode(&mut buf).expect("encode frame");
    buf.truncate(len);
    buf
}
