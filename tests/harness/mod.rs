//! Shared helpers for integration tests
#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use peerlink::{CloseCode, SessionObserver};
use std::time::Duration;

/// Poll `condition` until it holds or a bounded wait expires
pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Observer that records every control-layer callback
#[derive(Default)]
pub struct RecordingObserver {
    pub commands: Mutex<Vec<(String, String, serde_json::Value)>>,
    pub close_requests: Mutex<Vec<(String, CloseCode, bool)>>,
    pub connected: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<(String, CloseCode)>>,
    pub writable: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<(String, Bytes)>>,
}

impl RecordingObserver {
    /// Pop the most recent command with the given name, if any
    pub fn take_command(&self, command: &str) -> Option<(String, serde_json::Value)> {
        let mut commands = self.commands.lock();
        let index = commands.iter().position(|(_, name, _)| name == command)?;
        let (peer, _, data) = commands.remove(index);
        Some((peer, data))
    }
}

impl SessionObserver for RecordingObserver {
    fn send_command(&self, peer_id: &str, command: &str, data: serde_json::Value) {
        self.commands
            .lock()
            .push((peer_id.to_string(), command.to_string(), data));
    }

    fn close_peer(&self, peer_id: &str, code: CloseCode, force_queuing: bool) {
        self.close_requests
            .lock()
            .push((peer_id.to_string(), code, force_queuing));
    }

    fn on_peer_connected(&self, peer_id: &str) {
        self.connected.lock().push(peer_id.to_string());
    }

    fn on_peer_closed(&self, peer_id: &str, code: CloseCode) {
        self.closed.lock().push((peer_id.to_string(), code));
    }

    fn on_peer_writable(&self, peer_id: &str) {
        self.writable.lock().push(peer_id.to_string());
    }

    fn on_peer_message(&self, peer_id: &str, data: Bytes) {
        self.messages.lock().push((peer_id.to_string(), data));
    }
}
