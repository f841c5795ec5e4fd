//! In-process connectivity engine used by the test-suite
//!
//! Stands in for the real engine so negotiation, channel-open and
//! disconnect events can be driven deterministically without a network.

use super::{
    ChannelEvent, ChannelState, ConnectivityEngine, ConnectivityHandle, EngineEvent, IceCandidate,
    SdpKind, TransportChannel,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Factory producing [`MockConnectivity`] handles
#[derive(Default)]
pub struct MockEngine {
    /// Make the next `connect` call fail
    pub fail_connect: AtomicBool,

    /// Make channel creation fail on handles produced after this is set
    pub fail_create_channel: AtomicBool,

    handles: Mutex<Vec<Arc<MockConnectivity>>>,
}

impl MockEngine {
    /// Create a new mock engine
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently produced handle
    pub fn last_handle(&self) -> Option<Arc<MockConnectivity>> {
        self.handles.lock().last().cloned()
    }
}

#[async_trait]
impl ConnectivityEngine for MockEngine {
    async fn connect(&self) -> Result<Arc<dyn ConnectivityHandle>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::ConnectivityError(
                "mock engine configured to fail".to_string(),
            ));
        }

        let handle = Arc::new(MockConnectivity::new());
        handle
            .fail_create_channel
            .store(self.fail_create_channel.load(Ordering::SeqCst), Ordering::SeqCst);
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }
}

/// Scriptable connectivity handle
pub struct MockConnectivity {
    tx: mpsc::UnboundedSender<EngineEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,

    /// Make the next `create_data_channel` call fail
    pub fail_create_channel: AtomicBool,

    local_description: Mutex<Option<(SdpKind, String)>>,
    remote_description: Mutex<Option<(SdpKind, String)>>,
    candidates: Mutex<Vec<IceCandidate>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    closed: AtomicBool,
}

impl MockConnectivity {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            events: Mutex::new(Some(rx)),
            fail_create_channel: AtomicBool::new(false),
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver an event to whoever claimed the event stream
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Announce a remote-initiated channel and return it for scripting
    pub fn emit_remote_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = Arc::new(MockChannel::new(label));
        self.emit(EngineEvent::RemoteChannel(channel.clone()));
        channel
    }

    /// Last recorded local description
    pub fn local_description(&self) -> Option<(SdpKind, String)> {
        self.local_description.lock().clone()
    }

    /// Last recorded remote description
    pub fn remote_description(&self) -> Option<(SdpKind, String)> {
        self.remote_description.lock().clone()
    }

    /// Candidates fed in via `add_ice_candidate`
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// Channels created via `create_data_channel`
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityHandle for MockConnectivity {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\ns=mock-offer\r\n".to_string())
    }

    async fn create_answer(&self) -> Result<String> {
        Ok("v=0\r\ns=mock-answer\r\n".to_string())
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        *self.local_description.lock() = Some((kind, sdp));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        *self.remote_description.lock() = Some((kind, sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn TransportChannel>> {
        if self.fail_create_channel.load(Ordering::SeqCst) {
            return Err(Error::DataChannelError(
                "mock channel creation configured to fail".to_string(),
            ));
        }

        let channel = Arc::new(MockChannel::new(label));
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scriptable transport channel
pub struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    buffered: AtomicU64,
    sent: Mutex<Vec<Bytes>>,

    /// Make every `send` call fail
    pub fail_sends: AtomicBool,

    tx: mpsc::UnboundedSender<ChannelEvent>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl MockChannel {
    /// Create a channel in the `Connecting` state
    pub fn new(label: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            buffered: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            tx,
            events: Mutex::new(Some(rx)),
        }
    }

    /// Move the channel to a new state and emit the matching event
    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
        let _ = self.tx.send(ChannelEvent::StateChange(state));
    }

    /// Shorthand for `set_state(ChannelState::Open)`
    pub fn open(&self) {
        self.set_state(ChannelState::Open);
    }

    /// Set the reported outstanding amount and emit the change event
    pub fn set_buffered(&self, amount: u64) {
        self.buffered.store(amount, Ordering::SeqCst);
        let _ = self.tx.send(ChannelEvent::BufferedAmountChange(amount));
    }

    /// Deliver an inbound message
    pub fn push_message(&self, data: Bytes) {
        let _ = self.tx.send(ChannelEvent::Message(data));
    }

    /// Payloads accepted by `send`
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl TransportChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::DataChannelError(
                "mock send configured to fail".to_string(),
            ));
        }

        self.buffered.fetch_add(data.len() as u64, Ordering::SeqCst);
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.set_state(ChannelState::Closed);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }
}
