//! Per-peer negotiation and data-channel lifecycle

use super::state::SessionState;
use crate::channels::{ChannelListener, DataChannelAdapter};
use crate::config::ChannelConfig;
use crate::engine::{
    ConnectivityEngine, ConnectivityHandle, ConnectivityState, EngineEvent, IceCandidate, SdpKind,
    TransportChannel,
};
use crate::signaling::{CloseCode, COMMAND_ANSWER_SDP, COMMAND_ICE_CANDIDATE, COMMAND_OFFER_SDP};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hooks into the control layer that owns the session table
///
/// Sessions never talk to the signaling connection directly; outbound
/// negotiation payloads go through `send_command` and the control layer
/// decides how to deliver them. Close decisions likewise stay with the
/// control layer: `close_peer` is a request, `on_peer_closed` the
/// notification that a close has completed.
pub trait SessionObserver: Send + Sync {
    /// Deliver a signaling command addressed to `peer_id`
    fn send_command(&self, peer_id: &str, command: &str, data: serde_json::Value);

    /// Ask the control layer to close this peer; `force_queuing` requests
    /// that the close notification be queued even if immediate delivery is
    /// unavailable
    fn close_peer(&self, peer_id: &str, code: CloseCode, force_queuing: bool);

    /// Both data channels are live and the session is usable
    fn on_peer_connected(&self, peer_id: &str);

    /// The session finished closing with the given code
    fn on_peer_closed(&self, peer_id: &str, code: CloseCode);

    /// The peer's outbound path is open with nothing outstanding
    fn on_peer_writable(&self, peer_id: &str);

    /// Data arrived from the peer
    fn on_peer_message(&self, peer_id: &str, data: Bytes);
}

/// One peer relationship: negotiation state machine plus the pair of
/// data-channel adapters carrying its traffic
///
/// All state transitions are validated against [`SessionState::allows`]
/// and made atomic with respect to engine/channel callback delivery; the
/// engine handle is exclusively owned and released on close.
pub struct PeerSession {
    local_id: String,
    remote_id: String,
    state: Mutex<SessionState>,
    connectivity: Mutex<Option<Arc<dyn ConnectivityHandle>>>,
    local_channel: Mutex<Option<Arc<DataChannelAdapter>>>,
    remote_channel: Mutex<Option<Arc<DataChannelAdapter>>>,
    observer: Arc<dyn SessionObserver>,
    channel_config: ChannelConfig,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    // Handed to event pumps and channel listeners so they never keep the
    // session alive from inside its own machinery.
    weak_self: Weak<PeerSession>,
}

impl PeerSession {
    /// Create a session for the given peer pair in the `Closed` state
    pub fn new(
        local_id: &str,
        remote_id: &str,
        observer: Arc<dyn SessionObserver>,
        channel_config: ChannelConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            state: Mutex::new(SessionState::Closed),
            connectivity: Mutex::new(None),
            local_channel: Mutex::new(None),
            remote_channel: Mutex::new(None),
            observer,
            channel_config,
            pump: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Local endpoint identifier
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Remote endpoint identifier
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Acquire a connectivity handle and open the local data channel
    ///
    /// Valid only before negotiation starts. Any failure releases every
    /// acquired resource; the session is never left partially set up.
    pub async fn initialize(&self, engine: &dyn ConnectivityEngine) -> Result<()> {
        if self.state() != SessionState::Closed || self.connectivity.lock().is_some() {
            warn!(
                "Initialize for peer {} rejected in state {:?}",
                self.remote_id,
                self.state()
            );
            return Err(Error::InvalidState(format!(
                "session for {} already initialized",
                self.remote_id
            )));
        }

        let handle = match engine.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "Failed to acquire connectivity handle for peer {}: {}",
                    self.remote_id, e
                );
                return Err(e);
            }
        };

        let Some(events) = handle.take_events() else {
            let _ = handle.close().await;
            return Err(Error::ConnectivityError(
                "engine event stream already claimed".to_string(),
            ));
        };

        *self.connectivity.lock() = Some(handle.clone());
        let task = tokio::spawn(Self::pump_engine_events(self.weak_self.clone(), events));
        *self.pump.lock() = Some(task);

        let label = format!("peer-data-{}", self.remote_id);
        let channel = match handle.create_data_channel(&label).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(
                    "Failed to create data channel for peer {}: {}",
                    self.remote_id, e
                );
                self.teardown().await;
                return Err(e);
            }
        };

        let adapter = DataChannelAdapter::new(channel, self.channel_config.clone());
        adapter.attach_listener(Arc::new(SessionChannelListener {
            session: self.weak_self.clone(),
        }))?;
        *self.local_channel.lock() = Some(adapter);

        info!("Session initialized for peer {}", self.remote_id);
        Ok(())
    }

    /// Start negotiation as the offering side
    ///
    /// Valid only from `Closed`; moves to `Connecting`, records the local
    /// description and emits an `offersdp` command for the peer.
    pub async fn create_offer(&self) -> Result<()> {
        let handle = self.connectivity_handle()?;
        self.advance(SessionState::Connecting)?;

        let sdp = match handle.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!("Offer creation failed for peer {}: {}", self.remote_id, e);
                let _ = self.close(CloseCode::Abnormal).await;
                return Err(e);
            }
        };

        // Negotiation may have been torn down while the engine worked.
        if self.state() != SessionState::Connecting {
            warn!(
                "Offer for peer {} ready in state {:?}, discarding",
                self.remote_id,
                self.state()
            );
            return Ok(());
        }

        if let Err(e) = handle
            .set_local_description(SdpKind::Offer, sdp.clone())
            .await
        {
            warn!(
                "Failed to set local offer for peer {}: {}",
                self.remote_id, e
            );
            let _ = self.close(CloseCode::Abnormal).await;
            return Err(e);
        }

        self.observer.send_command(
            &self.remote_id,
            COMMAND_OFFER_SDP,
            serde_json::json!({ "sdp": sdp }),
        );
        debug!("Offer sent for peer {}", self.remote_id);
        Ok(())
    }

    /// Start negotiation as the answering side
    ///
    /// Valid only from `Closed`; moves to `Connecting`, records the remote
    /// offer, then generates and emits an `answersdp` command.
    pub async fn receive_offer_sdp(&self, sdp: String) -> Result<()> {
        let handle = self.connectivity_handle()?;
        self.advance(SessionState::Connecting)?;

        if let Err(e) = handle.set_remote_description(SdpKind::Offer, sdp).await {
            warn!(
                "Failed to set remote offer for peer {}: {}",
                self.remote_id, e
            );
            let _ = self.close(CloseCode::Abnormal).await;
            return Err(e);
        }

        let answer = match handle.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Answer creation failed for peer {}: {}", self.remote_id, e);
                let _ = self.close(CloseCode::Abnormal).await;
                return Err(e);
            }
        };

        if self.state() != SessionState::Connecting {
            warn!(
                "Answer for peer {} ready in state {:?}, discarding",
                self.remote_id,
                self.state()
            );
            return Ok(());
        }

        if let Err(e) = handle
            .set_local_description(SdpKind::Answer, answer.clone())
            .await
        {
            warn!(
                "Failed to set local answer for peer {}: {}",
                self.remote_id, e
            );
            let _ = self.close(CloseCode::Abnormal).await;
            return Err(e);
        }

        self.observer.send_command(
            &self.remote_id,
            COMMAND_ANSWER_SDP,
            serde_json::json!({ "sdp": answer }),
        );
        debug!("Answer sent for peer {}", self.remote_id);
        Ok(())
    }

    /// Record the peer's answer to our offer
    ///
    /// Valid only from `Connecting`; the state advances to `Open` only once
    /// both channels report open.
    pub async fn receive_answer_sdp(&self, sdp: String) -> Result<()> {
        let handle = self.connectivity_handle()?;

        if self.state() != SessionState::Connecting {
            warn!(
                "Answer received for peer {} in state {:?}",
                self.remote_id,
                self.state()
            );
            return Err(Error::InvalidState(format!(
                "answer for {} outside negotiation",
                self.remote_id
            )));
        }

        handle.set_remote_description(SdpKind::Answer, sdp).await
    }

    /// Feed an externally received candidate into the engine
    pub async fn add_ice_candidate(
        &self,
        sdp_mid: &str,
        sdp_mline_index: u16,
        candidate: &str,
    ) -> Result<()> {
        let handle = self.connectivity_handle()?;
        handle
            .add_ice_candidate(IceCandidate {
                sdp_mid: sdp_mid.to_string(),
                sdp_mline_index,
                candidate: candidate.to_string(),
            })
            .await
    }

    /// Enqueue bytes on the local channel
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.local_adapter_when_open()?.send(data).await
    }

    /// Enqueue bytes and wait for the transport to drain, bounded by the
    /// configured sync-send timeout
    pub async fn send_sync(&self, data: Bytes) -> Result<()> {
        self.local_adapter_when_open()?.send_sync(data).await
    }

    /// Whether the local channel is open with nothing outstanding
    pub async fn is_writable(&self) -> bool {
        if self.state() != SessionState::Open {
            warn!(
                "Writability queried for peer {} in state {:?}",
                self.remote_id,
                self.state()
            );
            return false;
        }
        match self.local_channel.lock().clone() {
            Some(adapter) => adapter.is_writable().await,
            None => false,
        }
    }

    /// Tear the session down and notify the control layer once
    ///
    /// Idempotent: a second call while `Closing`/`Closed` is a no-op with a
    /// warning and produces no further notification.
    pub async fn close(&self, code: CloseCode) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Closing | SessionState::Closed => {
                    warn!(
                        "Close requested for peer {} while already {:?}",
                        self.remote_id, *state
                    );
                    return Ok(());
                }
                _ => *state = SessionState::Closing,
            }
        }

        info!("Closing session for peer {}", self.remote_id);
        self.teardown().await;

        {
            let mut state = self.state.lock();
            debug_assert!(state.allows(SessionState::Closed));
            *state = SessionState::Closed;
        }

        self.observer.on_peer_closed(&self.remote_id, code);
        Ok(())
    }

    fn connectivity_handle(&self) -> Result<Arc<dyn ConnectivityHandle>> {
        self.connectivity.lock().clone().ok_or_else(|| {
            Error::InvalidState(format!("session for {} not initialized", self.remote_id))
        })
    }

    fn local_adapter_when_open(&self) -> Result<Arc<DataChannelAdapter>> {
        if self.state() != SessionState::Open {
            warn!(
                "Send for peer {} rejected in state {:?}",
                self.remote_id,
                self.state()
            );
            return Err(Error::InvalidState(format!(
                "session for {} is not open",
                self.remote_id
            )));
        }
        self.local_channel.lock().clone().ok_or_else(|| {
            Error::InvalidState(format!("no local channel for {}", self.remote_id))
        })
    }

    /// Centrally validated state transition
    fn advance(&self, next: SessionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.allows(next) {
            warn!(
                "Illegal session transition {:?} -> {:?} for peer {}",
                *state, next, self.remote_id
            );
            #[cfg(feature = "strict-invariants")]
            panic!(
                "illegal session transition {:?} -> {:?} for peer {}",
                *state, next, self.remote_id
            );
            #[cfg(not(feature = "strict-invariants"))]
            return Err(Error::InvalidState(format!(
                "transition {:?} -> {:?} for {}",
                *state, next, self.remote_id
            )));
        }
        debug!(
            "Session {} transition {:?} -> {:?}",
            self.remote_id, *state, next
        );
        *state = next;
        Ok(())
    }

    async fn teardown(&self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }

        let local = self.local_channel.lock().take();
        let remote = self.remote_channel.lock().take();
        if let Some(adapter) = local {
            adapter.shutdown().await;
        }
        if let Some(adapter) = remote {
            adapter.shutdown().await;
        }

        let handle = self.connectivity.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                warn!(
                    "Failed to close connectivity handle for peer {}: {}",
                    self.remote_id, e
                );
            }
        }
    }

    async fn pump_engine_events(
        session: Weak<PeerSession>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            match event {
                EngineEvent::IceCandidate(candidate) => {
                    debug!("Candidate discovered for peer {}", session.remote_id);
                    session.observer.send_command(
                        &session.remote_id,
                        COMMAND_ICE_CANDIDATE,
                        serde_json::json!({
                            "sdp_mid": candidate.sdp_mid,
                            "sdp_mline_index": candidate.sdp_mline_index,
                            "candidate": candidate.candidate,
                        }),
                    );
                }
                EngineEvent::RemoteChannel(channel) => session.handle_remote_channel(channel),
                EngineEvent::StateChange(state) => match state {
                    ConnectivityState::Disconnected | ConnectivityState::Closed => {
                        info!(
                            "Engine reported {:?} for peer {}",
                            state, session.remote_id
                        );
                        session.handle_peer_disconnected();
                    }
                    other => debug!("Engine state for peer {}: {:?}", session.remote_id, other),
                },
            }
        }
    }

    fn handle_remote_channel(&self, channel: Arc<dyn TransportChannel>) {
        info!(
            "Remote data channel '{}' announced by peer {}",
            channel.label(),
            self.remote_id
        );

        let adapter = DataChannelAdapter::new(channel, self.channel_config.clone());
        if let Err(e) = adapter.attach_listener(Arc::new(SessionChannelListener {
            session: self.weak_self.clone(),
        })) {
            warn!(
                "Failed to attach listener to remote channel for peer {}: {}",
                self.remote_id, e
            );
        }

        if self.remote_channel.lock().replace(adapter).is_some() {
            warn!("Replacing existing remote channel for peer {}", self.remote_id);
        }

        // The channel may already report open by the time it is announced.
        self.maybe_open();
    }

    /// Dual-channel open rule: the session becomes usable only once both
    /// the local- and remote-initiated channels report open
    fn maybe_open(&self) {
        let local_open = self
            .local_channel
            .lock()
            .as_ref()
            .map(|a| a.is_open())
            .unwrap_or(false);
        let remote_open = self
            .remote_channel
            .lock()
            .as_ref()
            .map(|a| a.is_open())
            .unwrap_or(false);
        if !(local_open && remote_open) {
            return;
        }

        {
            let mut state = self.state.lock();
            if *state != SessionState::Connecting {
                warn!(
                    "Both channels open for peer {} in state {:?}",
                    self.remote_id, *state
                );
                return;
            }
            *state = SessionState::Open;
        }

        info!("Peers connected: {} and {}", self.remote_id, self.local_id);
        self.observer.on_peer_connected(&self.remote_id);
        self.observer.on_peer_writable(&self.local_id);
    }

    fn handle_peer_disconnected(&self) {
        match self.state() {
            SessionState::Closed => {
                warn!(
                    "Disconnect for peer {} ignored, already closed",
                    self.remote_id
                );
            }
            SessionState::Closing => {
                debug!(
                    "Disconnect for peer {} ignored, already closing",
                    self.remote_id
                );
            }
            _ => {
                // Abnormal loss: ask the control layer to close this peer,
                // queuing the notification if immediate delivery is
                // unavailable.
                self.observer
                    .close_peer(&self.remote_id, CloseCode::GoingAway, true);
            }
        }
    }

    fn handle_buffered_change(&self, outstanding: u64) {
        if outstanding != 0 {
            return;
        }
        let local_open = self
            .local_channel
            .lock()
            .as_ref()
            .map(|a| a.is_open())
            .unwrap_or(false);
        if !local_open {
            debug!("Drain event for peer {} with local channel not open", self.remote_id);
            return;
        }
        self.observer.on_peer_writable(&self.remote_id);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }
}

/// Routes adapter events back into the owning session without keeping it
/// alive from inside its own channels
struct SessionChannelListener {
    session: Weak<PeerSession>,
}

impl ChannelListener for SessionChannelListener {
    fn on_channel_open(&self, _label: &str) {
        if let Some(session) = self.session.upgrade() {
            session.maybe_open();
        }
    }

    fn on_channel_disconnected(&self, _label: &str) {
        if let Some(session) = self.session.upgrade() {
            session.handle_peer_disconnected();
        }
    }

    fn on_channel_message(&self, _label: &str, data: Bytes) {
        if let Some(session) = self.session.upgrade() {
            session.observer.on_peer_message(&session.remote_id, data);
        }
    }

    fn on_buffered_amount_change(&self, _label: &str, outstanding: u64) {
        if let Some(session) = self.session.upgrade() {
            session.handle_buffered_change(outstanding);
        }
    }
}
