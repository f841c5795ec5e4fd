//! Narrow interface to the external connectivity engine
//!
//! Peer sessions drive negotiation and data transfer exclusively through
//! these traits: create offers/answers, set descriptions, add remote
//! candidates, open a bidirectional byte channel. ICE, encryption and
//! congestion control stay inside the engine implementation.
//!
//! Two implementations ship with the crate: [`WebRtcEngine`]
//! backed by the `webrtc` crate, and [`mock::MockEngine`], an in-process
//! loopback used by the test-suite.
//!
//! [`WebRtcEngine`]: self::webrtc::WebRtcEngine

pub mod mock;
pub mod webrtc;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session description kind in an offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// Proposed session parameters
    Offer,
    /// Accepted session parameters
    Answer,
}

/// Connectivity reachability description exchanged out-of-band
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Media line identifier
    pub sdp_mid: String,

    /// Media line index
    pub sdp_mline_index: u16,

    /// Candidate description string
    pub candidate: String,
}

/// Engine-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Connection not yet started
    New,
    /// Connectivity checks in progress
    Connecting,
    /// Direct path established
    Connected,
    /// Direct path lost
    Disconnected,
    /// Connectivity establishment failed
    Failed,
    /// Connection closed
    Closed,
}

/// Transport-level data channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel negotiation in progress
    Connecting,
    /// Channel ready for data transfer
    Open,
    /// Channel shutting down
    Closing,
    /// Channel closed
    Closed,
}

/// Asynchronous event delivered by a connectivity handle
pub enum EngineEvent {
    /// A local candidate was discovered
    IceCandidate(IceCandidate),

    /// The remote peer opened a data channel towards us
    RemoteChannel(Arc<dyn TransportChannel>),

    /// The engine-level connection state changed
    StateChange(ConnectivityState),
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            EngineEvent::RemoteChannel(ch) => {
                f.debug_tuple("RemoteChannel").field(&ch.label()).finish()
            }
            EngineEvent::StateChange(s) => f.debug_tuple("StateChange").field(s).finish(),
        }
    }
}

/// Asynchronous event delivered by a transport channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Channel lifecycle state changed
    StateChange(ChannelState),

    /// A message arrived from the remote peer
    Message(Bytes),

    /// Outstanding-bytes amount reported by the transport changed
    BufferedAmountChange(u64),
}

/// Factory for connectivity handles, one per peer session
#[async_trait]
pub trait ConnectivityEngine: Send + Sync {
    /// Acquire a fresh connectivity handle
    async fn connect(&self) -> Result<Arc<dyn ConnectivityHandle>>;
}

/// Handle to one engine-level peer connection
///
/// Exclusively owned by a session; released on close. Events are consumed
/// through the receiver returned by [`take_events`](Self::take_events),
/// which can be claimed exactly once.
#[async_trait]
pub trait ConnectivityHandle: Send + Sync {
    /// Generate an SDP offer describing the local session parameters
    async fn create_offer(&self) -> Result<String>;

    /// Generate an SDP answer to a previously set remote offer
    async fn create_answer(&self) -> Result<String>;

    /// Record the local session description
    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()>;

    /// Record the remote session description
    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()>;

    /// Feed an externally received candidate into the engine
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Open a local data channel with the given label
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn TransportChannel>>;

    /// Claim the engine event stream; `None` once already claimed
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    /// Tear down the engine-level connection
    async fn close(&self) -> Result<()>;
}

/// One transport-level data channel
///
/// The transport owns the channel's transmission resources; adapters only
/// hold a reference for sending and for event subscription.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Channel label agreed during negotiation
    fn label(&self) -> String;

    /// Current transport-reported lifecycle state
    fn state(&self) -> ChannelState;

    /// Bytes accepted for transmission but not yet flushed
    async fn buffered_amount(&self) -> u64;

    /// Enqueue bytes for asynchronous transmission
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Close the channel
    async fn close(&self) -> Result<()>;

    /// Claim the channel event stream; `None` once already claimed
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;
}
