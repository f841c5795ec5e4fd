//! Peer-to-peer data session orchestration
//!
//! This crate drives direct peer-to-peer data sessions: the per-peer
//! offer/answer state machine, the backpressure-aware data-channel
//! adapter on top of a transport-provided channel, and a resilient
//! signaling client that keeps the control connection alive across
//! transient failures with bounded exponential backoff.
//!
//! Connectivity establishment itself (ICE, DTLS, SCTP multiplexing) is an
//! external engine consumed through the narrow traits in [`engine`]; the
//! control layer that owns the set of active sessions is consumed through
//! [`peer::SessionObserver`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Control layer (owns the session table)                 │
//! │    │ per remote peer             │ one per process      │
//! │    ▼                             ▼                      │
//! │  PeerSession ──────────────▶  SignalingClient           │
//! │  ├─ negotiation state machine   ├─ worker task owns the │
//! │  ├─ DataChannelAdapter (local)  │  WebSocket + timer    │
//! │  ├─ DataChannelAdapter (remote) └─ reconnect w/ backoff │
//! │  └─ ConnectivityHandle (engine)                         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Outbound negotiation payloads flow session → control layer →
//! signaling; inbound commands flow signaling → control layer → the
//! matching session.
//!
//! # Example
//!
//! ```
//! use peerlink::config::SignalingConfig;
//!
//! let config = SignalingConfig::new("wss://signal.example.com")
//!     .with_reconnect_delay(500)
//!     .with_reconnect_delay_max(8000);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.reconnect_attempts, 0); // unlimited
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod peer;
pub mod signaling;

// Re-exports for public API
pub use channels::{ChannelListener, DataChannelAdapter};
pub use config::{ChannelConfig, PeerConfig, ReconnectPolicy, SignalingConfig, TurnServerConfig};
pub use engine::{
    ChannelEvent, ChannelState, ConnectivityEngine, ConnectivityHandle, ConnectivityState,
    EngineEvent, IceCandidate, SdpKind, TransportChannel,
};
pub use error::{Error, Result};
pub use peer::{PeerSession, SessionObserver, SessionState};
pub use signaling::{CloseCode, CommandEnvelope, SignalingClient, SignalingState};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
