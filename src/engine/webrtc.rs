//! Connectivity engine implementation backed by the `webrtc` crate

use super::{
    ChannelEvent, ChannelState, ConnectivityEngine, ConnectivityHandle, ConnectivityState,
    EngineEvent, IceCandidate, SdpKind, TransportChannel,
};
use crate::config::PeerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Connectivity engine producing `webrtc`-backed handles
pub struct WebRtcEngine {
    config: PeerConfig,
}

impl WebRtcEngine {
    /// Create a new engine from the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: PeerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect()
    }
}

#[async_trait]
impl ConnectivityEngine for WebRtcEngine {
    async fn connect(&self) -> Result<Arc<dyn ConnectivityHandle>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::ConnectivityError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::ConnectivityError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::ConnectivityError(format!("Failed to create peer connection: {}", e))
        })?);

        Ok(Arc::new(WebRtcConnectivity::new(peer_connection)))
    }
}

/// Connectivity handle wrapping one `RTCPeerConnection`
pub struct WebRtcConnectivity {
    /// Unique identifier for this connection instance, used in logs
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl WebRtcConnectivity {
    fn new(peer_connection: Arc<RTCPeerConnection>) -> Self {
        let connection_id = uuid::Uuid::new_v4().to_string();
        debug!("Created peer connection {}", connection_id);

        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(EngineEvent::IceCandidate(IceCandidate {
                            sdp_mid: init.sdp_mid.unwrap_or_default(),
                            sdp_mline_index: init.sdp_mline_index.unwrap_or_default(),
                            candidate: init.candidate,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let channel_tx = tx.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = channel_tx.clone();
            Box::pin(async move {
                debug!("Remote data channel announced: {}", dc.label());
                let channel = WebRtcChannel::new(dc).await;
                let _ = tx.send(EngineEvent::RemoteChannel(Arc::new(channel)));
            })
        }));

        let state_tx = tx;
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tx = state_tx.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCPeerConnectionState::New => ConnectivityState::New,
                        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
                        _ => return,
                    };
                    let _ = tx.send(EngineEvent::StateChange(mapped));
                })
            },
        ));

        Self {
            connection_id,
            peer_connection,
            events: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl ConnectivityHandle for WebRtcConnectivity {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let desc = session_description(kind, sdp)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<()> {
        let desc = session_description(kind, sdp)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn TransportChannel>> {
        let dc = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))?;
        Ok(Arc::new(WebRtcChannel::new(dc).await))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing peer connection {}", self.connection_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::ConnectivityError(format!("Failed to close connection: {}", e)))
    }
}

/// Transport channel wrapping one `RTCDataChannel`
pub struct WebRtcChannel {
    data_channel: Arc<RTCDataChannel>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcChannel {
    async fn new(data_channel: Arc<RTCDataChannel>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let open_tx = tx.clone();
        data_channel.on_open(Box::new(move || {
            let tx = open_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::StateChange(ChannelState::Open));
            })
        }));

        let close_tx = tx.clone();
        data_channel.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::StateChange(ChannelState::Closed));
            })
        }));

        let message_tx = tx.clone();
        data_channel.on_message(Box::new(move |msg| {
            let tx = message_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Message(msg.data));
            })
        }));

        // Drain notification: fires once the transport has flushed down to
        // the threshold, which at zero means fully drained.
        data_channel.set_buffered_amount_low_threshold(0).await;
        let drain_tx = tx;
        data_channel
            .on_buffered_amount_low(Box::new(move || {
                let tx = drain_tx.clone();
                Box::pin(async move {
                    let _ = tx.send(ChannelEvent::BufferedAmountChange(0));
                })
            }))
            .await;

        Self {
            data_channel,
            events: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl TransportChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.data_channel.label().to_string()
    }

    fn state(&self) -> ChannelState {
        match self.data_channel.ready_state() {
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }

    async fn buffered_amount(&self) -> u64 {
        self.data_channel.buffered_amount().await as u64
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        self.data_channel
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to enqueue data: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.data_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close data channel: {}", e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }
}

fn session_description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription> {
    match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)
            .map_err(|e| Error::SdpError(format!("Invalid offer SDP: {}", e))),
        SdpKind::Answer => RTCSessionDescription::answer(sdp)
            .map_err(|e| Error::SdpError(format!("Invalid answer SDP: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_rejects_invalid_config() {
        let mut config = PeerConfig::default();
        config.stun_servers.clear();
        assert!(WebRtcEngine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_connect_produces_handle() {
        let engine = WebRtcEngine::new(PeerConfig::default()).unwrap();
        let handle = engine.connect().await.unwrap();

        assert!(handle.take_events().is_some());
        // Event stream can be claimed exactly once
        assert!(handle.take_events().is_none());

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_offer_includes_data_channel_section() {
        let engine = WebRtcEngine::new(PeerConfig::default()).unwrap();
        let handle = engine.connect().await.unwrap();

        let channel = handle.create_data_channel("peer-data-test").await.unwrap();
        assert_eq!(channel.label(), "peer-data-test");

        let sdp = handle.create_offer().await.unwrap();
        assert!(!sdp.is_empty());
        assert!(sdp.contains("application"));

        handle.close().await.unwrap();
    }
}
