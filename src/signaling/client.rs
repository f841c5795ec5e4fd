//! Resilient WebSocket signaling client
//!
//! A dedicated worker task owns the socket and the reconnect timer; public
//! operations communicate with it through a command channel, so callers
//! never share mutable connection state with the socket loop. The only
//! blocking operation is [`SignalingClient::close_sync`], bounded by
//! worker teardown.

use super::protocol::{CloseCode, CommandEnvelope, COMMAND_OPEN};
use crate::config::{ReconnectPolicy, SignalingConfig};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback for inbound command envelopes
pub type CommandCallback = Arc<dyn Fn(CommandEnvelope) + Send + Sync>;

/// Callback for connection-closed notifications
pub type ClosedCallback = Arc<dyn Fn(CloseCode) + Send + Sync>;

/// Signaling connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Connection attempt in progress
    Opening,
    /// Connected and authenticated command sent
    Opened,
    /// Explicit teardown in progress
    Closing,
    /// No connection
    Closed,
}

/// Handle to the signaling worker
///
/// One persistent logical connection to a signaling server, independent of
/// any particular peer. Reconnects automatically on unexpected loss with
/// exponential backoff; see [`SignalingConfig`] for the policy knobs.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientCommand>,
    shared: Arc<Shared>,
}

struct Shared {
    state: RwLock<SignalingState>,
    session_id: RwLock<String>,
    on_command: RwLock<Option<CommandCallback>>,
    on_closed: RwLock<Option<ClosedCallback>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: RwLock::new(SignalingState::Closed),
            session_id: RwLock::new(String::new()),
            on_command: RwLock::new(None),
            on_closed: RwLock::new(None),
        }
    }

    fn set_state(&self, next: SignalingState) {
        let mut state = self.state.write();
        if *state != next {
            debug!("Signaling state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

enum ClientCommand {
    Open { id: String, password: String },
    Send(CommandEnvelope),
    Close { done: Option<oneshot::Sender<()>> },
}

impl SignalingClient {
    /// Create a client and spawn its worker task
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SignalingConfig) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::new());
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            url: config.url.clone(),
            policy: config.reconnect_policy(),
            shared: shared.clone(),
            credentials: None,
            attempts_made: 0,
        };
        tokio::spawn(worker.run(rx));

        Ok(Self { tx, shared })
    }

    /// Connect and authenticate with the given identity
    ///
    /// Valid only while `Closed`. Once the transport-level open succeeds
    /// the worker sends the `open` command carrying id and password; the
    /// attempt counter is reset for a fresh reconnect cycle.
    pub fn open(&self, id: &str, password: &str) -> Result<()> {
        let state = self.state();
        if state != SignalingState::Closed {
            warn!("Open requested while signaling is {:?}", state);
            return Err(Error::InvalidState(format!(
                "signaling connection is {:?}",
                state
            )));
        }

        self.send_to_worker(ClientCommand::Open {
            id: id.to_string(),
            password: password.to_string(),
        })
    }

    /// Send a command addressed to one peer
    pub fn send_command(&self, peer_id: &str, command: &str, data: serde_json::Value) -> Result<()> {
        self.send_to_worker(ClientCommand::Send(CommandEnvelope::to_peer(
            peer_id, command, data,
        )))
    }

    /// Send a global command (no recipient)
    pub fn send_global_command(&self, command: &str, data: serde_json::Value) -> Result<()> {
        self.send_to_worker(ClientCommand::Send(CommandEnvelope::global(command, data)))
    }

    /// Tear the connection down, cancelling any pending reconnect
    pub fn close(&self) -> Result<()> {
        self.send_to_worker(ClientCommand::Close { done: None })
    }

    /// Tear the connection down and wait until teardown has completed
    pub async fn close_sync(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send_to_worker(ClientCommand::Close {
            done: Some(done_tx),
        })?;
        done_rx.await.map_err(|_| {
            Error::SignalingError("signaling worker exited before close completed".to_string())
        })
    }

    /// Current connection state
    pub fn state(&self) -> SignalingState {
        *self.shared.state.read()
    }

    /// Whether the connection is open
    pub fn opened(&self) -> bool {
        self.state() == SignalingState::Opened
    }

    /// Session ID assigned by the server; empty before the first
    /// successful open
    pub fn session_id(&self) -> String {
        self.shared.session_id.read().clone()
    }

    /// Register the single subscriber for inbound commands
    ///
    /// A second registration is rejected with a warning; the existing
    /// subscriber is kept. Dispatch by recipient id is the control
    /// layer's responsibility.
    pub fn on_command<F>(&self, callback: F)
    where
        F: Fn(CommandEnvelope) + Send + Sync + 'static,
    {
        let mut slot = self.shared.on_command.write();
        if slot.is_some() {
            warn!("Command subscriber already registered, keeping the existing one");
            return;
        }
        *slot = Some(Arc::new(callback));
    }

    /// Register the single subscriber for connection-closed notifications
    pub fn on_closed<F>(&self, callback: F)
    where
        F: Fn(CloseCode) + Send + Sync + 'static,
    {
        let mut slot = self.shared.on_closed.write();
        if slot.is_some() {
            warn!("Closed subscriber already registered, keeping the existing one");
            return;
        }
        *slot = Some(Arc::new(callback));
    }

    fn send_to_worker(&self, cmd: ClientCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| Error::SignalingError("signaling worker is gone".to_string()))
    }
}

/// Owns the socket and the reconnect timer on one execution context
struct Worker {
    url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    credentials: Option<(String, String)>,
    attempts_made: u32,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ClientCommand>) {
        let mut ws: Option<WsStream> = None;
        let mut reconnect_at: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd, &mut ws, &mut reconnect_at).await,
                    None => {
                        // Every client handle is gone
                        if let Some(mut stream) = ws.take() {
                            let _ = stream.close(None).await;
                        }
                        self.shared.set_state(SignalingState::Closed);
                        break;
                    }
                },
                message = async { ws.as_mut().expect("guarded by ws.is_some()").next().await }, if ws.is_some() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_incoming(&text),
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame
                                .map(|f| CloseCode::from_u16(u16::from(f.code)))
                                .unwrap_or(CloseCode::Abnormal);
                            info!("Signaling connection closed by server: {:?}", code);
                            ws = None;
                            self.handle_connection_loss(&mut reconnect_at);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signaling socket error: {}", e);
                            ws = None;
                            self.handle_connection_loss(&mut reconnect_at);
                        }
                        None => {
                            info!("Signaling stream ended");
                            ws = None;
                            self.handle_connection_loss(&mut reconnect_at);
                        }
                    }
                },
                _ = async { tokio::time::sleep_until(reconnect_at.expect("guarded")).await }, if reconnect_at.is_some() => {
                    reconnect_at = None;
                    self.try_connect(&mut ws, &mut reconnect_at).await;
                },
            }
        }

        debug!("Signaling worker terminated");
    }

    async fn handle_command(
        &mut self,
        cmd: ClientCommand,
        ws: &mut Option<WsStream>,
        reconnect_at: &mut Option<tokio::time::Instant>,
    ) {
        match cmd {
            ClientCommand::Open { id, password } => {
                if ws.is_some() {
                    warn!("Open requested while already connected");
                    return;
                }
                self.credentials = Some((id, password));
                self.attempts_made = 0;
                *reconnect_at = None;
                self.try_connect(ws, reconnect_at).await;
            }
            ClientCommand::Send(envelope) => {
                let Some(stream) = ws.as_mut() else {
                    warn!(
                        "Command '{}' dropped, signaling not connected",
                        envelope.command
                    );
                    return;
                };
                match envelope.to_json() {
                    Ok(json) => {
                        if let Err(e) = stream.send(Message::Text(json)).await {
                            warn!("Failed to send signaling command: {}", e);
                            *ws = None;
                            self.handle_connection_loss(reconnect_at);
                        }
                    }
                    Err(e) => warn!("Failed to encode signaling command: {}", e),
                }
            }
            ClientCommand::Close { done } => {
                self.shared.set_state(SignalingState::Closing);
                *reconnect_at = None;
                self.credentials = None;
                self.attempts_made = 0;
                if let Some(mut stream) = ws.take() {
                    let _ = stream.close(None).await;
                }
                self.shared.set_state(SignalingState::Closed);
                self.fire_closed(CloseCode::Normal);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }

    async fn try_connect(
        &mut self,
        ws: &mut Option<WsStream>,
        reconnect_at: &mut Option<tokio::time::Instant>,
    ) {
        self.shared.set_state(SignalingState::Opening);
        match self.connect().await {
            Ok(stream) => {
                *ws = Some(stream);
                self.attempts_made = 0;
                self.shared.set_state(SignalingState::Opened);
                info!("Signaling connection opened to {}", self.url);
            }
            Err(e) => {
                warn!("Signaling connect failed: {}", e);
                self.shared.set_state(SignalingState::Closed);
                self.schedule_reconnect(reconnect_at);
            }
        }
    }

    async fn connect(&mut self) -> Result<WsStream> {
        let (id, password) = self.credentials.clone().ok_or_else(|| {
            Error::SignalingError("no credentials for signaling open".to_string())
        })?;

        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let envelope = CommandEnvelope::global(
            COMMAND_OPEN,
            serde_json::json!({ "id": id, "password": password }),
        );
        stream
            .send(Message::Text(envelope.to_json()?))
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to send open command: {}", e)))?;

        Ok(stream)
    }

    /// Unexpected loss: reconnect silently while attempts remain; only
    /// exhaustion of the limit is surfaced through the closed callback
    fn handle_connection_loss(&mut self, reconnect_at: &mut Option<tokio::time::Instant>) {
        self.shared.set_state(SignalingState::Closed);
        self.schedule_reconnect(reconnect_at);
    }

    fn schedule_reconnect(&mut self, reconnect_at: &mut Option<tokio::time::Instant>) {
        // Explicit close cleared the credentials; no reconnection after
        // teardown begins.
        if self.credentials.is_none() {
            return;
        }

        if !self.policy.allows(self.attempts_made) {
            warn!(
                "Signaling reconnect attempt limit ({}) reached",
                self.policy.attempts
            );
            self.fire_closed(CloseCode::Abnormal);
            return;
        }

        let delay = self.policy.delay(self.attempts_made);
        self.attempts_made += 1;
        info!(
            "Scheduling signaling reconnect attempt {} in {:?}",
            self.attempts_made, delay
        );
        *reconnect_at = Some(tokio::time::Instant::now() + delay);
    }

    fn handle_incoming(&self, text: &str) {
        let envelope = match CommandEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed signaling message: {}", e);
                return;
            }
        };

        if envelope.command == COMMAND_OPEN {
            if let Some(session_id) = envelope.data.get("session_id").and_then(|v| v.as_str()) {
                debug!("Signaling session established: {}", session_id);
                *self.shared.session_id.write() = session_id.to_string();
            }
        }

        match self.shared.on_command.read().clone() {
            Some(callback) => callback(envelope),
            None => debug!(
                "Inbound command '{}' dropped, no subscriber registered",
                envelope.command
            ),
        }
    }

    fn fire_closed(&self, code: CloseCode) {
        if let Some(callback) = self.shared.on_closed.read().clone() {
            callback(code);
        }
    }
}
