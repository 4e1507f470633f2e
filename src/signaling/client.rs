//! WebSocket Client für den Knoten
//!
//! Verwaltet die WebSocket-Verbindung zum lokalen Knoten:
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Event-basierte Kommunikation
//! - Senden von Text-Frames und JSON-Umschlägen

use super::messages::WireMessage;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to node")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Knoten
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Verbindungs- oder Protokollfehler
    Error(String),

    /// Nächster Verbindungsversuch ist geplant
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },

    /// Alle Versuche aufgebraucht, es wird nicht mehr verbunden
    GaveUp { attempts: u32 },

    /// Eingehender Text-Frame
    Message(String),
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Exponentieller Backoff mit begrenzter Anzahl Versuche
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Wartezeit vor Versuch `attempt` (1-basiert), `None` = aufgeben
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Default)]
struct ClientState {
    is_connected: bool,
    attempts: u32,
    tx: Option<mpsc::UnboundedSender<Message>>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Knoten
pub struct SignalingClient {
    url: String,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ClientState>>,
    event_tx: broadcast::Sender<SignalingEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient (verbindet noch nicht)
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            url: url.into(),
            policy,
            state: Arc::new(RwLock::new(ClientState::default())),
            event_tx,
            shutdown_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Anzahl der Reconnect-Versuche seit der letzten erfolgreichen Verbindung
    pub fn attempts(&self) -> u32 {
        self.state.read().attempts
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Startet die Verbindungsschleife im Hintergrund
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await })
    }

    /// Beendet die Verbindung endgültig (kein Reconnect)
    pub fn shutdown(&self) {
        tracing::info!("Shutting down node connection");
        self.shutdown_tx.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Sendet einen rohen Text-Frame
    ///
    /// Ohne offene Verbindung wird der Frame verworfen.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SignalingError> {
        let state = self.state.read();
        if !state.is_connected {
            return Err(SignalingError::NotConnected);
        }
        let tx = state.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        tx.send(Message::Text(text.into()))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Serialisiert und sendet einen Umschlag
    pub fn send_message(&self, message: &WireMessage) -> Result<(), SignalingError> {
        let text =
            serde_json::to_string(message).map_err(|e| SignalingError::Encode(e.to_string()))?;
        self.send_text(text)
    }

    /// Verbindungsschleife: verbinden, bedienen, mit Backoff neu verbinden
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.is_shut_down() {
                break;
            }

            tracing::info!("Connecting to node: {}", self.url);

            match connect_async(self.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    tracing::info!("Connected to node");
                    self.state.write().attempts = 0;
                    self.serve(ws_stream, &mut shutdown_rx).await;
                }
                Err(e) => {
                    let err = SignalingError::ConnectionFailed(e.to_string());
                    tracing::warn!("{}", err);
                    let _ = self.event_tx.send(SignalingEvent::Error(err.to_string()));
                }
            }

            {
                let mut state = self.state.write();
                state.is_connected = false;
                state.tx = None;
            }
            let _ = self.event_tx.send(SignalingEvent::Disconnected);

            if self.is_shut_down() {
                break;
            }

            let attempt = {
                let mut state = self.state.write();
                state.attempts += 1;
                state.attempts
            };

            let Some(delay) = self.policy.delay_for(attempt) else {
                let attempts = attempt - 1;
                tracing::warn!("Giving up on node after {} reconnect attempts", attempts);
                let _ = self.event_tx.send(SignalingEvent::GaveUp { attempts });
                break;
            };

            tracing::info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.policy.max_attempts
            );
            let _ = self.event_tx.send(SignalingEvent::Reconnecting {
                attempt,
                max_attempts: self.policy.max_attempts,
                delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        tracing::debug!("Connection loop finished");
    }

    /// Bedient eine offene Verbindung bis sie schließt
    async fn serve(&self, ws_stream: WsStream, shutdown_rx: &mut watch::Receiver<bool>) {
        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.tx = Some(tx);
        }
        let _ = self.event_tx.send(SignalingEvent::Connected);

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.event_tx.send(SignalingEvent::Message(text));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("WebSocket closed by node");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = self.event_tx.send(SignalingEvent::Error(e.to_string()));
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                outgoing = rx.recv() => {
                    let Some(msg) = outgoing else { break };
                    if let Err(e) = write.send(msg).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        let _ = self.event_tx.send(SignalingEvent::Error(e.to_string()));
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SignalingClient")
            .field("url", &self.url)
            .field("is_connected", &state.is_connected)
            .field("attempts", &state.attempts)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
