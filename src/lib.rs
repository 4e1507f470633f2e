//! LanLink - Chat- und Anruf-Client für Metal-52 Knoten
//!
//! Ein Client für das lokale Knotennetz mit:
//! - WebSocket-Verbindung zum Knoten (mit Reconnect)
//! - Chat-Verlauf mit Export
//! - WebRTC Audio-/Videoanrufen, signalisiert über den Knoten
//! - Peer-Registrierung über die HTTP-API des Knotens

pub mod call_engine;
pub mod chat;
pub mod config;
pub mod peers;
pub mod signaling;

use call_engine::{
    CallEngine, CallEngineError, CallEvent, CallType, MediaDevices, SampleTrackDevices,
};
use chat::{ChatEntry, ChatView, ExportFormat};
use config::{AppConfig, ConfigError};
use parking_lot::{Mutex, RwLock};
use peers::{PeerApi, PeerApiError, DEFAULT_PEER_PORT};
use serde::Serialize;
use signaling::{Incoming, SignalingClient, SignalingError, SignalingEvent, WireMessage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Absender für Frames ohne eigenen Absender
const NETWORK_SENDER: &str = "Network";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Call(#[from] CallEngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Peer(#[from] PeerApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("App already started")]
    AlreadyStarted,
}

// ============================================================================
// UI EVENTS
// ============================================================================

/// Anzeigestatus der Knotenverbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Connected,
    Disconnected,
    Error,
    Emergency,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Connected => "CONNECTED",
            NodeStatus::Disconnected => "DISCONNECTED",
            NodeStatus::Error => "ERROR",
            NodeStatus::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Empfängt das nächste Event; `None` wenn der Sender geschlossen ist
///
/// Ein zu langsamer Empfänger verliert die übersprungenen Events, bleibt
/// aber angemeldet.
pub async fn recv_event<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event receiver lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Events für das Frontend
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status(NodeStatus),
    /// Neuer Eintrag im Chat
    Chat(ChatEntry),
    /// Verlauf geleert; enthält den verbleibenden Hinweis
    ChatCleared(ChatEntry),
    Call(CallEvent),
}

// ============================================================================
// APPLICATION
// ============================================================================

/// Application State
pub struct App {
    config: AppConfig,
    local_peer_id: String,
    chat: Mutex<ChatView>,
    signaling: Arc<SignalingClient>,
    calls: Arc<CallEngine>,
    peers: PeerApi,
    status: RwLock<NodeStatus>,
    ui_tx: broadcast::Sender<UiEvent>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<WireMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Erstellt die Anwendung mit Sample-Tracks als Medienquelle
    pub fn new(config: AppConfig) -> Result<Arc<Self>, AppError> {
        Self::with_devices(config, Arc::new(SampleTrackDevices::default()))
    }

    pub fn with_devices(
        config: AppConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Arc<Self>, AppError> {
        let ws_url = config.ws_url()?;
        let local_peer_id = config.peer_id();
        tracing::info!("Local peer id: {}", local_peer_id);

        let signaling = Arc::new(SignalingClient::new(
            ws_url.to_string(),
            config.reconnect_policy(),
        ));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(CallEngine::new(
            local_peer_id.clone(),
            config.rtc_ice_servers(),
            devices,
            outbound_tx,
        ));

        let peers = PeerApi::new(&config.node_url)?;
        let (ui_tx, _) = broadcast::channel(512);

        Ok(Arc::new(Self {
            config,
            local_peer_id,
            chat: Mutex::new(ChatView::new()),
            signaling,
            calls,
            peers,
            status: RwLock::new(NodeStatus::Disconnected),
            ui_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Gibt einen Event-Receiver für das Frontend zurück
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn calls(&self) -> &Arc<CallEngine> {
        &self.calls
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Kopie des aktuellen Verlaufs
    pub fn chat_entries(&self) -> Vec<ChatEntry> {
        self.chat.lock().entries().to_vec()
    }

    /// Startet Verbindung, Event-Weiterleitung und die Discovery-Ankündigung
    pub fn start(self: &Arc<Self>) -> Result<(), AppError> {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .take()
            .ok_or(AppError::AlreadyStarted)?;

        let mut tasks = Vec::new();

        // Signaling Events -> Status und Dispatch
        let mut signaling_rx = self.signaling.subscribe();
        let app = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = recv_event(&mut signaling_rx).await {
                app.handle_signaling_event(event).await;
            }
        }));

        // Ausgehende Anruf-Signale -> WebSocket
        let app = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut outbound_rx = outbound_rx;
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = app.signaling.send_message(&message) {
                    tracing::warn!("Dropping outbound call signal: {}", e);
                }
            }
        }));

        // Call Events -> Frontend
        let mut call_rx = self.calls.subscribe();
        let app = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = recv_event(&mut call_rx).await {
                match event {
                    CallEvent::System(text) => app.add_system(&text),
                    other => app.emit(UiEvent::Call(other)),
                }
            }
        }));

        // Discovery nach dem Start
        let app = Arc::clone(self);
        let delay = self.config.discovery_delay();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = app.discover_peers() {
                tracing::debug!("Skipping startup discovery: {}", e);
            }
        }));

        tasks.push(self.signaling.start());
        self.tasks.lock().extend(tasks);

        tracing::info!("LanLink started, node at {}", self.signaling.url());
        Ok(())
    }

    /// Beendet alle Hintergrund-Tasks
    pub fn shutdown(&self) {
        if self.calls.is_active() {
            self.calls.abort_call();
        }
        self.signaling.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn handle_signaling_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => self.set_status(NodeStatus::Connected),
            SignalingEvent::Disconnected => self.set_status(NodeStatus::Disconnected),
            SignalingEvent::Error(e) => {
                tracing::warn!("Node connection error: {}", e);
                self.set_status(NodeStatus::Error);
            }
            SignalingEvent::Reconnecting {
                attempt,
                max_attempts,
                delay,
            } => {
                tracing::info!(
                    "Reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    max_attempts
                );
            }
            SignalingEvent::GaveUp { attempts } => {
                self.add_system(&format!(
                    "Connection to node lost after {} reconnect attempts",
                    attempts
                ));
            }
            SignalingEvent::Message(text) => self.dispatch_frame(&text).await,
        }
    }

    /// Verarbeitet einen Text-Frame vom Knoten
    pub async fn dispatch_frame(&self, text: &str) {
        match Incoming::parse(text) {
            Incoming::Message(WireMessage::Chat {
                sender,
                message,
                timestamp,
            }) => {
                let sender = sender.unwrap_or_else(|| NETWORK_SENDER.to_string());
                self.add_message(&sender, &message, timestamp.as_deref());
            }
            Incoming::Message(WireMessage::UdpMessage {
                from,
                message,
                timestamp,
            }) => {
                let from = from.unwrap_or_else(|| NETWORK_SENDER.to_string());
                self.add_message(&from, &message, timestamp.as_deref());
            }
            Incoming::Message(WireMessage::System { message }) => self.add_system(&message),
            Incoming::Message(WireMessage::CallRequest { call_type, caller }) => {
                self.calls.handle_call_request(call_type, caller);
            }
            Incoming::Message(WireMessage::WebrtcSignal { signal }) => {
                let kind = signal.kind();
                if let Err(e) = self.calls.handle_signal(signal).await {
                    tracing::error!("Failed to handle {} signal: {}", kind, e);
                }
            }
            Incoming::Raw(text) => self.add_message(NETWORK_SENDER, &text, None),
        }
    }

    // ========================================================================
    // COMMANDS - CHAT
    // ========================================================================

    /// Sendet eine Chat-Nachricht; `false` wenn leer oder nicht verbunden
    pub fn send_chat(&self, text: &str) -> Result<bool, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        if !self.signaling.is_connected() {
            tracing::debug!("Not connected, dropping chat message");
            return Ok(false);
        }

        self.signaling.send_message(&WireMessage::Chat {
            sender: Some(self.local_peer_id.clone()),
            message: text.to_string(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        })?;
        Ok(true)
    }

    /// Kündigt diesen Knoten im Netz an
    pub fn discover_peers(&self) -> Result<(), AppError> {
        self.signaling
            .send_text(format!("DISCOVERY:Node-{} is online", self.config.node_id))?;
        tracing::info!("Discovery announcement sent");
        Ok(())
    }

    pub fn clear_chat(&self) {
        let notice = self.chat.lock().clear();
        self.emit(UiEvent::ChatCleared(notice));
    }

    /// Exportiert den Verlauf in das konfigurierte Verzeichnis
    pub fn export_chat(&self, format: ExportFormat) -> Result<PathBuf, AppError> {
        let dir = self.config.export_dir();
        Ok(self.chat.lock().export(&dir, format)?)
    }

    /// Meldet eine ausgewählte Datei im Chat (keine Übertragung)
    pub fn attach_file(&self, path: &Path) -> Result<(), AppError> {
        let metadata = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        self.add_system(&format!(
            "File selected: {} ({} bytes)",
            name,
            metadata.len()
        ));
        Ok(())
    }

    // ========================================================================
    // COMMANDS - CALLS
    // ========================================================================

    pub fn start_call(&self, call_type: CallType) -> Result<(), AppError> {
        Ok(self.calls.start_call(call_type)?)
    }

    pub async fn accept_call(&self) -> Result<(), AppError> {
        Ok(self.calls.accept_call().await?)
    }

    pub fn decline_call(&self) -> Result<(), AppError> {
        self.calls.decline_call()?;
        Ok(())
    }

    pub fn end_call(&self) {
        self.calls.end_call();
    }

    pub fn toggle_mute(&self) -> Result<bool, AppError> {
        Ok(self.calls.toggle_mute()?)
    }

    pub fn toggle_video(&self) -> Result<bool, AppError> {
        Ok(self.calls.toggle_video()?)
    }

    pub async fn share_screen(&self) -> Result<(), AppError> {
        Ok(self.calls.share_screen().await?)
    }

    pub async fn stop_screen_share(&self) -> Result<(), AppError> {
        Ok(self.calls.stop_screen_share().await?)
    }

    // ========================================================================
    // COMMANDS - NODE
    // ========================================================================

    /// Registriert einen Peer beim Knoten und kündigt uns danach an
    pub async fn add_peer(
        &self,
        ip: &str,
        port: Option<u16>,
    ) -> Result<serde_json::Value, AppError> {
        let ip = ip.trim();
        let port = port.unwrap_or(DEFAULT_PEER_PORT);

        match self.peers.add_peer(ip, Some(port)).await {
            Ok(reply) => {
                tracing::info!("Peer added: {:?}", reply);
                if let Err(e) = self.discover_peers() {
                    tracing::debug!("Discovery after add_peer skipped: {}", e);
                }
                self.add_system(&format!("Peer added: {}:{}", ip, port));
                Ok(reply)
            }
            Err(PeerApiError::EmptyAddress) => Err(PeerApiError::EmptyAddress.into()),
            Err(e) => {
                tracing::error!("Failed to add peer: {}", e);
                self.add_system(&format!("Failed to add peer: {}", e));
                Err(e.into())
            }
        }
    }

    /// Trennt alles sofort: Anruf, Verbindung, Verlauf
    pub fn emergency_stop(&self) {
        tracing::warn!("Emergency stop requested");

        if self.calls.is_active() {
            self.calls.abort_call();
        }
        self.signaling.shutdown();

        self.clear_chat();
        self.add_system("EMERGENCY STOP ACTIVATED - All connections terminated");
        self.set_status(NodeStatus::Emergency);
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn add_message(&self, sender: &str, text: &str, timestamp: Option<&str>) {
        let entry = self.chat.lock().add_message(sender, text, timestamp);
        self.emit(UiEvent::Chat(entry));
    }

    fn add_system(&self, text: &str) {
        let entry = self.chat.lock().add_system(text);
        self.emit(UiEvent::Chat(entry));
    }

    /// EMERGENCY bleibt stehen, bis die Anwendung neu startet
    fn set_status(&self, status: NodeStatus) {
        {
            let mut current = self.status.write();
            if *current == NodeStatus::Emergency || *current == status {
                return;
            }
            *current = status;
        }
        tracing::info!("Node status: {}", status);
        self.emit(UiEvent::Status(status));
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui_tx.send(event);
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("local_peer_id", &self.local_peer_id)
            .field("status", &self.status())
            .field("signaling", &self.signaling)
            .field("calls", &self.calls)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
