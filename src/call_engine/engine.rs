//! WebRTC Call Engine
//!
//! Verwaltet genau eine Peer Connection und koordiniert den
//! Offer/Answer/ICE-Austausch über den Knoten. Medien werden über
//! `MediaDevices` beschafft.

use super::media::{
    CallType, LocalStream, MediaConstraints, MediaDevices, MediaError, RemoteStream,
    RemoteTrackInfo, TrackKind,
};
use crate::signaling::{Signal, WireMessage};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No pending call")]
    NoPendingCall,

    #[error("No {0} track in local stream")]
    NoTrack(&'static str),

    #[error("Screen is not being shared")]
    NotSharing,

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Signaling channel closed")]
    SignalingClosed,
}

fn webrtc_err(e: webrtc::Error) -> CallEngineError {
    CallEngineError::WebRTC(e.to_string())
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Rolle im aktuellen Anruf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Eingehender Anruf, der auf Annahme oder Ablehnung wartet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCall {
    pub caller: String,
    pub call_type: CallType,
}

/// Momentaufnahme der Sitzung
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallStatus {
    pub active: bool,
    pub call_type: Option<CallType>,
    pub role: Option<CallRole>,
    pub remote_peer: Option<String>,
    pub has_peer_connection: bool,
    pub pending_candidates: usize,
    pub sharing_screen: bool,
}

/// Events die vom CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Systemmeldung für den Chat
    System(String),
    IncomingCall(PendingCall),
    MediaPanel { visible: bool },
    MuteChanged { muted: bool },
    VideoChanged { enabled: bool },
    RemoteTrack(RemoteTrackInfo),
}

/// Die eine Anrufsitzung pro Client
#[derive(Default)]
struct CallSession {
    /// Wird bei jedem Reset erhöht; Callbacks alter Verbindungen vergleichen dagegen
    generation: u64,
    active: bool,
    call_type: Option<CallType>,
    role: Option<CallRole>,
    remote_peer: Option<String>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
    local_stream: Option<LocalStream>,
    remote_stream: RemoteStream,
    video_sender: Option<Arc<RTCRtpSender>>,
    screen_stream: Option<LocalStream>,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl CallSession {
    /// Setzt die Sitzung zurück und gibt die zu schließende Verbindung zurück
    fn reset(&mut self) -> Option<Arc<RTCPeerConnection>> {
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        if let Some(stream) = self.screen_stream.take() {
            stream.stop();
        }
        let pc = self.peer_connection.take();
        let generation = self.generation + 1;
        *self = CallSession {
            generation,
            ..Default::default()
        };
        pc
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// WebRTC Call Engine
pub struct CallEngine {
    local_peer_id: String,
    ice_servers: Vec<RTCIceServer>,
    devices: Arc<dyn MediaDevices>,
    session: Arc<Mutex<CallSession>>,
    pending: Mutex<Option<PendingCall>>,
    outbound: mpsc::UnboundedSender<WireMessage>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    ///
    /// Ausgehende Signale landen in `outbound` und werden vom Aufrufer an
    /// den Knoten weitergereicht.
    pub fn new(
        local_peer_id: String,
        ice_servers: Vec<RTCIceServer>,
        devices: Arc<dyn MediaDevices>,
        outbound: mpsc::UnboundedSender<WireMessage>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            local_peer_id,
            ice_servers,
            devices,
            session: Arc::new(Mutex::new(CallSession::default())),
            pending: Mutex::new(None),
            outbound,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn is_active(&self) -> bool {
        self.session.lock().active
    }

    /// Gibt den aktuellen Sitzungsstatus zurück
    pub fn status(&self) -> CallStatus {
        let session = self.session.lock();
        CallStatus {
            active: session.active,
            call_type: session.call_type,
            role: session.role,
            remote_peer: session.remote_peer.clone(),
            has_peer_connection: session.peer_connection.is_some(),
            pending_candidates: session.pending_candidates.len(),
            sharing_screen: session.screen_stream.is_some(),
        }
    }

    pub fn pending_call(&self) -> Option<PendingCall> {
        self.pending.lock().clone()
    }

    /// Lokaler Stream, in den die Anwendung Samples schreibt
    pub fn local_stream(&self) -> Option<LocalStream> {
        self.session.lock().local_stream.clone()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrackInfo> {
        self.session.lock().remote_stream.tracks().to_vec()
    }

    /// Prüft ob die Gegenseite ihre Session Description geliefert hat
    pub async fn has_remote_description(&self) -> bool {
        let pc = self.session.lock().peer_connection.clone();
        match pc {
            Some(pc) => pc.remote_description().await.is_some(),
            None => false,
        }
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Beschafft die Medien und sendet eine `call_request` an alle Knoten.
    /// Die Peer Connection entsteht erst, wenn die Gegenseite antwortet.
    pub fn start_call(&self, call_type: CallType) -> Result<(), CallEngineError> {
        if self.is_active() {
            return Err(CallEngineError::AlreadyInCall);
        }

        let stream = match self
            .devices
            .get_user_media(&MediaConstraints::for_call(call_type))
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("{} call failed: {}", call_type.title(), e);
                self.system(format!("{} call failed: {}", call_type.title(), e));
                return Err(e.into());
            }
        };

        {
            let mut session = self.session.lock();
            session.active = true;
            session.call_type = Some(call_type);
            session.role = Some(CallRole::Caller);
            session.local_stream = Some(stream);
        }

        if let Err(e) = self.send(WireMessage::CallRequest {
            call_type,
            caller: self.local_peer_id.clone(),
        }) {
            self.teardown();
            return Err(e);
        }

        self.system(format!("Starting {} call...", call_type));
        self.emit(CallEvent::MediaPanel { visible: true });
        Ok(())
    }

    /// Registriert eine eingehende Anrufanfrage
    ///
    /// Eine neue Anfrage überschreibt eine noch offene (kein Warteschlange).
    pub fn handle_call_request(&self, call_type: CallType, caller: String) {
        if caller == self.local_peer_id {
            tracing::debug!("Ignoring own call request");
            return;
        }

        if self.is_active() {
            tracing::info!("Busy, ignoring {} call from {}", call_type, caller);
            self.system(format!("Missed {} call from {} (busy)", call_type, caller));
            return;
        }

        let call = PendingCall { caller, call_type };
        if let Some(previous) = self.pending.lock().replace(call.clone()) {
            tracing::debug!("Replacing pending call from {}", previous.caller);
        }

        tracing::info!("Incoming {} call from {}", call.call_type, call.caller);
        self.emit(CallEvent::IncomingCall(call));
    }

    /// Nimmt den wartenden Anruf an und sendet das Offer an den Anrufer
    pub async fn accept_call(&self) -> Result<(), CallEngineError> {
        if self.is_active() {
            return Err(CallEngineError::AlreadyInCall);
        }
        let call = self
            .pending
            .lock()
            .take()
            .ok_or(CallEngineError::NoPendingCall)?;

        match self.try_accept(&call).await {
            Ok(()) => {
                self.system(format!(
                    "Accepted {} call from {}",
                    call.call_type, call.caller
                ));
                self.emit(CallEvent::MediaPanel { visible: true });
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to accept call: {}", e);
                self.system(format!("Failed to accept call: {}", e));
                self.teardown();
                Err(e)
            }
        }
    }

    async fn try_accept(&self, call: &PendingCall) -> Result<(), CallEngineError> {
        let stream = self
            .devices
            .get_user_media(&MediaConstraints::for_call(call.call_type))?;

        let generation = {
            let mut session = self.session.lock();
            session.active = true;
            session.call_type = Some(call.call_type);
            session.role = Some(CallRole::Callee);
            session.remote_peer = Some(call.caller.clone());
            session.local_stream = Some(stream);
            session.generation
        };

        let pc = self.create_peer_connection(&call.caller, generation).await?;

        self.send_signal(Signal::CallAccepted {
            target_peer: Some(call.caller.clone()),
            from_peer: self.local_peer_id.clone(),
            call_type: Some(call.call_type),
        })?;

        let offer = pc.create_offer(None).await.map_err(webrtc_err)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;

        self.send_signal(Signal::Offer {
            offer: offer.into(),
            target_peer: Some(call.caller.clone()),
            from_peer: self.local_peer_id.clone(),
            call_type: Some(call.call_type),
        })
    }

    /// Lehnt den wartenden Anruf ab
    pub fn decline_call(&self) -> Result<PendingCall, CallEngineError> {
        let call = self
            .pending
            .lock()
            .take()
            .ok_or(CallEngineError::NoPendingCall)?;
        self.system(format!("Declined call from {}", call.caller));
        Ok(call)
    }

    /// Verarbeitet ein WebRTC-Signal vom Knoten
    ///
    /// Signale werden vom Aufrufer sequenziell zugestellt.
    pub async fn handle_signal(&self, signal: Signal) -> Result<(), CallEngineError> {
        let from = signal.from_peer().to_string();

        if from == self.local_peer_id {
            return Ok(());
        }
        if let Some(target) = signal.target_peer() {
            if target != self.local_peer_id {
                return Ok(());
            }
        }

        let (existing, generation) = {
            let session = self.session.lock();
            if !session.active {
                tracing::debug!("Ignoring {} from {}: no active call", signal.kind(), from);
                return Ok(());
            }
            if let Some(peer) = &session.remote_peer {
                if *peer != from {
                    tracing::warn!(
                        "Ignoring {} from {}: already talking to {}",
                        signal.kind(),
                        from,
                        peer
                    );
                    return Ok(());
                }
            }
            (session.peer_connection.clone(), session.generation)
        };

        let pc = match existing {
            Some(pc) => pc,
            None => self.create_peer_connection(&from, generation).await?,
        };

        tracing::debug!("Handling {} from {}", signal.kind(), from);

        match signal {
            Signal::Offer { offer, .. } => {
                let desc = RTCSessionDescription::offer(offer.sdp)
                    .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
                pc.set_remote_description(desc).await.map_err(webrtc_err)?;
                self.flush_pending_candidates(&pc).await;

                let answer = pc.create_answer(None).await.map_err(webrtc_err)?;
                pc.set_local_description(answer.clone())
                    .await
                    .map_err(webrtc_err)?;

                self.send_signal(Signal::Answer {
                    answer: answer.into(),
                    target_peer: Some(from),
                    from_peer: self.local_peer_id.clone(),
                })?;
            }

            Signal::Answer { answer, .. } => {
                let desc = RTCSessionDescription::answer(answer.sdp)
                    .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
                pc.set_remote_description(desc).await.map_err(webrtc_err)?;
                self.flush_pending_candidates(&pc).await;
            }

            Signal::IceCandidate { candidate, .. } => {
                if pc.remote_description().await.is_some() {
                    pc.add_ice_candidate(candidate.into())
                        .await
                        .map_err(webrtc_err)?;
                } else {
                    let mut session = self.session.lock();
                    if session.generation == generation {
                        tracing::debug!("Remote description not set yet, queuing candidate");
                        session.pending_candidates.push(candidate.into());
                    } else {
                        tracing::debug!("Dropping candidate from {}: call ended", from);
                    }
                }
            }

            Signal::CallAccepted { .. } => {
                self.system(format!("{} accepted the call", from));
            }
        }

        Ok(())
    }

    /// Schaltet das Mikrofon stumm bzw. wieder an; gibt `muted` zurück
    pub fn toggle_mute(&self) -> Result<bool, CallEngineError> {
        let track = {
            let session = self.session.lock();
            let stream = session
                .local_stream
                .as_ref()
                .ok_or(CallEngineError::NoActiveCall)?;
            let track = stream
                .audio_tracks()
                .next()
                .cloned()
                .ok_or(CallEngineError::NoTrack("audio"))?;
            track
        };

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);

        let muted = !enabled;
        self.emit(CallEvent::MuteChanged { muted });
        self.system(if muted { "Muted" } else { "Unmuted" });
        Ok(muted)
    }

    /// Schaltet die Kamera an bzw. aus; gibt `enabled` zurück
    pub fn toggle_video(&self) -> Result<bool, CallEngineError> {
        let track = {
            let session = self.session.lock();
            let stream = session
                .local_stream
                .as_ref()
                .ok_or(CallEngineError::NoActiveCall)?;
            let track = stream
                .video_tracks()
                .next()
                .cloned()
                .ok_or(CallEngineError::NoTrack("video"))?;
            track
        };

        let enabled = !track.is_enabled();
        track.set_enabled(enabled);

        self.emit(CallEvent::VideoChanged { enabled });
        self.system(if enabled { "Video on" } else { "Video off" });
        Ok(enabled)
    }

    /// Ersetzt den ausgehenden Videotrack durch den Bildschirm
    pub async fn share_screen(&self) -> Result<(), CallEngineError> {
        let generation = self.session.lock().generation;
        let screen = match self.devices.get_display_media() {
            Ok(screen) => screen,
            Err(e) => {
                tracing::error!("Screen sharing failed: {}", e);
                self.system(format!("Screen sharing failed: {}", e));
                return Err(e.into());
            }
        };

        let Some(video) = screen.video_tracks().next().cloned() else {
            let err = CallEngineError::NoTrack("video");
            self.system(format!("Screen sharing failed: {}", err));
            return Err(err);
        };

        let sender = self.session.lock().video_sender.clone();
        if let Some(sender) = sender {
            if let Err(e) = sender.replace_track(Some(video.as_track_local())).await {
                let err = webrtc_err(e);
                screen.stop();
                self.system(format!("Screen sharing failed: {}", err));
                return Err(err);
            }
        }

        let replaced = {
            let mut session = self.session.lock();
            if session.generation == generation {
                Ok(session.screen_stream.replace(screen))
            } else {
                Err(screen)
            }
        };
        match replaced {
            Ok(Some(previous)) => previous.stop(),
            Ok(None) => {}
            Err(screen) => {
                // Anruf wurde währenddessen beendet
                screen.stop();
                return Err(CallEngineError::NoActiveCall);
            }
        }

        self.system("Screen sharing started");
        Ok(())
    }

    /// Beendet die Bildschirmfreigabe und schaltet zurück auf die Kamera
    pub async fn stop_screen_share(&self) -> Result<(), CallEngineError> {
        let (screen, camera, sender) = {
            let mut session = self.session.lock();
            let camera = session
                .local_stream
                .as_ref()
                .and_then(|s| s.video_tracks().next().cloned());
            (session.screen_stream.take(), camera, session.video_sender.clone())
        };

        let screen = screen.ok_or(CallEngineError::NotSharing)?;
        screen.stop();

        if let (Some(camera), Some(sender)) = (camera, sender) {
            sender
                .replace_track(Some(camera.as_track_local()))
                .await
                .map_err(webrtc_err)?;
        }

        self.system("Screen sharing ended");
        Ok(())
    }

    /// Beendet den aktuellen Anruf
    pub fn end_call(&self) {
        self.teardown();
        self.system("Call ended");
    }

    /// Beendet den Anruf ohne Systemmeldung (Not-Aus, Herunterfahren)
    pub fn abort_call(&self) {
        self.teardown();
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn teardown(&self) {
        let pc = self.session.lock().reset();
        if let Some(pc) = pc {
            close_later(pc);
        }
        self.emit(CallEvent::MediaPanel { visible: false });
    }

    /// Erstellt die Peer Connection zu `peer_id` und hängt die lokalen Tracks an
    ///
    /// Gehört `generation` nicht mehr zur laufenden Sitzung, wird die neue
    /// Verbindung geschlossen statt gespeichert.
    async fn create_peer_connection(
        &self,
        peer_id: &str,
        generation: u64,
    ) -> Result<Arc<RTCPeerConnection>, CallEngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);

        let tracks = {
            let session = self.session.lock();
            if session.generation == generation {
                session
                    .local_stream
                    .as_ref()
                    .map(|s| s.tracks().to_vec())
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        self.setup_peer_connection_handlers(&pc, peer_id, generation);

        let mut video_sender = None;
        for track in &tracks {
            let sender = pc
                .add_track(track.as_track_local())
                .await
                .map_err(webrtc_err)?;
            drain_rtcp(Arc::clone(&sender));
            if track.kind() == TrackKind::Video && video_sender.is_none() {
                video_sender = Some(sender);
            }
        }

        let stored = {
            let mut session = self.session.lock();
            if session.generation == generation && session.active {
                session.peer_connection = Some(Arc::clone(&pc));
                session.remote_peer = Some(peer_id.to_string());
                session.video_sender = video_sender;
                true
            } else {
                false
            }
        };
        if !stored {
            tracing::debug!("Call ended while connecting to {}, closing", peer_id);
            close_later(pc);
            return Err(CallEngineError::NoActiveCall);
        }

        tracing::info!("Created peer connection to {}", peer_id);
        Ok(pc)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_peer_connection_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        peer_id: &str,
        generation: u64,
    ) {
        // ICE Candidate Handler
        let outbound = self.outbound.clone();
        let local_peer_id = self.local_peer_id.clone();
        let target = peer_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let msg = WireMessage::WebrtcSignal {
                            signal: Signal::IceCandidate {
                                candidate: init.into(),
                                target_peer: Some(target.clone()),
                                from_peer: local_peer_id.clone(),
                            },
                        };
                        if outbound.send(msg).is_err() {
                            tracing::warn!("Dropping ICE candidate: signaling channel closed");
                        }
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (entfernter Stream)
        let session = Arc::clone(&self.session);
        let event_tx = self.event_tx.clone();
        let remote = peer_id.to_string();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let info = RemoteTrackInfo {
                id: track.id(),
                stream_id: track.stream_id(),
                kind: match track.kind() {
                    RTPCodecType::Video => TrackKind::Video,
                    _ => TrackKind::Audio,
                },
                mime_type: track.codec().capability.mime_type,
            };
            tracing::info!("Remote track received from {}: {:?}", remote, info);
            record_remote_track(&session, &event_tx, generation, info);
            Box::pin(async {})
        }));

        // Connection State Handler
        let session = Arc::clone(&self.session);
        let event_tx = self.event_tx.clone();
        let remote = peer_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Connection state with {}: {}", remote, s);
            on_connection_state(&session, &event_tx, &remote, generation, s);
            Box::pin(async {})
        }));
    }

    /// Wendet zurückgehaltene ICE Candidates an
    async fn flush_pending_candidates(&self, pc: &RTCPeerConnection) {
        let candidates: Vec<_> = self.session.lock().pending_candidates.drain(..).collect();

        for candidate in candidates {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply pending candidate: {}", e);
            }
        }
    }

    fn send_signal(&self, signal: Signal) -> Result<(), CallEngineError> {
        self.send(WireMessage::WebrtcSignal { signal })
    }

    fn send(&self, message: WireMessage) -> Result<(), CallEngineError> {
        self.outbound
            .send(message)
            .map_err(|_| CallEngineError::SignalingClosed)
    }

    fn system(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("{}", text);
        self.emit(CallEvent::System(text));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Nimmt einen entfernten Track in die laufende Sitzung auf
fn record_remote_track(
    session: &Mutex<CallSession>,
    event_tx: &broadcast::Sender<CallEvent>,
    generation: u64,
    info: RemoteTrackInfo,
) {
    {
        let mut session = session.lock();
        if session.generation != generation {
            tracing::debug!("Ignoring track {} from ended call", info.id);
            return;
        }
        session.remote_stream.add(info.clone());
    }
    let _ = event_tx.send(CallEvent::RemoteTrack(info));
    let _ = event_tx.send(CallEvent::MediaPanel { visible: true });
}

/// Reagiert auf Zustandswechsel der Peer Connection zu `remote`
fn on_connection_state(
    session: &Mutex<CallSession>,
    event_tx: &broadcast::Sender<CallEvent>,
    remote: &str,
    generation: u64,
    state: RTCPeerConnectionState,
) {
    match state {
        RTCPeerConnectionState::Connected => {
            let _ = event_tx.send(CallEvent::System(format!("Connected to {}", remote)));
        }
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
            // Nur die Sitzung abbauen, zu der diese Verbindung gehört
            let lost = {
                let mut session = session.lock();
                if session.generation == generation && session.active {
                    Some(session.reset())
                } else {
                    None
                }
            };
            if let Some(pc) = lost {
                let _ = event_tx.send(CallEvent::System(format!(
                    "Connection lost with {}",
                    remote
                )));
                if let Some(pc) = pc {
                    close_later(pc);
                }
                let _ = event_tx.send(CallEvent::MediaPanel { visible: false });
            }
        }
        _ => {}
    }
}

/// Schließt eine Peer Connection im Hintergrund
fn close_later(pc: Arc<RTCPeerConnection>) {
    tokio::spawn(async move {
        if let Err(e) = pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    });
}

/// Liest RTCP vom Sender, damit die Interceptors arbeiten können
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("local_peer_id", &self.local_peer_id)
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::SampleTrackDevices;
    use crate::signaling::{IceCandidate, SessionDescription};
    use std::time::Duration;
    use tokio::time::timeout;

    struct BlockedDevices;

    impl MediaDevices for BlockedDevices {
        fn get_user_media(&self, _: &MediaConstraints) -> Result<LocalStream, MediaError> {
            Err(MediaError::PermissionDenied("microphone blocked".to_string()))
        }

        fn get_display_media(&self) -> Result<LocalStream, MediaError> {
            Err(MediaError::PermissionDenied("screen capture blocked".to_string()))
        }
    }

    fn engine_with(
        peer_id: &str,
        devices: Arc<dyn MediaDevices>,
    ) -> (
        CallEngine,
        mpsc::UnboundedReceiver<WireMessage>,
        broadcast::Receiver<CallEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Keine STUN-Server: Tests bleiben offline
        let engine = CallEngine::new(peer_id.to_string(), Vec::new(), devices, tx);
        let events = engine.subscribe();
        (engine, rx, events)
    }

    fn engine(
        peer_id: &str,
    ) -> (
        CallEngine,
        mpsc::UnboundedReceiver<WireMessage>,
        broadcast::Receiver<CallEvent>,
    ) {
        engine_with(peer_id, Arc::new(SampleTrackDevices::default()))
    }

    fn system_messages(events: &mut broadcast::Receiver<CallEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CallEvent::System(text) = event {
                out.push(text);
            }
        }
        out
    }

    /// Wartet auf das nächste Signal, das kein ICE Candidate ist
    async fn next_non_ice(rx: &mut mpsc::UnboundedReceiver<WireMessage>) -> WireMessage {
        loop {
            let msg = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for signal")
                .expect("outbound closed");
            if let WireMessage::WebrtcSignal {
                signal: Signal::IceCandidate { .. },
            } = msg
            {
                continue;
            }
            return msg;
        }
    }

    fn host_candidate(from: &str, to: &str) -> Signal {
        Signal::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
            target_peer: Some(to.to_string()),
            from_peer: from.to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_call_sends_request() {
        let (engine, mut out, mut events) = engine("node-a-1");

        engine.start_call(CallType::Video).unwrap();

        assert_eq!(
            out.try_recv().unwrap(),
            WireMessage::CallRequest {
                call_type: CallType::Video,
                caller: "node-a-1".to_string(),
            }
        );

        let status = engine.status();
        assert!(status.active);
        assert_eq!(status.role, Some(CallRole::Caller));
        assert_eq!(status.call_type, Some(CallType::Video));
        assert!(!status.has_peer_connection);

        assert_eq!(system_messages(&mut events), vec!["Starting video call..."]);
        assert!(matches!(
            engine.start_call(CallType::Audio),
            Err(CallEngineError::AlreadyInCall)
        ));
    }

    #[tokio::test]
    async fn test_media_failure_is_reported_in_chat() {
        let (engine, mut out, mut events) = engine_with("node-a-1", Arc::new(BlockedDevices));

        let result = engine.start_call(CallType::Audio);
        assert!(matches!(result, Err(CallEngineError::Media(_))));

        assert_eq!(
            system_messages(&mut events),
            vec!["Audio call failed: Permission denied: microphone blocked"]
        );
        assert!(!engine.is_active());
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_call_last_write_wins() {
        let (engine, _out, mut events) = engine("node-b-2");

        engine.handle_call_request(CallType::Audio, "node-a-1".to_string());
        engine.handle_call_request(CallType::Video, "node-c-3".to_string());

        assert_eq!(
            engine.pending_call(),
            Some(PendingCall {
                caller: "node-c-3".to_string(),
                call_type: CallType::Video,
            })
        );

        let incoming: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, CallEvent::IncomingCall(_)))
            .collect();
        assert_eq!(incoming.len(), 2);
    }

    #[tokio::test]
    async fn test_own_call_request_is_ignored() {
        let (engine, _out, _events) = engine("node-a-1");
        engine.handle_call_request(CallType::Audio, "node-a-1".to_string());
        assert_eq!(engine.pending_call(), None);
    }

    #[tokio::test]
    async fn test_call_request_while_busy() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();
        let _ = system_messages(&mut events);

        engine.handle_call_request(CallType::Video, "node-c-3".to_string());

        assert_eq!(engine.pending_call(), None);
        assert_eq!(
            system_messages(&mut events),
            vec!["Missed video call from node-c-3 (busy)"]
        );
    }

    #[tokio::test]
    async fn test_decline_call() {
        let (engine, _out, mut events) = engine("node-b-2");
        assert!(matches!(
            engine.decline_call(),
            Err(CallEngineError::NoPendingCall)
        ));

        engine.handle_call_request(CallType::Audio, "node-a-1".to_string());
        let declined = engine.decline_call().unwrap();
        assert_eq!(declined.caller, "node-a-1");
        assert_eq!(engine.pending_call(), None);
        assert!(system_messages(&mut events).contains(&"Declined call from node-a-1".to_string()));
    }

    #[tokio::test]
    async fn test_signals_for_others_are_ignored() {
        let (engine, _out, _events) = engine("node-a-1");

        // Ohne aktiven Anruf
        engine
            .handle_signal(host_candidate("node-b-2", "node-a-1"))
            .await
            .unwrap();
        assert!(!engine.status().has_peer_connection);

        engine.start_call(CallType::Audio).unwrap();

        // Eigenes Signal
        engine
            .handle_signal(host_candidate("node-a-1", "node-b-2"))
            .await
            .unwrap();
        // An einen anderen Peer adressiert
        engine
            .handle_signal(host_candidate("node-b-2", "node-c-3"))
            .await
            .unwrap();

        let status = engine.status();
        assert!(!status.has_peer_connection);
        assert_eq!(status.pending_candidates, 0);

        engine.end_call();
    }

    #[tokio::test]
    async fn test_early_candidates_are_queued() {
        let (engine, _out, _events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();

        engine
            .handle_signal(host_candidate("node-b-2", "node-a-1"))
            .await
            .unwrap();

        let status = engine.status();
        assert!(status.has_peer_connection);
        assert_eq!(status.remote_peer.as_deref(), Some("node-b-2"));
        assert_eq!(status.pending_candidates, 1);

        // Ein dritter Peer darf sich nicht einklinken
        engine
            .handle_signal(host_candidate("node-c-3", "node-a-1"))
            .await
            .unwrap();
        assert_eq!(engine.status().pending_candidates, 1);

        engine.end_call();
        assert_eq!(engine.status().pending_candidates, 0);
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (caller, mut caller_out, mut caller_events) = engine("node-a-1");
        let (callee, mut callee_out, mut callee_events) = engine("node-b-2");

        caller.start_call(CallType::Audio).unwrap();
        let WireMessage::CallRequest { call_type, caller: caller_id } =
            caller_out.try_recv().unwrap()
        else {
            panic!("expected call_request");
        };
        callee.handle_call_request(call_type, caller_id);

        callee.accept_call().await.unwrap();
        let status = callee.status();
        assert_eq!(status.role, Some(CallRole::Callee));
        assert_eq!(status.remote_peer.as_deref(), Some("node-a-1"));

        let accepted = next_non_ice(&mut callee_out).await;
        let offer = next_non_ice(&mut callee_out).await;
        let WireMessage::WebrtcSignal {
            signal: accepted @ Signal::CallAccepted { .. },
        } = accepted
        else {
            panic!("expected call-accepted");
        };
        let WireMessage::WebrtcSignal {
            signal: offer @ Signal::Offer { .. },
        } = offer
        else {
            panic!("expected offer");
        };

        // Ein ICE Candidate vor dem Offer wird zurückgehalten
        caller
            .handle_signal(host_candidate("node-b-2", "node-a-1"))
            .await
            .unwrap();
        assert_eq!(caller.status().pending_candidates, 1);

        caller.handle_signal(accepted).await.unwrap();
        caller.handle_signal(offer).await.unwrap();
        assert_eq!(caller.status().pending_candidates, 0);
        assert!(caller.has_remote_description().await);

        let answer = next_non_ice(&mut caller_out).await;
        let WireMessage::WebrtcSignal {
            signal:
                answer @ Signal::Answer {
                    target_peer: Some(_),
                    ..
                },
        } = answer
        else {
            panic!("expected answer");
        };
        assert_eq!(answer.target_peer(), Some("node-b-2"));

        assert!(!callee.has_remote_description().await);
        callee.handle_signal(answer).await.unwrap();
        assert!(callee.has_remote_description().await);

        assert!(system_messages(&mut caller_events)
            .contains(&"node-b-2 accepted the call".to_string()));
        assert!(system_messages(&mut callee_events)
            .contains(&"Accepted audio call from node-a-1".to_string()));

        caller.end_call();
        callee.end_call();
    }

    #[tokio::test]
    async fn test_invalid_offer_is_an_error() {
        let (engine, _out, _events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();

        let result = engine
            .handle_signal(Signal::Offer {
                offer: SessionDescription {
                    sdp_type: "offer".to_string(),
                    sdp: "not an sdp".to_string(),
                },
                target_peer: Some("node-a-1".to_string()),
                from_peer: "node-b-2".to_string(),
                call_type: None,
            })
            .await;
        assert!(result.is_err());

        engine.end_call();
    }

    #[tokio::test]
    async fn test_toggle_mute_and_video() {
        let (engine, _out, mut events) = engine("node-a-1");
        assert!(matches!(
            engine.toggle_mute(),
            Err(CallEngineError::NoActiveCall)
        ));

        engine.start_call(CallType::Audio).unwrap();
        let _ = system_messages(&mut events);

        assert!(engine.toggle_mute().unwrap());
        assert!(!engine.toggle_mute().unwrap());
        assert_eq!(system_messages(&mut events), vec!["Muted", "Unmuted"]);

        assert!(matches!(
            engine.toggle_video(),
            Err(CallEngineError::NoTrack("video"))
        ));

        engine.end_call();
    }

    #[tokio::test]
    async fn test_toggle_video_on_video_call() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Video).unwrap();
        let _ = system_messages(&mut events);

        assert!(!engine.toggle_video().unwrap());
        let stream = engine.local_stream().unwrap();
        assert!(!stream.video_tracks().next().unwrap().is_enabled());
        assert_eq!(system_messages(&mut events), vec!["Video off"]);

        engine.end_call();
    }

    #[tokio::test]
    async fn test_screen_share_failure_is_reported() {
        let (engine, _out, mut events) = engine_with("node-a-1", Arc::new(BlockedDevices));
        assert!(engine.share_screen().await.is_err());
        assert_eq!(
            system_messages(&mut events),
            vec!["Screen sharing failed: Permission denied: screen capture blocked"]
        );
    }

    #[tokio::test]
    async fn test_screen_share_start_and_stop() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Video).unwrap();
        let _ = system_messages(&mut events);

        engine.share_screen().await.unwrap();
        assert!(engine.status().sharing_screen);
        engine.stop_screen_share().await.unwrap();
        assert!(!engine.status().sharing_screen);
        assert!(matches!(
            engine.stop_screen_share().await,
            Err(CallEngineError::NotSharing)
        ));

        assert_eq!(
            system_messages(&mut events),
            vec!["Screen sharing started", "Screen sharing ended"]
        );
        engine.end_call();
    }

    #[tokio::test]
    async fn test_end_call_resets_session() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Video).unwrap();
        let stream = engine.local_stream().unwrap();

        engine.end_call();

        let status = engine.status();
        assert!(!status.active);
        assert_eq!(status.call_type, None);
        assert!(stream.tracks().iter().all(|t| !t.is_live()));
        assert!(system_messages(&mut events).contains(&"Call ended".to_string()));

        // Danach ist ein neuer Anruf möglich
        engine.start_call(CallType::Audio).unwrap();
        engine.end_call();
    }

    fn remote_track(id: &str) -> RemoteTrackInfo {
        RemoteTrackInfo {
            id: id.to_string(),
            stream_id: "remote-stream".to_string(),
            kind: TrackKind::Video,
            mime_type: "video/VP8".to_string(),
        }
    }

    #[tokio::test]
    async fn test_peer_connection_for_ended_call_is_discarded() {
        let (engine, _out, _events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();
        let stale = engine.session.lock().generation;

        engine.end_call();
        engine.start_call(CallType::Audio).unwrap();

        let result = engine.create_peer_connection("node-b-2", stale).await;
        assert!(matches!(result, Err(CallEngineError::NoActiveCall)));

        let status = engine.status();
        assert!(status.active);
        assert_eq!(status.remote_peer, None);
        assert!(!status.has_peer_connection);
        assert_eq!(status.pending_candidates, 0);
        engine.end_call();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_call_during_signal_leaves_next_call_clean() {
        let (engine, _out, _events) = engine("node-a-1");
        let engine = Arc::new(engine);

        for round in 0..20u64 {
            engine.start_call(CallType::Audio).unwrap();
            let signal = {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .handle_signal(host_candidate("node-b-2", "node-a-1"))
                        .await
                })
            };
            tokio::time::sleep(Duration::from_micros(round * 50)).await;
            engine.end_call();
            let _ = signal.await.unwrap();

            engine.start_call(CallType::Audio).unwrap();
            let status = engine.status();
            assert_eq!(status.remote_peer, None, "round {}", round);
            assert!(!status.has_peer_connection, "round {}", round);
            assert_eq!(status.pending_candidates, 0, "round {}", round);
            engine.end_call();
        }
    }

    #[tokio::test]
    async fn test_connection_state_connected_and_failed() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();
        engine
            .handle_signal(host_candidate("node-b-2", "node-a-1"))
            .await
            .unwrap();
        let generation = engine.session.lock().generation;
        system_messages(&mut events);

        on_connection_state(
            &engine.session,
            &engine.event_tx,
            "node-b-2",
            generation,
            RTCPeerConnectionState::Connected,
        );
        assert_eq!(system_messages(&mut events), vec!["Connected to node-b-2"]);
        assert!(engine.is_active());

        on_connection_state(
            &engine.session,
            &engine.event_tx,
            "node-b-2",
            generation,
            RTCPeerConnectionState::Failed,
        );

        let mut lost = false;
        let mut panel_closed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                CallEvent::System(text) => lost |= text == "Connection lost with node-b-2",
                CallEvent::MediaPanel { visible: false } => panel_closed = true,
                _ => {}
            }
        }
        assert!(lost);
        assert!(panel_closed);

        let status = engine.status();
        assert!(!status.active);
        assert!(!status.has_peer_connection);
        assert_eq!(status.remote_peer, None);
    }

    #[tokio::test]
    async fn test_stale_connection_state_is_ignored() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();
        let stale = engine.session.lock().generation;
        engine.end_call();
        engine.start_call(CallType::Audio).unwrap();
        system_messages(&mut events);

        on_connection_state(
            &engine.session,
            &engine.event_tx,
            "node-b-2",
            stale,
            RTCPeerConnectionState::Disconnected,
        );

        assert!(engine.is_active());
        assert!(events.try_recv().is_err());
        engine.end_call();
    }

    #[tokio::test]
    async fn test_remote_track_only_for_current_call() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Video).unwrap();
        let generation = engine.session.lock().generation;
        system_messages(&mut events);

        record_remote_track(&engine.session, &engine.event_tx, generation, remote_track("t1"));
        assert_eq!(engine.remote_tracks(), vec![remote_track("t1")]);
        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::RemoteTrack(remote_track("t1"))
        );
        assert_eq!(
            events.try_recv().unwrap(),
            CallEvent::MediaPanel { visible: true }
        );

        engine.end_call();
        engine.start_call(CallType::Video).unwrap();
        system_messages(&mut events);

        record_remote_track(&engine.session, &engine.event_tx, generation, remote_track("t2"));
        assert!(engine.remote_tracks().is_empty());
        assert!(events.try_recv().is_err());
        engine.end_call();
    }

    #[tokio::test]
    async fn test_abort_call_is_silent() {
        let (engine, _out, mut events) = engine("node-a-1");
        engine.start_call(CallType::Audio).unwrap();
        system_messages(&mut events);

        engine.abort_call();

        assert!(!engine.is_active());
        assert!(system_messages(&mut events).is_empty());
    }
}
