//! Message Types für das Knoten-Protokoll
//!
//! Ein dünner JSON-Umschlag über dem WebSocket. Die äußere Ebene wird über
//! das `type`-Feld unterschieden, WebRTC-Signale tragen ein eigenes,
//! verschachteltes `type`-Feld.

use crate::call_engine::CallType;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

// ============================================================================
// ENVELOPE
// ============================================================================

/// Alle Nachrichten, die über den WebSocket laufen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Chat-Nachricht eines anderen Knotens
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// Vom Knoten per UDP empfangene Nachricht
    UdpMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    /// Systemhinweis vom Knoten
    System { message: String },

    /// Anrufanfrage (Broadcast an alle Knoten)
    CallRequest { call_type: CallType, caller: String },

    /// WebRTC-Signal (Offer, Answer, ICE)
    WebrtcSignal { signal: Signal },
}

/// Tags, die `WireMessage` kennt
const KNOWN_TAGS: [&str; 5] = [
    "chat",
    "udp_message",
    "system",
    "call_request",
    "webrtc_signal",
];

// ============================================================================
// WEBRTC SIGNALS
// ============================================================================

/// Verschachtelte WebRTC-Signale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    #[serde(rename = "offer")]
    Offer {
        offer: SessionDescription,
        #[serde(rename = "targetPeer", default, skip_serializing_if = "Option::is_none")]
        target_peer: Option<String>,
        #[serde(rename = "fromPeer")]
        from_peer: String,
        #[serde(rename = "callType", default, skip_serializing_if = "Option::is_none")]
        call_type: Option<CallType>,
    },

    #[serde(rename = "answer")]
    Answer {
        answer: SessionDescription,
        #[serde(rename = "targetPeer", default, skip_serializing_if = "Option::is_none")]
        target_peer: Option<String>,
        #[serde(rename = "fromPeer")]
        from_peer: String,
    },

    #[serde(rename = "ice-candidate")]
    IceCandidate {
        candidate: IceCandidate,
        #[serde(rename = "targetPeer", default, skip_serializing_if = "Option::is_none")]
        target_peer: Option<String>,
        #[serde(rename = "fromPeer")]
        from_peer: String,
    },

    #[serde(rename = "call-accepted")]
    CallAccepted {
        #[serde(rename = "targetPeer", default, skip_serializing_if = "Option::is_none")]
        target_peer: Option<String>,
        #[serde(rename = "fromPeer")]
        from_peer: String,
        #[serde(rename = "callType", default, skip_serializing_if = "Option::is_none")]
        call_type: Option<CallType>,
    },
}

impl Signal {
    /// Absender des Signals
    pub fn from_peer(&self) -> &str {
        match self {
            Signal::Offer { from_peer, .. }
            | Signal::Answer { from_peer, .. }
            | Signal::IceCandidate { from_peer, .. }
            | Signal::CallAccepted { from_peer, .. } => from_peer,
        }
    }

    /// Adressat des Signals (`None` = Broadcast)
    pub fn target_peer(&self) -> Option<&str> {
        match self {
            Signal::Offer { target_peer, .. }
            | Signal::Answer { target_peer, .. }
            | Signal::IceCandidate { target_peer, .. }
            | Signal::CallAccepted { target_peer, .. } => target_peer.as_deref(),
        }
    }

    /// Name des Signal-Tags für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::CallAccepted { .. } => "call-accepted",
        }
    }
}

/// SDP-Blob im Browser-Format `{"type": "...", "sdp": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl From<RTCSessionDescription> for SessionDescription {
    fn from(desc: RTCSessionDescription) -> Self {
        Self {
            sdp_type: desc.sdp_type.to_string(),
            sdp: desc.sdp,
        }
    }
}

/// ICE Candidate im Browser-Format (`RTCIceCandidate.toJSON()`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

// ============================================================================
// INCOMING FRAMES
// ============================================================================

/// Ein empfangener Text-Frame
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Bekannter Umschlag
    Message(WireMessage),
    /// Alles andere wird roh angezeigt
    Raw(String),
}

impl Incoming {
    /// Parst einen Frame; unbekannte oder kaputte Umschläge fallen auf `Raw` zurück
    pub fn parse(text: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return Incoming::Raw(text.to_string()),
        };

        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .map(|t| KNOWN_TAGS.contains(&t))
            .unwrap_or(false);
        if !known {
            return Incoming::Raw(text.to_string());
        }

        match serde_json::from_value::<WireMessage>(value) {
            Ok(msg) => Incoming::Message(msg),
            Err(e) => {
                tracing::debug!("Malformed envelope, showing raw: {}", e);
                Incoming::Raw(text.to_string())
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
