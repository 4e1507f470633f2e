//! Call Engine Module - WebRTC Anrufe
//!
//! Dieses Modul verwaltet:
//! - die eine Peer Connection pro Client
//! - Offer/Answer/ICE-Austausch über den Knoten
//! - lokale Tracks (Mikrofon, Kamera, Bildschirm)

mod engine;
mod media;

pub use engine::{
    default_ice_servers, CallEngine, CallEngineError, CallEvent, CallRole, CallStatus, PendingCall,
};
pub use media::{
    AudioConstraints, CallType, LocalStream, LocalTrack, MediaConstraints, MediaDevices,
    MediaError, Range, RemoteStream, RemoteTrackInfo, SampleTrackDevices, TrackKind,
    VideoConstraints, CHANNELS, SAMPLE_RATE,
};
