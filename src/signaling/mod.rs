//! Signaling Module - WebSocket Client für den lokalen Knoten
//!
//! Dieses Modul verwaltet die Verbindung zum Knoten:
//! - WebSocket-Verbindung aufbauen und bei Abbruch neu verbinden
//! - Nachrichten serialisieren und senden
//! - Eingehende Frames parsen und weiterleiten

mod client;
mod messages;

pub use client::{ReconnectPolicy, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
