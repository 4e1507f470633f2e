//! Peers Module - HTTP-API des Knotens

mod api;

pub use api::{PeerApi, PeerApiError, DEFAULT_PEER_PORT};

#[cfg(test)]
pub(crate) use api::one_shot_server;
