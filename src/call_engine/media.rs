//! Lokale und entfernte Media-Streams
//!
//! Die Aufnahme selbst ist eine Blackbox hinter `MediaDevices`. Die
//! Standard-Implementierung legt WebRTC Sample-Tracks an, in die die
//! einbettende Anwendung ihre kodierten Frames schreibt.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (optimal für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Kanäle für Audio
pub const CHANNELS: u16 = 2;

const MIME_TYPE_OPUS: &str = "audio/opus";
const MIME_TYPE_VP8: &str = "video/VP8";
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No {0} device found")]
    NoDevice(&'static str),

    #[error("Media track has ended")]
    TrackEnded,

    #[error("Failed to write sample: {0}")]
    Write(String),
}

// ============================================================================
// CALL TYPE & CONSTRAINTS
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    /// Großgeschriebener Name für Systemmeldungen
    pub fn title(&self) -> &'static str {
        match self {
            CallType::Audio => "Audio",
            CallType::Video => "Video",
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(CallType::Audio),
            "video" => Ok(CallType::Video),
            other => Err(format!("unknown call type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: SAMPLE_RATE,
            channel_count: CHANNELS,
        }
    }
}

/// Bereich mit Ideal- und Maximalwert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub ideal: u32,
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: Range,
    pub height: Range,
    pub frame_rate: Range,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: Range { ideal: 640, max: 1280 },
            height: Range { ideal: 480, max: 720 },
            frame_rate: Range { ideal: 15, max: 30 },
        }
    }
}

/// Anforderungen an `get_user_media`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio immer, Video nur bei Videoanrufen
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: match call_type {
                CallType::Video => Some(VideoConstraints::default()),
                CallType::Audio => None,
            },
        }
    }
}

// ============================================================================
// LOCAL TRACKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ein lokaler Track mit `enabled`-Schalter
///
/// Deaktivierte oder gestoppte Tracks verwerfen geschriebene Samples.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    /// Schreibt ein kodiertes Sample in den Track
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_live() {
            return Err(MediaError::TrackEnded);
        }
        if !self.is_enabled() {
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::Write(e.to_string()))
    }

    /// Der Track als `TrackLocal` für `add_track`/`replace_track`
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Lokaler Media-Stream (Mikrofon, Kamera oder Bildschirm)
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| t.kind == TrackKind::Video)
    }

    /// Stoppt alle Tracks
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// REMOTE STREAM
// ============================================================================

/// Beschreibung eines empfangenen Tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub mime_type: String,
}

/// Entfernter Media-Stream des Gesprächspartners
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<RemoteTrackInfo>,
}

impl RemoteStream {
    pub fn add(&mut self, info: RemoteTrackInfo) {
        self.tracks.push(info);
    }

    pub fn tracks(&self) -> &[RemoteTrackInfo] {
        &self.tracks
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Zugriff auf Aufnahmegeräte
pub trait MediaDevices: Send + Sync {
    /// Mikrofon und optional Kamera
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;

    /// Bildschirmfreigabe
    fn get_display_media(&self) -> Result<LocalStream, MediaError>;
}

/// Legt Sample-Tracks an, die von außen befüllt werden
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    stream_prefix: String,
}

impl SampleTrackDevices {
    pub fn new(stream_prefix: impl Into<String>) -> Self {
        Self {
            stream_prefix: stream_prefix.into(),
        }
    }

    fn audio_track(&self, stream_id: &str, constraints: &AudioConstraints) -> LocalTrack {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: constraints.sample_rate,
                channels: constraints.channel_count,
                ..Default::default()
            },
            format!("{}-audio", stream_id),
            stream_id.to_string(),
        ));
        LocalTrack::new(TrackKind::Audio, track)
    }

    fn video_track(&self, stream_id: &str, label: &str) -> LocalTrack {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            format!("{}-{}", stream_id, label),
            stream_id.to_string(),
        ));
        LocalTrack::new(TrackKind::Video, track)
    }

    fn next_stream_id(&self, kind: &str) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.stream_prefix, kind, &suffix[..8])
    }
}

impl Default for SampleTrackDevices {
    fn default() -> Self {
        Self::new("lanlink")
    }
}

impl MediaDevices for SampleTrackDevices {
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let stream_id = self.next_stream_id("user");
        let mut tracks = Vec::new();

        if let Some(audio) = &constraints.audio {
            tracks.push(self.audio_track(&stream_id, audio));
        }
        if constraints.video.is_some() {
            tracks.push(self.video_track(&stream_id, "camera"));
        }

        tracing::info!(
            "Media initialized: {}{}",
            if constraints.audio.is_some() { "Audio " } else { "" },
            if constraints.video.is_some() { "Video" } else { "" }
        );

        Ok(LocalStream::new(stream_id, tracks))
    }

    fn get_display_media(&self) -> Result<LocalStream, MediaError> {
        let stream_id = self.next_stream_id("screen");
        let tracks = vec![
            self.video_track(&stream_id, "screen"),
            self.audio_track(&stream_id, &AudioConstraints::default()),
        ];
        Ok(LocalStream::new(stream_id, tracks))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_call_constraints_have_no_video() {
        let c = MediaConstraints::for_call(CallType::Audio);
        assert!(c.audio.is_some());
        assert!(c.video.is_none());
        assert_eq!(c.audio.unwrap().sample_rate, 48000);
    }

    #[test]
    fn test_video_call_constraints() {
        let c = MediaConstraints::for_call(CallType::Video);
        let video = c.video.unwrap();
        assert_eq!(video.width, Range { ideal: 640, max: 1280 });
        assert_eq!(video.frame_rate, Range { ideal: 15, max: 30 });
    }

    #[test]
    fn test_user_media_tracks_follow_constraints() {
        let devices = SampleTrackDevices::default();

        let audio = devices
            .get_user_media(&MediaConstraints::for_call(CallType::Audio))
            .unwrap();
        assert_eq!(audio.audio_tracks().count(), 1);
        assert_eq!(audio.video_tracks().count(), 0);

        let video = devices
            .get_user_media(&MediaConstraints::for_call(CallType::Video))
            .unwrap();
        assert_eq!(video.audio_tracks().count(), 1);
        assert_eq!(video.video_tracks().count(), 1);
        assert_ne!(audio.id(), video.id());
    }

    #[test]
    fn test_track_enable_and_stop() {
        let devices = SampleTrackDevices::default();
        let stream = devices
            .get_user_media(&MediaConstraints::for_call(CallType::Audio))
            .unwrap();
        let track = stream.audio_tracks().next().unwrap().clone();

        assert!(track.is_enabled());
        track.set_enabled(false);
        assert!(!track.is_enabled());

        stream.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn test_call_type_parsing() {
        assert_eq!("Video".parse::<CallType>(), Ok(CallType::Video));
        assert_eq!(" audio ".parse::<CallType>(), Ok(CallType::Audio));
        assert!("fax".parse::<CallType>().is_err());
    }
}
