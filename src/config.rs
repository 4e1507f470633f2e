//! Konfiguration
//!
//! Wird aus `config.json` geladen. Fehlt die Datei, wird sie mit
//! Standardwerten angelegt. `LANLINK_NODE_URL` und `LANLINK_NODE_ID`
//! überschreiben die Datei.

use crate::call_engine::default_ice_servers;
use crate::signaling::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

const ENV_NODE_URL: &str = "LANLINK_NODE_URL";
const ENV_NODE_ID: &str = "LANLINK_NODE_ID";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid node URL '{0}'")]
    InvalidUrl(String),
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(c: &ReconnectConfig) -> Self {
        ReconnectPolicy {
            max_attempts: c.max_attempts,
            base_delay: Duration::from_millis(c.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP-Adresse des Knotens, z.B. `http://192.168.1.8:8000`
    pub node_url: String,
    pub node_id: String,
    pub ws_path: String,
    pub ice_servers: Vec<String>,
    pub reconnect: ReconnectConfig,
    pub discovery_delay_ms: u64,
    pub export_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_url: "http://localhost:8000".to_string(),
            node_id: generate_node_id(),
            ws_path: "/ws/chat".to_string(),
            ice_servers: default_ice_servers()
                .into_iter()
                .flat_map(|s| s.urls)
                .collect(),
            reconnect: ReconnectConfig::default(),
            discovery_delay_ms: 2000,
            export_dir: None,
        }
    }
}

impl AppConfig {
    /// Lädt die Konfiguration und wendet Umgebungsvariablen an
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = Self::load_or_create(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.ws_url()?;
        Ok(config)
    }

    /// Pfad der Konfigurationsdatei im Benutzerverzeichnis
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("net", "metal52", "lanlink")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.json"))
    }

    /// Fehlt `node_id` in der Datei, wird die erzeugte ID zurückgeschrieben
    fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = fs::read_to_string(path)?;
            let raw: serde_json::Value = serde_json::from_str(&data)?;
            let has_node_id = raw
                .get("node_id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| !id.trim().is_empty());

            let mut config: Self = serde_json::from_value(raw)?;
            tracing::info!("Loaded config from {}", path.display());

            if !has_node_id {
                if config.node_id.trim().is_empty() {
                    config.node_id = generate_node_id();
                }
                config.save(path)?;
                tracing::info!("Stored node id {} in {}", config.node_id, path.display());
            }
            return Ok(config);
        }

        let config = Self::default();
        config.save(path)?;
        tracing::info!("Created default config at {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_NODE_URL).filter(|v| !v.trim().is_empty()) {
            self.node_url = url.trim().to_string();
        }
        if let Some(id) = lookup(ENV_NODE_ID).filter(|v| !v.trim().is_empty()) {
            self.node_id = id.trim().to_string();
        }
    }

    /// WebSocket-Endpunkt: Schema `ws`/`wss` statt `http`/`https`
    pub fn ws_url(&self) -> Result<Url, ConfigError> {
        let invalid = || ConfigError::InvalidUrl(self.node_url.clone());

        let mut url = Url::parse(&self.node_url).map_err(|_| invalid())?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(invalid()),
        };
        url.set_scheme(scheme).map_err(|_| invalid())?;
        url.set_path(&self.ws_path);
        Ok(url)
    }

    /// Peer-ID für diese Sitzung: `node-<node_id>-<unix millis>`
    pub fn peer_id(&self) -> String {
        format!(
            "node-{}-{}",
            self.node_id,
            chrono::Utc::now().timestamp_millis()
        )
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_servers.clone(),
            ..Default::default()
        }]
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        (&self.reconnect).into()
    }

    pub fn discovery_delay(&self) -> Duration {
        Duration::from_millis(self.discovery_delay_ms)
    }

    pub fn export_dir(&self) -> PathBuf {
        self.export_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Kurze zufällige Knoten-ID (8 Hex-Zeichen)
fn generate_node_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("lanlink-config-{}", uuid::Uuid::new_v4().simple()))
            .join("config.json")
    }

    #[test]
    fn test_missing_file_is_created_with_defaults() {
        let path = temp_path();
        let config = AppConfig::load_or_create(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.ws_path, "/ws/chat");
        assert_eq!(config.discovery_delay_ms, 2000);
        assert_eq!(config.node_id.len(), 8);

        // Zweites Laden liefert dieselbe Knoten-ID
        let again = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(again, config);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"node_url":"http://192.168.1.8:8000","node_id":"alpha"}"#).unwrap();

        let config = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(config.node_id, "alpha");
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.ice_servers.len(), 3);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_generated_node_id_is_persisted() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"node_url":"http://192.168.1.8:8000"}"#).unwrap();

        let first = AppConfig::load_or_create(&path).unwrap();
        let second = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(first.node_id.len(), 8);
        assert_eq!(first.node_id, second.node_id);

        let stored: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored["node_id"], first.node_id.as_str());
        assert_eq!(stored["node_url"], "http://192.168.1.8:8000");

        // Leere ID zählt als fehlend
        fs::write(&path, r#"{"node_id":" "}"#).unwrap();
        let third = AppConfig::load_or_create(&path).unwrap();
        assert_eq!(third.node_id.len(), 8);
        assert_eq!(AppConfig::load_or_create(&path).unwrap().node_id, third.node_id);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_broken_file_is_an_error() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ nope").unwrap();

        assert!(matches!(
            AppConfig::load_or_create(&path),
            Err(ConfigError::Parse(_))
        ));

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_overrides(|key| match key {
            ENV_NODE_URL => Some("https://node.lan:8443".to_string()),
            ENV_NODE_ID => Some(" beta ".to_string()),
            _ => None,
        });

        assert_eq!(config.node_url, "https://node.lan:8443");
        assert_eq!(config.node_id, "beta");
    }

    #[test]
    fn test_ws_url() {
        let mut config = AppConfig {
            node_url: "http://192.168.1.8:8000".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.ws_url().unwrap().as_str(),
            "ws://192.168.1.8:8000/ws/chat"
        );

        config.node_url = "https://node.lan".to_string();
        assert_eq!(config.ws_url().unwrap().as_str(), "wss://node.lan/ws/chat");

        config.node_url = "ftp://node.lan".to_string();
        assert!(matches!(config.ws_url(), Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_peer_id_format() {
        let config = AppConfig {
            node_id: "alpha".to_string(),
            ..Default::default()
        };
        let id = config.peer_id();
        let millis = id.strip_prefix("node-alpha-").unwrap();
        assert!(millis.parse::<i64>().is_ok());
    }

    #[test]
    fn test_reconnect_policy() {
        let policy = AppConfig::default().reconnect_policy();
        assert_eq!(policy, ReconnectPolicy::default());
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(2)));
    }
}
