//! Peer-API: Peers manuell beim Knoten registrieren

use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Port, wenn keiner angegeben ist
pub const DEFAULT_PEER_PORT: u16 = 8000;

const ADD_PEER_PATH: &str = "/api/peer/add";

#[derive(Error, Debug)]
pub enum PeerApiError {
    #[error("Peer address is empty")]
    EmptyAddress,

    #[error("Invalid node URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Client für die HTTP-Endpunkte des Knotens
#[derive(Debug, Clone)]
pub struct PeerApi {
    http: reqwest::Client,
    base: Url,
}

impl PeerApi {
    pub fn new(node_url: &str) -> Result<Self, PeerApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base: Url::parse(node_url)?,
        })
    }

    /// Registriert `ip:port` beim Knoten und gibt dessen JSON-Antwort zurück
    pub async fn add_peer(
        &self,
        ip: &str,
        port: Option<u16>,
    ) -> Result<serde_json::Value, PeerApiError> {
        let ip = ip.trim();
        if ip.is_empty() {
            return Err(PeerApiError::EmptyAddress);
        }
        let port = port.unwrap_or(DEFAULT_PEER_PORT);

        let url = self.base.join(ADD_PEER_PATH)?;
        tracing::info!("Adding peer {}:{} via {}", ip, port, url);

        let port = port.to_string();
        let response = self
            .http
            .post(url)
            .form(&[("peer_ip", ip), ("peer_port", port.as_str())])
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }
}

/// Minimaler HTTP-Server: nimmt eine Anfrage an und antwortet mit `status`
#[cfg(test)]
pub(crate) async fn one_shot_server(
    status: &'static str,
    body: &'static str,
) -> (String, tokio::sync::oneshot::Receiver<String>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        let request = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break text;
                }
            }
            if n == 0 {
                break text;
            }
        };

        let response = format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\n\
             content-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = tx.send(request);
    });

    (format!("http://{}", addr), rx)
}

// ============================================================================
// TESTS
// ============================================================================
