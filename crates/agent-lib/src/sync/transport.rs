//! Delivery of message batches to the collector

use crate::error::TransportError;
use crate::models::Message;
use async_trait::async_trait;
use futures::SinkExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

/// Path appended to the collector base URL
pub const SUBSCRIBE_PATH: &str = "/data/subscribe";

/// Handshake header carrying the connection key
pub const CONNECTION_HEADER: &str = "funk.connection";

/// Connection to the collector
#[async_trait]
pub trait Transport: Send {
    /// Establish a fresh connection, replacing any existing one
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one batch as a single unit
    async fn send(&mut self, batch: &[Message]) -> Result<(), TransportError>;
}

/// Websocket transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Collector base URL (`ws://` or `wss://`)
    pub server_url: String,
    pub connection_key: String,
    /// Accept invalid certificates and host names on `wss://`
    pub insecure_skip_verify: bool,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:3000".to_string(),
            connection_key: "changeMe04cf242924f6b5f96".to_string(),
            insecure_skip_verify: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    pub fn subscribe_url(&self) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), SUBSCRIBE_PATH)
    }
}

/// Sends each batch as one JSON array text frame
pub struct WebSocketTransport {
    config: TransportConfig,
    stream: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connector(&self) -> Result<Option<Connector>, TransportError> {
        if !self.config.insecure_skip_verify {
            return Ok(None);
        }

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(Some(Connector::NativeTls(tls)))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(mut previous) = self.stream.take() {
            let _ = previous.close(None).await;
        }

        let url = self.config.subscribe_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        let key = HeaderValue::from_str(&self.config.connection_key)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        request.headers_mut().insert(CONNECTION_HEADER, key);

        let connector = self.connector()?;
        let (stream, _response) = timeout(
            self.config.connect_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| TransportError::Connect {
            url: url.clone(),
            reason: format!("timed out after {:?}", self.config.connect_timeout),
        })?
        .map_err(|e| TransportError::Connect {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        info!(url = %url, "Connected to collector");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, batch: &[Message]) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let payload = serde_json::to_string(batch)?;
        debug!(messages = batch.len(), bytes = payload.len(), "Sending batch");

        if let Err(e) = stream.send(WsMessage::Text(payload)).await {
            self.stream = None;
            return Err(TransportError::Send(e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_url() {
        let config = TransportConfig {
            server_url: "wss://collector.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.subscribe_url(),
            "wss://collector.example.com/data/subscribe"
        );
        assert_eq!(
            TransportConfig::default().subscribe_url(),
            "ws://localhost:3000/data/subscribe"
        );
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = WebSocketTransport::new(TransportConfig::default());
        assert!(!transport.is_connected());
        let err = tokio_test::assert_err!(transport.send(&[]).await);
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let mut transport = WebSocketTransport::new(TransportConfig {
            server_url: "not a url".to_string(),
            ..Default::default()
        });
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = WebSocketTransport::new(TransportConfig {
            server_url: format!("ws://127.0.0.1:{}", port),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let err = tokio_test::assert_err!(transport.connect().await);
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(!transport.is_connected());
    }
}
