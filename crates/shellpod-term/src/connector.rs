//! Socket opening seam and the WebSocket implementation.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use shellpod_protocol::ControlFrame;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::ConnectError;
use crate::key::TerminalKey;

/// Frames the manager sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Data(Bytes),
    Control(ControlFrame),
    /// Close with code 1000.
    Close,
}

/// Frames the manager receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Data(Bytes),
    /// Peer closed; `None` when no close code was received.
    Closed(Option<u16>),
}

/// An open duplex connection.
///
/// The incoming channel ending without [`Incoming::Closed`] counts as an
/// abnormal closure.
#[derive(Debug)]
pub struct Socket {
    pub outgoing: mpsc::Sender<Outgoing>,
    pub incoming: mpsc::Receiver<Incoming>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, key: &TerminalKey) -> Result<Socket, ConnectError>;
}

/// Connects to `{base_url}/sessions/{session}/terminals/{terminal}/ws`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    buffer: usize,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConnectError> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("ws://") || base_url.starts_with("wss://")) {
            return Err(ConnectError::InvalidUrl(base_url));
        }
        Ok(Self {
            base_url,
            buffer: 256,
        })
    }

    /// Accepts `http(s)://` server urls as well.
    pub fn from_server_url(server_url: &str) -> Result<Self, ConnectError> {
        let ws = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            server_url.to_string()
        };
        Self::new(ws)
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn url_for(&self, key: &TerminalKey) -> String {
        format!(
            "{}/sessions/{}/terminals/{}/ws",
            self.base_url,
            urlencoding::encode(&key.session_id),
            urlencoding::encode(&key.terminal_id)
        )
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, key: &TerminalKey) -> Result<Socket, ConnectError> {
        let url = self.url_for(key);
        debug!("Opening terminal socket {}", url);

        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(self.buffer);
        let (in_tx, in_rx) = mpsc::channel::<Incoming>(self.buffer);

        tokio::spawn(async move {
            loop {
                let message = match out_rx.recv().await {
                    Some(Outgoing::Data(data)) => Message::Binary(data),
                    Some(Outgoing::Control(frame)) => Message::Text(frame.to_json().into()),
                    Some(Outgoing::Close) | None => {
                        let close = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                };
                if let Err(err) = sink.send(message).await {
                    debug!("Terminal socket write failed: {}", err);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let forward = match message {
                    Ok(Message::Binary(data)) => Incoming::Data(data),
                    Ok(Message::Text(text)) => Incoming::Data(Bytes::from(text.to_string())),
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let _ = in_tx.send(Incoming::Closed(code)).await;
                        return;
                    }
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                    Err(err) => {
                        warn!("Terminal socket read failed: {}", err);
                        return;
                    }
                };
                if in_tx.send(forward).await.is_err() {
                    return;
                }
            }
        });

        Ok(Socket {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_key_parts() {
        let connector = WsConnector::from_server_url("http://localhost:8080/").unwrap();
        let key = TerminalKey::new("sess 1", "tab/2");
        assert_eq!(
            connector.url_for(&key),
            "ws://localhost:8080/sessions/sess%201/terminals/tab%2F2/ws"
        );
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            WsConnector::new("ftp://host"),
            Err(ConnectError::InvalidUrl(_))
        ));
        assert!(WsConnector::from_server_url("https://example.com").is_ok());
    }
}
