//! Transport
//!
//! A connected transport is a pair of channels: typed messages out, typed
//! messages in. The incoming channel closes when the socket does.

use agentd_protocol::{ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::ClientError;

const CHANNEL_CAPACITY: usize = 256;

pub struct Transport {
    pub outgoing: mpsc::Sender<ClientMessage>,
    pub incoming: mpsc::Receiver<ServerMessage>,
}

/// Opens transports; one call is one connection attempt
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Transport, ClientError>;
}

/// Connects to an agentd WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Owner endpoint on `host:port`
    pub fn session(host: &str, port: u16) -> Self {
        Self::new(format!("ws://{}:{}/session", host, port))
    }

    /// Listener endpoint on `host:port`
    pub fn events(host: &str, port: u16) -> Self {
        Self::new(format!("ws://{}:{}/events", host, port))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport, ClientError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        info!(url = %self.url, "Connected to agentd");

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<ServerMessage>(CHANNEL_CAPACITY);

        // Writer: ends when every sender is dropped, then closes the socket
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(error = %e, "Unrecognized server message ignored"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(url = %url, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            info!(url = %url, "Disconnected from agentd");
        });

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
