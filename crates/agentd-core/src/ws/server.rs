//! WebSocket Server
//!
//! - Session owner: `ws://host:port/session`
//! - Broadcast listener: `ws://host:port/events`
//!
//! Every frame is a JSON [`ClientMessage`](agentd_protocol::ClientMessage) or
//! [`ServerMessage`](agentd_protocol::ServerMessage). Any other path is closed
//! with code 4000.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{error, info, warn};

use super::connection::{self, ConnectionRole};
use super::control_bus::ControlBus;
use crate::config::{AgentdConfig, PermissionConfig, SessionConfig};
use crate::gate::CommandGate;
use crate::pty::SessionRegistry;

pub(crate) type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Everything a connection task needs from the server
pub(crate) struct ServerState {
    pub registry: Arc<SessionRegistry>,
    pub bus: ControlBus,
    pub gate: CommandGate,
    pub session: SessionConfig,
    pub permissions: PermissionConfig,
    pub default_cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Session,
    Events,
    Invalid,
}

fn parse_route(path: &str) -> Route {
    match path.trim_end_matches('/') {
        "/session" => Route::Session,
        "/events" => Route::Events,
        _ => Route::Invalid,
    }
}

pub(crate) fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into().into(),
    }
}

pub(crate) async fn send_json<S: Serialize>(ws_tx: &mut WsSink, msg: &S) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}

/// The agentd WebSocket server
pub struct AgentdServer {
    bind_addr: String,
    state: Arc<ServerState>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl AgentdServer {
    pub fn new(config: &AgentdConfig) -> Self {
        let registry = Arc::new(SessionRegistry::from_config(config));
        Self::with_registry(config, registry)
    }

    /// Build around an existing registry (shared with the caller)
    pub fn with_registry(config: &AgentdConfig, registry: Arc<SessionRegistry>) -> Self {
        let state = ServerState {
            registry,
            bus: ControlBus::new(),
            gate: CommandGate::new(config.commands.enabled, config.commands.timeout()),
            session: config.session.clone(),
            permissions: config.permissions.clone(),
            default_cwd: config.commands.default_cwd.clone(),
        };
        Self {
            bind_addr: config.bind_addr(),
            state: Arc::new(state),
            shutdown_tx: None,
            local_addr: None,
        }
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn control_bus(&self) -> ControlBus {
        self.state.bus.clone()
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and start accepting connections
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!(addr = %local_addr, "agentd WebSocket server started");

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let state = Arc::clone(&state);
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = Self::handle_connection(stream, addr, state, shutdown_rx).await {
                                        error!(error = %e, ?addr, "WebSocket connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting, close every connection and kill every session
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.state.registry.shutdown().await;
        info!("agentd WebSocket server stopped");
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        state: Arc<ServerState>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        // Capture path from handshake
        let path_cell = Arc::new(StdMutex::new(String::new()));
        let path_cell2 = Arc::clone(&path_cell);

        let ws_stream = accept_hdr_async(stream, move |req: &WsRequest, resp: WsResponse| {
            if let Ok(mut path) = path_cell2.lock() {
                *path = req.uri().path().to_string();
            }
            Ok(resp)
        })
        .await
        .context("WebSocket handshake failed")?;

        let path = path_cell
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|_| "/".to_string());

        let role = match parse_route(&path) {
            Route::Session => ConnectionRole::Owner,
            Route::Events => ConnectionRole::Listener,
            Route::Invalid => {
                let (mut ws_tx, _ws_rx) = ws_stream.split();
                let _ = ws_tx
                    .send(Message::Close(Some(close_frame(
                        4000,
                        "Invalid URL. Use /session or /events",
                    ))))
                    .await;
                warn!(?addr, %path, "Invalid WebSocket URL");
                return Ok(());
            }
        };

        connection::serve(ws_stream, addr, role, state, shutdown_rx).await
    }
}
