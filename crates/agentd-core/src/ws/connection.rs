//! One client connection: message dispatch and session event forwarding
//!
//! A single task per connection selects over the socket, the session's event
//! stream, the control bus (listeners only) and results of background
//! commands. Everything produced in one step is written to the socket before
//! the next step starts, so a permission request always follows the output
//! chunk that triggered it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use agentd_protocol::{ClientMessage, PcCommandResult, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::server::{close_frame, send_json, ServerState};
use crate::permission::PermissionEngine;
use crate::pty::{PermissionOutcome, PtySession, SessionEvent, StartRequest};

/// Pending results of background `pc-command` runs
const OUTBOUND_CAPACITY: usize = 32;

/// What a connection is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Starts and drives a session; may publish control messages
    Owner,
    /// Receives control messages only
    Listener,
}

struct ActiveSession {
    session: Arc<PtySession>,
    events: mpsc::Receiver<SessionEvent>,
    engine: PermissionEngine,
    ready: bool,
    ready_deadline: Option<Instant>,
}

struct Connection {
    id: u64,
    addr: SocketAddr,
    role: ConnectionRole,
    state: Arc<ServerState>,
    active: Option<ActiveSession>,
    outbound_tx: mpsc::Sender<ServerMessage>,
}

pub(crate) async fn serve(
    ws_stream: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    role: ConnectionRole,
    state: Arc<ServerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let mut conn = Connection {
        id: state.registry.next_connection_id(),
        addr,
        role,
        state,
        active: None,
        outbound_tx,
    };
    let mut bus_rx = (role == ConnectionRole::Listener).then(|| conn.state.bus.subscribe());

    info!(conn = conn.id, ?addr, ?role, "Client connected");

    'conn: loop {
        let mut out = Vec::new();
        let ready_deadline = conn.ready_deadline();

        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => conn.handle_text(&text, &mut out).await,
                    Some(Ok(Message::Binary(data))) => {
                        let text = String::from_utf8_lossy(&data).to_string();
                        conn.handle_text(&text, &mut out).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn = conn.id, ?addr, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }

            event = next_event(&mut conn.active) => {
                conn.handle_event(event, &mut out).await;
            }

            _ = sleep_until(ready_deadline) => {
                conn.handle_ready_timeout(&mut out).await;
            }

            msg = next_broadcast(&mut bus_rx) => {
                match msg {
                    Ok(msg) => out.push(msg),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conn = conn.id, skipped, "Listener lagging, control messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => bus_rx = None,
                }
            }

            Some(msg) = outbound_rx.recv() => out.push(msg),

            _ = shutdown_rx.recv() => {
                let _ = ws_tx
                    .send(Message::Close(Some(close_frame(1001, "Server shutting down"))))
                    .await;
                break;
            }
        }

        if conn.role == ConnectionRole::Listener && bus_rx.is_none() {
            bus_rx = Some(conn.state.bus.subscribe());
        }

        for msg in &out {
            if send_json(&mut ws_tx, msg).await.is_err() {
                break 'conn;
            }
        }
    }

    conn.close().await;
    info!(conn = conn.id, ?addr, "Client disconnected");
    Ok(())
}

async fn next_event(active: &mut Option<ActiveSession>) -> Option<SessionEvent> {
    match active {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_broadcast(
    rx: &mut Option<broadcast::Receiver<ServerMessage>>,
) -> Result<ServerMessage, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Connection {
    fn ready_deadline(&self) -> Option<Instant> {
        self.active
            .as_ref()
            .filter(|a| !a.ready)
            .and_then(|a| a.ready_deadline)
    }

    async fn handle_text(&mut self, text: &str, out: &mut Vec<ServerMessage>) {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(conn = self.id, error = %e, len = text.len(), "Malformed message ignored");
                return;
            }
        };

        match msg {
            ClientMessage::Start {
                cwd,
                cols,
                rows,
                resume_token,
            } => {
                let request = StartRequest {
                    cwd,
                    cols,
                    rows,
                    resume_token,
                };
                self.start(request, out).await;
            }
            ClientMessage::Input { data } => {
                self.state.registry.write(self.id, data.as_bytes()).await;
            }
            ClientMessage::Resize { cols, rows } => {
                self.state.registry.resize(self.id, cols, rows).await;
            }
            ClientMessage::Stop => {
                self.end_session().await;
                out.push(ServerMessage::Stopped);
            }
            ClientMessage::Close => {
                self.end_session().await;
                out.push(ServerMessage::Closed);
            }
            ClientMessage::PermissionResponse {
                request_id,
                approved,
            } => {
                let outcome = self
                    .state
                    .registry
                    .resolve_permission(self.id, &request_id, approved)
                    .await;
                if let PermissionOutcome::Failed(reason) = outcome {
                    warn!(conn = self.id, request_id = %request_id, reason = %reason, "Permission not delivered");
                }
            }
            ClientMessage::PcCommand { command, args } => self.run_command(command, args, out),
            ClientMessage::Listen => {
                if self.role != ConnectionRole::Listener {
                    info!(conn = self.id, "Connection switched to listener");
                    self.end_session().await;
                    self.role = ConnectionRole::Listener;
                }
            }
            ClientMessage::Control(payload) => self.publish(ServerMessage::Control(payload)),
            ClientMessage::WorkflowControl(map) => {
                self.publish(ServerMessage::WorkflowControl(map))
            }
        }
    }

    async fn start(&mut self, request: StartRequest, out: &mut Vec<ServerMessage>) {
        if self.role == ConnectionRole::Listener {
            out.push(ServerMessage::error(
                "Listener connections cannot start sessions",
            ));
            return;
        }

        // Stop reading the old session before the registry kills it
        self.active = None;

        match self.state.registry.start(self.id, request).await {
            Ok(started) => {
                let session = started.session;
                out.push(ServerMessage::Started {
                    pid: session.pid(),
                    cwd: session.cwd.display().to_string(),
                });
                self.active = Some(ActiveSession {
                    session,
                    events: started.events,
                    engine: PermissionEngine::new(
                        self.state.permissions.buffer_chars,
                        self.state.permissions.context_chars,
                    ),
                    ready: false,
                    ready_deadline: self.state.session.ready_timeout().map(|t| Instant::now() + t),
                });
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "Failed to start session");
                out.push(ServerMessage::error(e.to_string()));
            }
        }
    }

    async fn handle_event(&mut self, event: Option<SessionEvent>, out: &mut Vec<ServerMessage>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match event {
            Some(SessionEvent::Output(data)) => {
                if !active.ready {
                    active.ready = true;
                    out.push(ServerMessage::Ready);
                }
                let prompts = active.engine.feed(&data);
                out.push(ServerMessage::Output { data });

                for prompt in prompts {
                    self.state
                        .registry
                        .register_permission(self.id, prompt.to_pending())
                        .await;
                    out.push(ServerMessage::PermissionRequest {
                        request_id: prompt.request_id,
                        tool: prompt.tool,
                        action: prompt.action,
                        full_text: prompt.full_text,
                    });
                }
            }
            Some(SessionEvent::Error(error)) => {
                out.push(ServerMessage::error(format!("PTY read error: {}", error)));
            }
            Some(SessionEvent::Exit { exit_code, signal }) => {
                let session_id = active.session.id.clone();
                self.state.registry.release(self.id, &session_id).await;
                self.active = None;

                info!(conn = self.id, session_id = %session_id, exit_code, signal = ?signal, "Agent exited");
                if exit_code == 0 && signal.is_none() {
                    out.push(ServerMessage::Done { exit_code });
                }
                out.push(ServerMessage::Exit { exit_code, signal });
            }
            None => {
                // Stream ended without an exit report
                let session_id = active.session.id.clone();
                self.state.registry.release(self.id, &session_id).await;
                self.active = None;
                debug!(conn = self.id, session_id = %session_id, "Session event stream closed");
            }
        }
    }

    async fn handle_ready_timeout(&mut self, out: &mut Vec<ServerMessage>) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if active.ready {
            return;
        }

        let waited = self.state.session.ready_timeout_secs;
        warn!(conn = self.id, session_id = %active.session.id, waited, "Agent produced no output");
        self.end_session().await;
        out.push(ServerMessage::error(format!(
            "Agent produced no output within {}s",
            waited
        )));
    }

    fn run_command(&self, command: String, args: Vec<String>, out: &mut Vec<ServerMessage>) {
        if self.role == ConnectionRole::Listener {
            out.push(ServerMessage::PcCommandResult(PcCommandResult::failure(
                "Listener connections cannot run commands",
            )));
            return;
        }

        let cwd = self.command_cwd();
        let gate = self.state.gate.clone();
        let tx = self.outbound_tx.clone();
        let conn = self.id;

        tokio::spawn(async move {
            let result = gate.execute(&command, &args, &cwd).await;
            if tx.send(ServerMessage::PcCommandResult(result)).await.is_err() {
                debug!(conn, "Connection gone before command finished");
            }
        });
    }

    /// Session directory, then the configured default, then home
    fn command_cwd(&self) -> PathBuf {
        if let Some(active) = &self.active {
            return active.session.cwd.clone();
        }
        self.state
            .default_cwd
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn publish(&self, msg: ServerMessage) {
        if self.role == ConnectionRole::Listener {
            debug!(conn = self.id, "Listener tried to publish, ignored");
            return;
        }
        let delivered = self.state.bus.publish(msg);
        debug!(conn = self.id, delivered, "Control message published");
    }

    /// Kill the session this connection owns, if any
    async fn end_session(&mut self) {
        self.active = None;
        self.state.registry.terminate(self.id).await;
    }

    async fn close(&mut self) {
        if self.active.is_some() || self.state.registry.has_session(self.id).await {
            debug!(conn = self.id, addr = ?self.addr, "Terminating session of closed connection");
        }
        self.end_session().await;
    }
}
