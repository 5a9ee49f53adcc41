//! A single client connection to agentd
//!
//! Inbound messages are pumped by a background task that updates the
//! connection state and hands each message to every registered handler.
//! Outgoing operations are synchronous and return `false` when the
//! connection is not ready; nothing is queued for later.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use agentd_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::ClientError;
use crate::handlers::{HandlerRegistry, Subscription};
use crate::state::ConnectionState;
use crate::transport::{Connector, Transport};

pub struct ClientConnection {
    outgoing: StdMutex<Option<mpsc::Sender<ClientMessage>>>,
    state: Arc<StdMutex<ConnectionState>>,
    handlers: Arc<HandlerRegistry>,
    pump: JoinHandle<()>,
}

impl ClientConnection {
    /// Open an independent connection with its own handlers
    pub async fn connect(connector: &dyn Connector, timeout: Duration) -> Result<Self, ClientError> {
        Self::connect_with(connector, timeout, Arc::new(HandlerRegistry::new())).await
    }

    pub(crate) async fn connect_with(
        connector: &dyn Connector,
        timeout: Duration,
        handlers: Arc<HandlerRegistry>,
    ) -> Result<Self, ClientError> {
        match tokio::time::timeout(timeout, connector.connect()).await {
            Ok(Ok(transport)) => Ok(Self::from_transport(transport, handlers)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    pub fn from_transport(transport: Transport, handlers: Arc<HandlerRegistry>) -> Self {
        let Transport {
            outgoing,
            mut incoming,
        } = transport;
        let state = Arc::new(StdMutex::new(ConnectionState::Idle));

        let pump_state = Arc::clone(&state);
        let pump_handlers = Arc::clone(&handlers);
        let pump = tokio::spawn(async move {
            while let Some(msg) = incoming.recv().await {
                {
                    let mut state = lock(&pump_state);
                    *state = state.on_message(&msg);
                }
                pump_handlers.dispatch(&msg);
            }
            *lock(&pump_state) = ConnectionState::Disconnected;
            debug!("Connection closed by peer");
        });

        Self {
            outgoing: StdMutex::new(Some(outgoing)),
            state,
            handlers,
            pump,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Receive every inbound message until the subscription is dropped
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = self.handlers.subscribe(handler);
        Subscription::new(&self.handlers, id)
    }

    /// Send a raw message
    pub fn send(&self, msg: ClientMessage) -> bool {
        if !self.is_ready() {
            return false;
        }
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    pub fn start_session(
        &self,
        cwd: impl Into<String>,
        cols: Option<u16>,
        rows: Option<u16>,
        resume_token: Option<String>,
    ) -> bool {
        self.send(ClientMessage::Start {
            cwd: cwd.into(),
            cols,
            rows,
            resume_token,
        })
    }

    /// Raw keystrokes
    pub fn send_input(&self, data: impl Into<String>) -> bool {
        self.send(ClientMessage::Input { data: data.into() })
    }

    /// A composed message: the text followed by Enter
    pub fn send_message(&self, text: &str) -> bool {
        self.send_input(format!("{}\r", text))
    }

    /// Ctrl+C to the agent
    pub fn interrupt(&self) -> bool {
        self.send_input("\x03")
    }

    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.send(ClientMessage::Resize { cols, rows })
    }

    pub fn stop_session(&self) -> bool {
        self.send(ClientMessage::Stop)
    }

    pub fn close_session(&self) -> bool {
        self.send(ClientMessage::Close)
    }

    pub fn respond_permission(&self, request_id: impl Into<String>, approved: bool) -> bool {
        self.send(ClientMessage::PermissionResponse {
            request_id: request_id.into(),
            approved,
        })
    }

    pub fn run_command(&self, command: impl Into<String>, args: Vec<String>) -> bool {
        self.send(ClientMessage::PcCommand {
            command: command.into(),
            args,
        })
    }

    /// Switch this connection to the listener role
    pub fn register_listener(&self) -> bool {
        self.send(ClientMessage::Listen)
    }

    /// Close the socket; later operations return `false`
    pub fn shutdown(&self) {
        // Dropping the last sender ends the writer, which closes the socket
        lock(&self.outgoing).take();
        self.pump.abort();
        *lock(&self.state) = ConnectionState::Disconnected;
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
