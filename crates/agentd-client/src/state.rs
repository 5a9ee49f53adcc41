//! Client-side connection state machine
//!
//! `Disconnected → Connecting → Idle ⇄ Running → Disconnected`. A session
//! runs from `started`/`ready` until `done`/`exit`/`stopped`/`closed`.

use agentd_protocol::ServerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Connected, no session running
    Idle,
    /// Connected with a running session
    Running,
}

impl ConnectionState {
    /// Whether outgoing operations are accepted
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Running)
    }

    /// State after receiving `msg`
    pub fn on_message(self, msg: &ServerMessage) -> Self {
        if !self.is_ready() {
            return self;
        }
        if msg.starts_run() {
            ConnectionState::Running
        } else if msg.ends_run() {
            ConnectionState::Idle
        } else {
            self
        }
    }
}
