//! agentd-core - PTY agent sessions behind a WebSocket
//!
//! # Modules
//! - `pty`: agent processes in pseudo-terminals, one per connection
//! - `permission`: permission prompt detection over the output stream
//! - `gate`: denylist for direct command execution
//! - `ws`: WebSocket server, per-connection dispatch, control bus
//! - `config`: YAML configuration with environment overrides

pub mod config;
pub mod env;
pub mod error;
pub mod gate;
pub mod permission;
pub mod pty;
pub mod ws;

pub use config::{default_home, AgentdConfig};
pub use error::{CommandError, SessionError};
pub use gate::{CommandGate, GateDecision};
pub use permission::{PermissionEngine, PermissionPrompt, PromptDetector, RuleSet};
pub use pty::{PtySession, RegistryStats, SessionEvent, SessionRegistry, StartRequest};
pub use ws::{AgentdServer, ConnectionRole, ControlBus};
