//! WebSocket Module
//!
//! - `/session` connections own at most one agent session
//! - `/events` connections receive control broadcasts

mod connection;
mod control_bus;
mod server;

pub use connection::ConnectionRole;
pub use control_bus::ControlBus;
pub use server::AgentdServer;
