//! agentd-client - connections to an agentd server
//!
//! Two modes:
//! - independent: each [`ClientConnection`] owns its socket and handlers
//! - shared: one [`SharedConnection`] per process, opened lazily on first
//!   use, fanning every inbound message out to all subscribers

mod connection;
mod error;
mod handlers;
mod shared;
mod state;
mod transport;

pub use connection::ClientConnection;
pub use error::ClientError;
pub use handlers::{HandlerId, HandlerRegistry, Subscription};
pub use shared::SharedConnection;
pub use state::ConnectionState;
pub use transport::{Connector, Transport, WsConnector};
