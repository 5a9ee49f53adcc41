//! PTY Module - agent processes behind pseudo-terminals
//!
//! # Components
//! - `PtySession`: one interactive agent process
//! - `SessionRegistry`: sessions keyed by owning connection

mod registry;
mod session;

pub use registry::{
    PermissionOutcome, RegistryStats, SessionRegistry, StartRequest, StartedSession,
};
pub use session::{ExitInfo, PtySession, PtySessionOptions, SessionEvent, SessionInfo};
