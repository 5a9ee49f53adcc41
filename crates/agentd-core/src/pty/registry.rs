//! Session Registry - at most one PTY session per client connection
//!
//! Connections are identified by a numeric id handed out by the registry.
//! Starting a session on a connection that already owns one kills the old
//! session first; closing a connection kills whatever it owns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use super::session::{PtySession, PtySessionOptions, SessionEvent};
use crate::config::{AgentConfig, AgentdConfig, SessionConfig};
use crate::env::{resolve_cwd, sanitized_env};
use crate::error::SessionError;
use crate::permission::{PendingPermission, PendingPermissions};

/// Parameters of a `start` request
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub cwd: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub resume_token: Option<String>,
}

/// A freshly started session and its event stream
pub struct StartedSession {
    pub session: Arc<PtySession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// What happened to a permission response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// Keystrokes were written to the agent
    Answered { tool: String, action: String },
    /// No pending request with that id (already answered, evicted, or made up)
    Unknown,
    /// The request was known but the session could not take the input
    Failed(String),
}

struct SessionSlot {
    session: Arc<PtySession>,
    pending: StdMutex<PendingPermissions>,
}

impl SessionSlot {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingPermissions> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub sessions: usize,
    pub running: usize,
    pub pending_permissions: usize,
    pub started_total: u64,
}

/// Owner of every live session
pub struct SessionRegistry {
    slots: RwLock<HashMap<u64, Arc<SessionSlot>>>,
    agent: AgentConfig,
    defaults: SessionConfig,
    max_pending: usize,
    next_connection: AtomicU64,
    started_total: AtomicU64,
}

impl SessionRegistry {
    pub fn new(agent: AgentConfig, defaults: SessionConfig, max_pending: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            agent,
            defaults,
            max_pending,
            next_connection: AtomicU64::new(1),
            started_total: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AgentdConfig) -> Self {
        Self::new(
            config.agent.clone(),
            config.session.clone(),
            config.permissions.max_pending,
        )
    }

    /// Allocate an id for a new connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::SeqCst)
    }

    /// Start the agent for `conn`, replacing any session it already owns
    pub async fn start(
        &self,
        conn: u64,
        request: StartRequest,
    ) -> Result<StartedSession, SessionError> {
        if self.terminate(conn).await {
            info!(conn, "Replaced existing session");
        }

        let cwd = resolve_cwd(&request.cwd)?;

        let mut args = self.agent.args.clone();
        if let Some(token) = request.resume_token.as_ref().filter(|t| !t.is_empty()) {
            if !self.agent.resume_flag.is_empty() {
                args.push(self.agent.resume_flag.clone());
            }
            args.push(token.clone());
        }

        let options = PtySessionOptions {
            owner: conn,
            cwd,
            cols: request.cols.filter(|c| *c > 0).unwrap_or(self.defaults.default_cols),
            rows: request.rows.filter(|r| *r > 0).unwrap_or(self.defaults.default_rows),
            command: self.agent.command.clone(),
            args,
            env: sanitized_env(std::env::vars_os(), &self.agent.strip_env, &self.agent.term),
        };

        let (session, events) = PtySession::spawn(options)?;
        let session = Arc::new(session);

        let slot = Arc::new(SessionSlot {
            session: Arc::clone(&session),
            pending: StdMutex::new(PendingPermissions::new(self.max_pending)),
        });

        // A concurrent start on the same connection may have won the race
        let replaced = self.slots.write().await.insert(conn, slot);
        if let Some(old) = replaced {
            warn!(conn, session_id = %old.session.id, "Concurrent start, terminating older session");
            old.session.terminate().await;
        }

        self.started_total.fetch_add(1, Ordering::SeqCst);
        info!(conn, session_id = %session.id, pid = session.pid(), "Session started");

        Ok(StartedSession { session, events })
    }

    async fn slot(&self, conn: u64) -> Option<Arc<SessionSlot>> {
        self.slots.read().await.get(&conn).cloned()
    }

    /// The session owned by `conn`
    pub async fn session(&self, conn: u64) -> Option<Arc<PtySession>> {
        self.slot(conn).await.map(|slot| Arc::clone(&slot.session))
    }

    pub async fn has_session(&self, conn: u64) -> bool {
        self.slots.read().await.contains_key(&conn)
    }

    /// Forward input; false when there is no live session
    pub async fn write(&self, conn: u64, data: &[u8]) -> bool {
        let Some(session) = self.session(conn).await else {
            debug!(conn, "Input without a session, ignored");
            return false;
        };
        match session.write(data) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn, session_id = %session.id, error = %e, "Input dropped");
                false
            }
        }
    }

    pub async fn resize(&self, conn: u64, cols: u16, rows: u16) -> bool {
        if cols == 0 || rows == 0 {
            return false;
        }
        let Some(session) = self.session(conn).await else {
            return false;
        };
        match session.resize(cols, rows) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn, session_id = %session.id, error = %e, "Resize failed");
                false
            }
        }
    }

    pub async fn interrupt(&self, conn: u64) -> bool {
        let Some(session) = self.session(conn).await else {
            return false;
        };
        session.interrupt().is_ok()
    }

    /// Kill the session owned by `conn`; true if there was one
    ///
    /// Safe to call any number of times. Pending permission requests of the
    /// session are dropped with it.
    pub async fn terminate(&self, conn: u64) -> bool {
        let slot = self.slots.write().await.remove(&conn);
        let Some(slot) = slot else {
            return false;
        };

        let dropped = {
            let mut pending = slot.pending();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(conn, dropped, "Dropped pending permission requests");
        }

        slot.session.terminate().await;
        true
    }

    /// Forget a session that exited on its own
    ///
    /// Only removes the entry if it still refers to `session_id`; a newer
    /// session started on the same connection is left alone.
    pub async fn release(&self, conn: u64, session_id: &str) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get(&conn) {
            Some(slot) if slot.session.id == session_id => {
                slots.remove(&conn);
                debug!(conn, session_id, "Session released");
                true
            }
            _ => false,
        }
    }

    /// Remember a request sent to the client
    pub async fn register_permission(&self, conn: u64, pending: PendingPermission) -> bool {
        let Some(slot) = self.slot(conn).await else {
            return false;
        };
        if let Some(evicted) = slot.pending().insert(pending) {
            warn!(conn, request_id = %evicted.request_id, "Pending permission evicted");
        }
        true
    }

    /// Apply a client decision to a pending request
    ///
    /// Unknown ids are ignored; each request can be answered once.
    pub async fn resolve_permission(
        &self,
        conn: u64,
        request_id: &str,
        approved: bool,
    ) -> PermissionOutcome {
        let Some(slot) = self.slot(conn).await else {
            return PermissionOutcome::Unknown;
        };
        let Some(pending) = slot.pending().take(request_id) else {
            debug!(conn, request_id, "Unknown permission request, ignored");
            return PermissionOutcome::Unknown;
        };

        match slot.session.write(pending.style.keystrokes(approved)) {
            Ok(()) => {
                info!(
                    conn,
                    request_id,
                    tool = %pending.tool,
                    approved,
                    "Permission answered"
                );
                PermissionOutcome::Answered {
                    tool: pending.tool,
                    action: pending.action,
                }
            }
            Err(e) => {
                error!(conn, request_id, error = %e, "Failed to answer permission");
                PermissionOutcome::Failed(e.to_string())
            }
        }
    }

    pub async fn pending_permissions(&self, conn: u64) -> Vec<String> {
        match self.slot(conn).await {
            Some(slot) => slot.pending().ids(),
            None => Vec::new(),
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let slots = self.slots.read().await;
        let mut stats = RegistryStats {
            sessions: slots.len(),
            started_total: self.started_total.load(Ordering::SeqCst),
            ..Default::default()
        };
        for slot in slots.values() {
            if slot.session.is_running() {
                stats.running += 1;
            }
            stats.pending_permissions += slot.pending().len();
        }
        stats
    }

    /// Kill every session
    pub async fn shutdown(&self) {
        info!("Shutting down all sessions...");

        let conns: Vec<u64> = self.slots.read().await.keys().copied().collect();
        for conn in conns {
            self.terminate(conn).await;
        }

        info!("All sessions shut down");
    }
}
