//! PTY Session - one agent process behind a pseudo-terminal
//!
//! - portable-pty: process + PTY pair
//! - a blocking reader task forwards output as ordered [`SessionEvent`]s
//! - an exit watcher reaps the child and reports how it ended

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SessionError;

/// Ctrl+C as typed at a terminal; the line discipline turns it into SIGINT
const INTERRUPT: &[u8] = b"\x03";

/// Capacity of the per-session event channel (backpressure for the reader)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How often the exit watcher polls the child
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long the exit watcher waits for trailing output after the child exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long `terminate` waits for the child to be reaped
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);

/// Linux/macOS return EIO from the master once the slave side is gone
const EIO: i32 = 5;

/// Events produced by a session, in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Decoded output text
    Output(String),
    /// The process exited without being terminated by us
    Exit {
        exit_code: i32,
        signal: Option<String>,
    },
    /// Reading from the PTY failed
    Error(String),
}

/// How the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub exit_code: i32,
    pub signal: Option<String>,
}

impl ExitInfo {
    /// portable-pty keeps the signal private and only renders it through
    /// `Display` ("Terminated by <signal>")
    fn from_status(status: &portable_pty::ExitStatus) -> Self {
        let rendered = status.to_string();
        Self {
            exit_code: status.exit_code() as i32,
            signal: rendered
                .strip_prefix("Terminated by ")
                .map(|sig| sig.trim().to_string()),
        }
    }
}

/// PTY session options
#[derive(Debug, Clone)]
pub struct PtySessionOptions {
    /// Connection that owns the session
    pub owner: u64,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub command: String,
    pub args: Vec<String>,
    /// Complete child environment (already sanitized)
    pub env: Vec<(OsString, OsString)>,
}

/// Snapshot of a session for logging and status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub owner: u64,
    pub pid: u32,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub running: bool,
}

/// Interactive agent process wrapped in a PTY
pub struct PtySession {
    pub id: String,
    pub owner: u64,
    pub cwd: PathBuf,
    pid: u32,
    created_at: i64,
    size: StdMutex<(u16, u16)>,
    last_activity_at: Arc<AtomicI64>,

    master: StdMutex<Box<dyn MasterPty + Send>>,
    writer: StdMutex<Option<Box<dyn Write + Send>>>,
    child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,

    running: Arc<AtomicBool>,
    /// Set once we kill the process ourselves; suppresses the Exit event
    terminated: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl PtySession {
    /// Spawn the process and start forwarding its output
    ///
    /// Must be called inside a tokio runtime. The returned receiver yields
    /// every event of this session; it closes after the exit is reported.
    pub fn spawn(
        options: PtySessionOptions,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>), SessionError> {
        let id = format!(
            "pty-{}-{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().to_string()[..8]
        );

        info!(
            session_id = %id,
            owner = options.owner,
            cwd = %options.cwd.display(),
            command = %options.command,
            "Starting PTY session"
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::OpenPty(format!("{:#}", e)))?;

        let mut cmd = CommandBuilder::new(&options.command);
        cmd.args(&options.args);
        cmd.cwd(&options.cwd);
        cmd.env_clear();
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn {
                command: options.command.clone(),
                reason: format!("{:#}", e),
            })?;
        // Close the slave side in the parent so reads hit EOF when the child exits
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let writer = pair.master.take_writer().map_err(SessionError::pty)?;
        let reader = pair.master.try_clone_reader().map_err(SessionError::pty)?;

        info!(session_id = %id, pid, "PTY spawned");

        let now = Utc::now().timestamp_millis();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = oneshot::channel();

        let session = Self {
            id,
            owner: options.owner,
            cwd: options.cwd,
            pid,
            created_at: now,
            size: StdMutex::new((options.cols, options.rows)),
            last_activity_at: Arc::new(AtomicI64::new(now)),
            master: StdMutex::new(pair.master),
            writer: StdMutex::new(Some(writer)),
            child: Arc::new(StdMutex::new(child)),
            running: Arc::new(AtomicBool::new(true)),
            terminated: Arc::new(AtomicBool::new(false)),
            exit_rx,
        };

        let reader_tx = event_tx.clone();
        let last_activity = Arc::clone(&session.last_activity_at);
        let session_id = session.id.clone();
        tokio::task::spawn_blocking(move || {
            Self::read_loop(session_id, reader, reader_tx, last_activity);
            let _ = drained_tx.send(());
        });

        tokio::spawn(Self::exit_watch(
            session.id.clone(),
            Arc::clone(&session.child),
            Arc::clone(&session.running),
            Arc::clone(&session.terminated),
            exit_tx,
            event_tx,
            drained_rx,
        ));

        Ok((session, event_rx))
    }

    /// Blocking read loop; runs on the blocking pool
    fn read_loop(
        session_id: String,
        mut reader: Box<dyn Read + Send>,
        event_tx: mpsc::Sender<SessionEvent>,
        last_activity: Arc<AtomicI64>,
    ) {
        let mut buf = [0u8; 4096];
        let mut carry = Utf8Carry::default();

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    last_activity.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                    let text = carry.decode(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if event_tx.blocking_send(SessionEvent::Output(text)).is_err() {
                        // Receiver dropped
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(EIO) => break,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "PTY read error");
                    let _ = event_tx.blocking_send(SessionEvent::Error(e.to_string()));
                    break;
                }
            }
        }

        let tail = carry.finish();
        if !tail.is_empty() {
            let _ = event_tx.blocking_send(SessionEvent::Output(tail));
        }
        debug!(session_id = %session_id, "PTY reader finished");
    }

    /// Reap the child, then report the exit after trailing output
    async fn exit_watch(
        session_id: String,
        child: Arc<StdMutex<Box<dyn Child + Send + Sync>>>,
        running: Arc<AtomicBool>,
        terminated: Arc<AtomicBool>,
        exit_tx: watch::Sender<Option<ExitInfo>>,
        event_tx: mpsc::Sender<SessionEvent>,
        drained_rx: oneshot::Receiver<()>,
    ) {
        let exit = loop {
            let polled = {
                let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                child.try_wait()
            };
            match polled {
                Ok(Some(status)) => break ExitInfo::from_status(&status),
                Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to poll PTY child");
                    break ExitInfo {
                        exit_code: -1,
                        signal: None,
                    };
                }
            }
        };

        running.store(false, Ordering::SeqCst);

        // Let the reader flush what the child wrote before exiting
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained_rx).await;

        info!(
            session_id = %session_id,
            exit_code = exit.exit_code,
            signal = ?exit.signal,
            "PTY exited"
        );

        if !terminated.load(Ordering::SeqCst) {
            let _ = event_tx
                .send(SessionEvent::Exit {
                    exit_code: exit.exit_code,
                    signal: exit.signal.clone(),
                })
                .await;
        }
        let _ = exit_tx.send(Some(exit));
    }

    // ========== Getters ==========

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.size();
        SessionInfo {
            id: self.id.clone(),
            owner: self.owner,
            pid: self.pid,
            cwd: self.cwd.clone(),
            cols,
            rows,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }

    /// Exit status, once the child has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    // ========== Input ==========

    /// Write raw bytes to the PTY
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning);
        }

        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard.as_mut().ok_or(SessionError::NotRunning)?;
        writer.write_all(data)?;
        writer.flush()?;
        self.last_activity_at
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        debug!(session_id = %self.id, data_len = data.len(), "Wrote to PTY");
        Ok(())
    }

    /// Send Ctrl+C
    pub fn interrupt(&self) -> Result<(), SessionError> {
        self.write(INTERRUPT)
    }

    /// Resize the PTY (the child receives SIGWINCH)
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(SessionError::pty)?;
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = (cols, rows);
        debug!(session_id = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    // ========== Lifecycle ==========

    /// Kill the process and wait for it to be reaped; idempotent
    pub async fn terminate(&self) {
        let first = !self.terminated.swap(true, Ordering::SeqCst);
        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;

        if first && self.is_running() {
            let child = Arc::clone(&self.child);
            let killed = tokio::task::spawn_blocking(move || {
                let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                child.kill()
            })
            .await;
            match killed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id = %self.id, error = %e, "Kill failed"),
                Err(e) => warn!(session_id = %self.id, error = %e, "Kill task failed"),
            }
        }

        if self.wait_for_exit(TERMINATE_TIMEOUT).await.is_none() {
            warn!(session_id = %self.id, pid = self.pid, "PTY child not reaped after kill");
        } else if first {
            info!(session_id = %self.id, pid = self.pid, "PTY session terminated");
        }
    }

    /// Wait until the child has been reaped
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(exit) = rx.borrow_and_update().clone() {
                    return Some(exit);
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        })
        .await;
        waited.ok().flatten()
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.is_running() && !self.terminated.swap(true, Ordering::SeqCst) {
            let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = child.kill() {
                debug!(session_id = %self.id, error = %e, "Kill on drop failed");
            }
        }
    }
}

/// Decodes a byte stream as UTF-8, holding back split multi-byte characters
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: keep it for the next read
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }

        out
    }

    fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).to_string();
        self.pending.clear();
        tail
    }
}
