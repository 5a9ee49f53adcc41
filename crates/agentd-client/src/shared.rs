//! Shared connection
//!
//! One lazily opened connection serves every consumer in the process. At
//! most one connection attempt is in flight: the first caller to find the
//! connection missing takes the `connecting` flag and dials, everyone else
//! waits (bounded) for that attempt's outcome and gets the same connection
//! or the same failure. Consumers come and go through [`Subscription`]s; the
//! connection itself closes only on [`SharedConnection::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agentd_protocol::{ClientMessage, ServerMessage};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::error::ClientError;
use crate::handlers::{HandlerRegistry, Subscription};
use crate::state::ConnectionState;
use crate::transport::Connector;

/// Extra time a waiting caller allows beyond the connect timeout
const WAIT_GRACE: Duration = Duration::from_secs(1);

type Outcome = Result<Arc<ClientConnection>, ClientError>;

#[derive(Clone, Default)]
struct Attempt {
    generation: u64,
    outcome: Option<Outcome>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    handlers: Arc<HandlerRegistry>,
    current: StdMutex<Option<Arc<ClientConnection>>>,
    connecting: AtomicBool,
    attempts: watch::Sender<Attempt>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Inner>,
}

/// Publishes the outcome and clears the flag even if the dialing caller is
/// cancelled mid-attempt
struct AttemptGuard<'a> {
    inner: &'a Inner,
    finished: bool,
}

impl AttemptGuard<'_> {
    fn finish(mut self, outcome: Outcome) -> Outcome {
        self.publish(outcome.clone());
        self.finished = true;
        outcome
    }

    /// Hand the flag back without publishing an outcome
    fn release(mut self) {
        self.finished = true;
        self.inner.connecting.store(false, Ordering::Release);
    }

    fn publish(&self, outcome: Outcome) {
        self.inner.attempts.send_modify(|attempt| {
            attempt.generation += 1;
            attempt.outcome = Some(outcome);
        });
        self.inner.connecting.store(false, Ordering::Release);
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.publish(Err(ClientError::Connect(
                "connection attempt abandoned".to_string(),
            )));
        }
    }
}

impl SharedConnection {
    pub fn new(connector: impl Connector, connect_timeout: Duration) -> Self {
        let (attempts, _) = watch::channel(Attempt::default());
        Self {
            inner: Arc::new(Inner {
                connector: Arc::new(connector),
                connect_timeout,
                handlers: Arc::new(HandlerRegistry::new()),
                current: StdMutex::new(None),
                connecting: AtomicBool::new(false),
                attempts,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.inner.closed.load(Ordering::Acquire) {
            return ConnectionState::Disconnected;
        }
        if self.inner.connecting.load(Ordering::Acquire) {
            return ConnectionState::Connecting;
        }
        self.current()
            .map(|conn| conn.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_connection().is_some()
    }

    /// Handlers survive reconnects; drop the subscription to stop receiving
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = self.inner.handlers.subscribe(handler);
        Subscription::new(&self.inner.handlers, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.len()
    }

    /// The ready connection, dialing if there is none
    pub async fn connection(&self) -> Result<Arc<ClientConnection>, ClientError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Shutdown);
        }

        // Subscribe before looking so an attempt finishing in between is seen
        let mut rx = inner.attempts.subscribe();
        let seen = rx.borrow_and_update().generation;
        if let Some(conn) = self.ready_connection() {
            return Ok(conn);
        }

        self.join_or_dial(rx, seen).await
    }

    /// Wait for the attempt in flight, or become the one that dials
    async fn join_or_dial(&self, rx: watch::Receiver<Attempt>, seen: u64) -> Outcome {
        let inner = &self.inner;
        if inner
            .connecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.wait_for_attempt(rx, seen).await;
        }

        let guard = AttemptGuard {
            inner,
            finished: false,
        };

        // An attempt may have completed since this caller looked
        let completed = {
            let attempt = rx.borrow();
            (attempt.generation != seen).then(|| attempt.outcome.clone())
        };
        if let Some(outcome) = completed {
            guard.release();
            return outcome.unwrap_or(Err(ClientError::Closed));
        }
        // `current` is installed before the outcome is published
        if let Some(conn) = self.ready_connection() {
            guard.release();
            return Ok(conn);
        }

        debug!("Opening shared connection");
        let outcome = ClientConnection::connect_with(
            inner.connector.as_ref(),
            inner.connect_timeout,
            Arc::clone(&inner.handlers),
        )
        .await
        .map(Arc::new);

        let outcome = match outcome {
            Ok(conn) if inner.closed.load(Ordering::Acquire) => {
                conn.shutdown();
                Err(ClientError::Shutdown)
            }
            Ok(conn) => {
                info!("Shared connection established");
                *lock(&inner.current) = Some(Arc::clone(&conn));
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "Shared connection failed");
                Err(e)
            }
        };
        guard.finish(outcome)
    }

    async fn wait_for_attempt(&self, mut rx: watch::Receiver<Attempt>, seen: u64) -> Outcome {
        let wait = self.inner.connect_timeout + WAIT_GRACE;
        let waited = tokio::time::timeout(wait, async move {
            loop {
                if rx.changed().await.is_err() {
                    return Err(ClientError::Closed);
                }
                let completed = {
                    let attempt = rx.borrow_and_update();
                    (attempt.generation != seen).then(|| attempt.outcome.clone())
                };
                if let Some(outcome) = completed {
                    return outcome.unwrap_or(Err(ClientError::Closed));
                }
            }
        })
        .await;
        waited.unwrap_or(Err(ClientError::Timeout(wait)))
    }

    fn current(&self) -> Option<Arc<ClientConnection>> {
        lock(&self.inner.current).clone()
    }

    fn ready_connection(&self) -> Option<Arc<ClientConnection>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        self.current().filter(|conn| conn.is_ready())
    }

    fn with_ready(&self, op: impl FnOnce(&ClientConnection) -> bool) -> bool {
        match self.ready_connection() {
            Some(conn) => op(&conn),
            None => false,
        }
    }

    pub fn send(&self, msg: ClientMessage) -> bool {
        self.with_ready(|conn| conn.send(msg))
    }

    pub fn start_session(
        &self,
        cwd: impl Into<String>,
        cols: Option<u16>,
        rows: Option<u16>,
        resume_token: Option<String>,
    ) -> bool {
        self.with_ready(|conn| conn.start_session(cwd, cols, rows, resume_token))
    }

    pub fn send_input(&self, data: impl Into<String>) -> bool {
        self.with_ready(|conn| conn.send_input(data))
    }

    pub fn send_message(&self, text: &str) -> bool {
        self.with_ready(|conn| conn.send_message(text))
    }

    pub fn interrupt(&self) -> bool {
        self.with_ready(|conn| conn.interrupt())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.with_ready(|conn| conn.resize(cols, rows))
    }

    pub fn stop_session(&self) -> bool {
        self.with_ready(|conn| conn.stop_session())
    }

    pub fn close_session(&self) -> bool {
        self.with_ready(|conn| conn.close_session())
    }

    pub fn respond_permission(&self, request_id: impl Into<String>, approved: bool) -> bool {
        self.with_ready(|conn| conn.respond_permission(request_id, approved))
    }

    pub fn run_command(&self, command: impl Into<String>, args: Vec<String>) -> bool {
        self.with_ready(|conn| conn.run_command(command, args))
    }

    pub fn register_listener(&self) -> bool {
        self.with_ready(|conn| conn.register_listener())
    }

    /// Close the connection for every consumer; no further attempts are made
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(conn) = lock(&self.inner.current).take() {
            conn.shutdown();
        }
        info!("Shared connection shut down");
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
