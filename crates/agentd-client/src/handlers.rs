//! Fan-out of inbound messages to registered handlers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use agentd_protocol::ServerMessage;

pub type Handler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Every handler sees every message; none gets exclusive delivery
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: StdMutex<Vec<(HandlerId, Handler)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Call every handler; handlers may (un)subscribe from inside the call
    pub fn dispatch(&self, msg: &ServerMessage) {
        let handlers: Vec<Handler> = self.lock().iter().map(|(_, h)| Arc::clone(h)).collect();
        for handler in handlers {
            handler(msg);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Handler)>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Unsubscribes its handler when dropped
pub struct Subscription {
    registry: Weak<HandlerRegistry>,
    id: HandlerId,
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<HandlerRegistry>, id: HandlerId) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            id,
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}
