//! Permission requests awaiting a client decision

use std::collections::VecDeque;

use super::rules::PromptStyle;

/// A request that has been sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPermission {
    pub request_id: String,
    pub tool: String,
    pub action: String,
    pub context: String,
    pub style: PromptStyle,
    /// Unix millis when the prompt was detected
    pub detected_at: i64,
}

/// Bounded set of pending requests; the oldest is evicted first
#[derive(Debug)]
pub struct PendingPermissions {
    entries: VecDeque<PendingPermission>,
    cap: usize,
}

impl PendingPermissions {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Add a request, returning whichever entry had to make room for it
    pub fn insert(&mut self, pending: PendingPermission) -> Option<PendingPermission> {
        let evicted = if self.entries.len() >= self.cap {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(pending);
        evicted
    }

    /// Remove and return a request; `None` for unknown ids
    pub fn take(&mut self, request_id: &str) -> Option<PendingPermission> {
        let index = self
            .entries
            .iter()
            .position(|p| p.request_id == request_id)?;
        self.entries.remove(index)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.iter().any(|p| p.request_id == request_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|p| p.request_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
