//! Permission prompt detection and bookkeeping

mod buffer;
mod engine;
mod pending;
mod rules;

pub use buffer::{tail_chars, OutputBuffer};
pub use engine::{strip_ansi, PermissionEngine, PermissionPrompt};
pub use pending::{PendingPermission, PendingPermissions};
pub use rules::{PromptDetector, PromptMatch, PromptStyle, RuleSet};
