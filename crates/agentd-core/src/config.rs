//! Daemon configuration
//!
//! Loaded from `<home>/config.yaml`. Every field has a default, so a missing
//! file (or a missing section) behaves like an empty one.
//!
//! ```yaml
//! server:
//!   host: 127.0.0.1
//!   port: 9130
//! agent:
//!   command: claude
//!   args: []
//!   strip_env: [ANTHROPIC_API_KEY, CLAUDECODE]
//! permissions:
//!   buffer_chars: 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Default WebSocket port
pub const DEFAULT_PORT: u16 = 9130;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub permissions: PermissionConfig,
    #[serde(default)]
    pub commands: CommandConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// How the agent process is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program to run inside the PTY
    pub command: String,
    /// Arguments passed before any resume flag
    pub args: Vec<String>,
    /// Flag used to hand a resume token to the agent
    pub resume_flag: String,
    /// Environment variables the child must not inherit
    pub strip_env: Vec<String>,
    /// Value of TERM inside the PTY
    pub term: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            resume_flag: "--resume".to_string(),
            strip_env: vec![
                "ANTHROPIC_API_KEY".to_string(),
                "ANTHROPIC_AUTH_TOKEN".to_string(),
                "CLAUDECODE".to_string(),
            ],
            term: "xterm-256color".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_cols: u16,
    pub default_rows: u16,
    /// Seconds to wait for the first output before giving up; 0 disables
    pub ready_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_cols: 120,
            default_rows: 30,
            ready_timeout_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.ready_timeout_secs > 0).then(|| Duration::from_secs(self.ready_timeout_secs))
    }
}

/// Permission prompt detection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Characters of trailing output kept for scanning
    pub buffer_chars: usize,
    /// Characters of context attached to each request
    pub context_chars: usize,
    /// Pending requests kept per session before the oldest is evicted
    pub max_pending: usize,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            buffer_chars: 2000,
            context_chars: 500,
            max_pending: 32,
        }
    }
}

/// Direct command execution (`pc-command`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    /// Working directory when the connection owns no session
    pub default_cwd: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 60,
            default_cwd: None,
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl AgentdConfig {
    /// Load from a YAML file; defaults if the file is missing or unreadable
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = ?path, "No config found, using defaults");
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => {
                    info!(path = ?path, "Config loaded");
                    config
                }
                Err(e) => {
                    error!(error = %e, path = ?path, "Failed to parse config");
                    Self::default()
                }
            },
            Err(e) => {
                error!(error = %e, path = ?path, "Failed to read config");
                Self::default()
            }
        }
    }

    /// Apply `AGENTD_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("AGENTD_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(host) = lookup("AGENTD_HOST").filter(|v| !v.is_empty()) {
            self.server.host = host;
        }
        if let Some(command) = lookup("AGENTD_AGENT_COMMAND").filter(|v| !v.is_empty()) {
            self.agent.command = command;
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// `AGENTD_HOME`, or `~/.agentd`
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("AGENTD_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentd")
}
