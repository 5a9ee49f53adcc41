//! Command Safety Gate - denylist in front of direct command execution
//!
//! `pc-command` runs a program without a PTY and without a shell. Before it
//! runs, the full command line is matched against a fixed set of destructive
//! patterns. This is a blocklist, not a sandbox: anything it does not name is
//! allowed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use agentd_protocol::PcCommandResult;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CommandError;

/// Where a program name can appear in a command line, optionally invoked
/// through a path (`/bin/rm`, `./mkfs.ext4`)
const AT_COMMAND: &str = r#"(?:^|[;&|(`'"]\s*|\s-c\s+|\bsudo\s+|\bexec\s+|\bxargs\s+|\benv\s+)(?:[^\s;&|]*/)?"#;

static DENYLIST: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let rules = [
        (
            "recursive delete of a root path",
            format!(
                r#"(?i){AT_COMMAND}rm\s+(?:-\S+\s+)*(?:-[a-z]*r[a-z]*|--recursive)\s+(?:-\S+\s+)*['"]?(?:/|/\*|~|~/|~/\*|\$HOME|\$\{{HOME\}}|\*|\.|\.\.)['"]?(?:\s|$|;|&|\|)"#
            ),
        ),
        ("recursive delete without root protection", r"--no-preserve-root".to_string()),
        (
            "raw disk write",
            format!(
                r"(?i){AT_COMMAND}dd\s.*\bof=/dev/(?:sd|hd|nvme|vd|xvd|mmcblk|disk|mapper|loop)"
            ),
        ),
        (
            "redirect onto a block device",
            r">\s*/dev/(?:sd|hd|nvme|vd|xvd|mmcblk|disk)".to_string(),
        ),
        (
            "filesystem creation",
            format!(r"(?i){AT_COMMAND}(?:mkfs(?:\.\w+)?|mke2fs|mkswap|wipefs|fdisk|parted)\b"),
        ),
        (
            "shutdown or reboot",
            format!(r"(?i){AT_COMMAND}(?:shutdown|reboot|halt|poweroff)\b"),
        ),
        ("runlevel change", format!(r"(?i){AT_COMMAND}(?:init|telinit)\s+[06]\b")),
        (
            "shutdown or reboot",
            format!(r"(?i){AT_COMMAND}systemctl\s+(?:poweroff|reboot|halt|kexec)\b"),
        ),
        ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:".to_string()),
        (
            "recursive permission change on root",
            format!(r"(?i){AT_COMMAND}(?:chmod|chown)\s+(?:-\S+\s+)*-[a-z]*R[a-z]*\s+\S+\s+/(?:\s|$)"),
        ),
    ];

    rules
        .into_iter()
        .filter_map(|(reason, pattern)| match Regex::new(&pattern) {
            Ok(re) => Some((reason, re)),
            Err(e) => {
                warn!(reason, error = %e, "Invalid denylist pattern skipped");
                None
            }
        })
        .collect()
});

/// Gate verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { reason: String },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// The full command line the gate looks at
pub fn command_line(command: &str, args: &[String]) -> String {
    let mut line = command.trim().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Denylist check plus execution of allowed commands
#[derive(Debug, Clone)]
pub struct CommandGate {
    enabled: bool,
    timeout: Duration,
}

impl Default for CommandGate {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CommandGate {
    pub fn new(enabled: bool, timeout: Duration) -> Self {
        Self { enabled, timeout }
    }

    /// Pure check: deny if any pattern matches the command line
    pub fn check(&self, command: &str, args: &[String]) -> GateDecision {
        let line = command_line(command, args);
        match DENYLIST.iter().find(|(_, re)| re.is_match(&line)) {
            Some((reason, _)) => GateDecision::Deny {
                reason: reason.to_string(),
            },
            None => GateDecision::Allow,
        }
    }

    /// Check, then run without a shell in `cwd`
    ///
    /// Never fails: a blocked, missing or timed-out command comes back as an
    /// unsuccessful result with `error` set.
    pub async fn execute(&self, command: &str, args: &[String], cwd: &Path) -> PcCommandResult {
        match self.try_execute(command, args, cwd).await {
            Ok(result) => result,
            Err(e) => {
                match &e {
                    CommandError::Blocked(_) => {
                        warn!(command = %command_line(command, args), error = %e, "Command denied")
                    }
                    _ => debug!(command, error = %e, "Command failed"),
                }
                PcCommandResult::failure(e.to_string())
            }
        }
    }

    async fn try_execute(
        &self,
        command: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<PcCommandResult, CommandError> {
        if !self.enabled {
            return Err(CommandError::Disabled);
        }
        if command.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        if let GateDecision::Deny { reason } = self.check(command, args) {
            return Err(CommandError::Blocked(reason));
        }

        let mut cmd = Command::new(command.trim());
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::Timeout(self.timeout))?
            .map_err(|source| CommandError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let exit_code = output.status.code();
        info!(
            command,
            cwd = %cwd.display(),
            exit_code = ?exit_code,
            "Command finished"
        );

        Ok(PcCommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_denies_destructive_corpus() {
        let gate = CommandGate::default();
        let denied: &[(&str, &[&str])] = &[
            ("rm", &["-rf", "/"]),
            ("rm", &["-r", "-f", "/*"]),
            ("rm", &["-fr", "~"]),
            ("rm", &["--recursive", "$HOME"]),
            ("sudo", &["rm", "-rf", "/"]),
            ("rm", &["-rf", "--no-preserve-root", "/"]),
            ("sh", &["-c", "rm -rf /"]),
            ("dd", &["if=/dev/zero", "of=/dev/sda", "bs=1M"]),
            ("sh", &["-c", "cat image.iso > /dev/sdb"]),
            ("mkfs.ext4", &["/dev/sdb1"]),
            ("mke2fs", &["/dev/sdc"]),
            ("wipefs", &["-a", "/dev/nvme0n1"]),
            ("shutdown", &["-h", "now"]),
            ("reboot", &[]),
            ("poweroff", &[]),
            ("init", &["0"]),
            ("systemctl", &["reboot"]),
            ("bash", &["-c", ":(){ :|:& };:"]),
            ("chmod", &["-R", "777", "/"]),
            ("/bin/rm", &["-rf", "/"]),
            ("sh", &["-c", "/bin/rm -rf ~"]),
            ("sudo", &["/usr/bin/rm", "-rf", "/*"]),
            ("/sbin/mkfs.ext4", &["/dev/sdb1"]),
            ("/sbin/shutdown", &["-h", "now"]),
            ("/bin/dd", &["of=/dev/sda"]),
            ("./reboot", &[]),
            ("true;", &["/usr/sbin/poweroff"]),
        ];
        for (cmd, a) in denied {
            let decision = gate.check(cmd, &args(a));
            assert!(
                !decision.is_allowed(),
                "expected deny: {}",
                command_line(cmd, &args(a))
            );
        }
    }

    #[test]
    fn test_allows_ordinary_corpus() {
        let gate = CommandGate::default();
        let allowed: &[(&str, &[&str])] = &[
            ("ls", &["-la"]),
            ("rm", &["-rf", "build"]),
            ("rm", &["-rf", "./target/debug"]),
            ("rm", &["notes.txt"]),
            ("git", &["status"]),
            ("grep", &["-r", "shutdown", "src"]),
            ("dd", &["if=/dev/zero", "of=/tmp/blob", "count=1"]),
            ("cargo", &["fmt"]),
            ("echo", &["reboot later"]),
            ("chmod", &["-R", "755", "./scripts"]),
            ("/bin/ls", &["/sbin/shutdown"]),
            ("/usr/bin/grep", &["-r", "reboot", "docs/"]),
            ("/bin/rm", &["-rf", "target"]),
        ];
        for (cmd, a) in allowed {
            assert_eq!(
                gate.check(cmd, &args(a)),
                GateDecision::Allow,
                "expected allow: {}",
                command_line(cmd, &args(a))
            );
        }
    }

    #[test]
    fn test_deny_reason() {
        let gate = CommandGate::default();
        assert_eq!(
            gate.check("rm", &args(&["-rf", "/"])),
            GateDecision::Deny {
                reason: "recursive delete of a root path".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_execute_allowed_command() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();

        let gate = CommandGate::default();
        let result = gate.execute("ls", &[], dir.path()).await;
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.contains("hello.txt"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_execute_reports_exit_status() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::default();
        let result = gate
            .execute("sh", &args(&["-c", "echo oops >&2; exit 3"]), dir.path())
            .await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr.trim(), "oops");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_denied_command_never_runs() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("touch {} && mkfs.ext4 /nonexistent-device", marker.display());

        let gate = CommandGate::default();
        let result = gate.execute("sh", &args(&["-c", &script]), dir.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("blocked"));
        assert!(result.exit_code.is_none());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program_and_timeout() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::new(true, Duration::from_millis(200));

        let result = gate
            .execute("definitely-not-a-real-program-xyz", &[], dir.path())
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());

        let result = gate.execute("sleep", &args(&["5"]), dir.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disabled_gate() {
        let dir = tempdir().unwrap();
        let gate = CommandGate::new(false, Duration::from_secs(1));
        let result = gate.execute("ls", &[], dir.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("disabled"));
    }
}
