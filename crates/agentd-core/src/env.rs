//! Working directory resolution and child environment sanitization

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::SessionError;

/// Resolve a client-supplied directory, expanding a leading `~`
///
/// The path must exist and be a directory. It is not canonicalized, so the
/// caller sees the directory it asked for (symlinks included).
pub fn resolve_cwd(raw: &str) -> Result<PathBuf, SessionError> {
    let home = dirs::home_dir();
    resolve_cwd_with_home(raw, home.as_deref())
}

fn resolve_cwd_with_home(raw: &str, home: Option<&Path>) -> Result<PathBuf, SessionError> {
    let raw = raw.trim();
    let path = if raw == "~" || raw.starts_with("~/") {
        let home = home.ok_or_else(|| SessionError::NoHomeDirectory(raw.to_string()))?;
        match raw.strip_prefix("~/") {
            Some(rest) if !rest.is_empty() => home.join(rest),
            _ => home.to_path_buf(),
        }
    } else {
        PathBuf::from(raw)
    };

    if !path.exists() {
        return Err(SessionError::MissingDirectory(path));
    }
    if !path.is_dir() {
        return Err(SessionError::NotADirectory(path));
    }
    Ok(path)
}

/// Build the child environment from `vars` (normally `std::env::vars_os()`)
///
/// Drops every variable named in `strip` (credentials the agent must obtain
/// through its own login flow, nested-session markers) and pins `TERM`.
/// Names and values need not be UTF-8; they are passed through untouched.
pub fn sanitized_env<I>(vars: I, strip: &[String], term: &str) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = vars
        .into_iter()
        .filter(|(key, _)| key != "TERM" && !strip.iter().any(|s| key == s.as_str()))
        .collect();
    env.push(("TERM".into(), term.into()));
    env
}
