//! Permission Engine - turns raw agent output into permission requests
//!
//! Output is stripped of terminal escapes and appended to a bounded buffer.
//! Each feed scans only text that has not been classified yet, so one prompt
//! produces one request no matter how the bytes were chunked. After a match,
//! the rest of its line counts as classified too, even if that line is still
//! arriving.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use super::buffer::{tail_chars, OutputBuffer};
use super::pending::PendingPermission;
use super::rules::{PromptDetector, PromptStyle, RuleSet};

/// CSI, OSC and two-byte escapes
static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\x1b\[(?P<params>[0-?]*)[ -/]*(?P<final>[@-~])|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]",
    )
    .unwrap()
});

/// A trailing escape sequence that has not been terminated yet
static PARTIAL_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b(?:\[[0-?]*[ -/]*|\][^\x07\x1b]*(?:\x1b)?)?$").unwrap()
});

/// Remove terminal control sequences, keeping the text a user would read
///
/// Cursor-forward moves become a space so words drawn with them stay apart;
/// carriage returns become line breaks.
pub fn strip_ansi(text: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(text, |caps: &Captures<'_>| {
        match caps.name("final").map(|m| m.as_str()) {
            Some("C") => " ",
            _ => "",
        }
    });
    stripped.replace("\r\n", "\n").replace('\r', "\n")
}

/// A detected prompt, ready to be sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPrompt {
    pub request_id: String,
    pub tool: String,
    pub action: String,
    /// Trailing output up to the prompt
    pub full_text: String,
    pub style: PromptStyle,
    pub detected_at: i64,
}

impl PermissionPrompt {
    pub fn to_pending(&self) -> PendingPermission {
        PendingPermission {
            request_id: self.request_id.clone(),
            tool: self.tool.clone(),
            action: self.action.clone(),
            context: self.full_text.clone(),
            style: self.style,
            detected_at: self.detected_at,
        }
    }
}

/// Per-session prompt scanner
pub struct PermissionEngine {
    buffer: OutputBuffer,
    detector: Box<dyn PromptDetector>,
    context_chars: usize,
    /// Absolute offset up to which output has been looked at
    classified: usize,
    /// The last match's line has not ended yet
    line_open: bool,
    /// Unterminated escape sequence held back from the previous chunk
    escape_carry: String,
    next_request: u64,
}

impl PermissionEngine {
    pub fn new(buffer_chars: usize, context_chars: usize) -> Self {
        Self::with_detector(buffer_chars, context_chars, Box::new(RuleSet::new()))
    }

    pub fn with_detector(
        buffer_chars: usize,
        context_chars: usize,
        detector: Box<dyn PromptDetector>,
    ) -> Self {
        Self {
            buffer: OutputBuffer::new(buffer_chars),
            detector,
            context_chars,
            classified: 0,
            line_open: false,
            escape_carry: String::new(),
            next_request: 1,
        }
    }

    /// Scan a chunk of output; returns the prompts it completed
    pub fn feed(&mut self, chunk: &str) -> Vec<PermissionPrompt> {
        let clean = self.clean(chunk);
        if clean.is_empty() {
            return Vec::new();
        }

        if self.line_open {
            let end = self.buffer.end_offset();
            match clean.find('\n') {
                Some(i) => {
                    self.classified = end + clean[..=i].chars().count();
                    self.line_open = false;
                }
                None => self.classified = end + clean.chars().count(),
            }
        }

        self.buffer.push(&clean);

        let mut prompts = Vec::new();
        while !self.line_open {
            let Some(prompt) = self.scan() else {
                break;
            };
            prompts.push(prompt);
        }
        prompts
    }

    /// Look for one prompt past the classified offset
    fn scan(&mut self) -> Option<PermissionPrompt> {
        let from = self.buffer.byte_index(self.classified.max(self.buffer.start_offset()));
        let text = self.buffer.text();
        let found = self.detector.detect(&text[from..])?;

        let match_end = from + found.end;
        let (line_end, open) = match text[match_end..].find('\n') {
            Some(i) => (match_end + i + 1, false),
            None => (text.len(), true),
        };
        let context = tail_chars(&text[..line_end], self.context_chars).to_string();

        self.classified = self.buffer.offset_of(line_end);
        self.line_open = open;

        let request_id = format!("r{}", self.next_request);
        self.next_request += 1;

        debug!(
            request_id = %request_id,
            tool = %found.tool,
            action = %found.action,
            "Permission prompt detected"
        );

        Some(PermissionPrompt {
            request_id,
            tool: found.tool,
            action: found.action,
            full_text: context,
            style: found.style,
            detected_at: Utc::now().timestamp_millis(),
        })
    }

    /// Strip escapes, holding back one that is split across chunks
    fn clean(&mut self, chunk: &str) -> String {
        let mut raw = std::mem::take(&mut self.escape_carry);
        raw.push_str(chunk);

        if let Some(partial) = PARTIAL_ESCAPE.find(&raw) {
            // A complete sequence can also end the chunk; only hold real leftovers
            if !ANSI_ESCAPE.is_match(partial.as_str()) {
                self.escape_carry = raw[partial.start()..].to_string();
                raw.truncate(partial.start());
            }
        }

        strip_ansi(&raw)
    }

    pub fn buffered_chars(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::rules::PromptMatch;

    fn engine() -> PermissionEngine {
        PermissionEngine::new(2000, 500)
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1;32mAllow\x1b[0m write"), "Allow write");
        assert_eq!(strip_ansi("Do\x1b[1Cyou"), "Do you");
        assert_eq!(strip_ansi("\x1b]0;title\x07line\r\nnext\rover"), "line\nnext\nover");
    }

    #[test]
    fn test_single_prompt() {
        let mut engine = engine();
        let prompts = engine.feed("Working...\nAllow write to config.json? (y/n) ");
        assert_eq!(prompts.len(), 1);
        let p = &prompts[0];
        assert_eq!(p.request_id, "r1");
        assert_eq!(p.tool, "write");
        assert_eq!(p.action, "config.json");
        assert!(p.full_text.contains("Allow write to config.json?"));
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut engine = engine();
        assert!(engine.feed("Allow wri").is_empty());
        assert!(engine.feed("te to conf").is_empty());
        let prompts = engine.feed("ig.json? (y/n)\n");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].action, "config.json");
    }

    #[test]
    fn test_prompt_is_reported_once() {
        let mut engine = engine();
        assert_eq!(engine.feed("Allow write to a.txt?").len(), 1);
        // The rest of the same line must not fire the generic yes/no rule
        assert!(engine.feed(" (y/n)").is_empty());
        assert!(engine.feed(" \n").is_empty());
        assert!(engine.feed("still thinking\n").is_empty());

        let prompts = engine.feed("Allow write to b.txt? (y/n)\n");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].request_id, "r2");
        assert_eq!(prompts[0].action, "b.txt");
    }

    #[test]
    fn test_two_prompts_in_one_chunk() {
        let mut engine = engine();
        let prompts = engine.feed("Allow read of notes.md?\nAllow write to out.md?\n");
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].tool, "read");
        assert_eq!(prompts[1].tool, "write");
        assert_eq!(prompts[1].request_id, "r2");
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut engine = engine();
        assert!(engine.feed("Allow \x1b[3").is_empty());
        let prompts = engine.feed("8;5;12mwrite to x.rs\x1b[0m? (y/n)\n");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].action, "x.rs");
    }

    #[test]
    fn test_buffer_stays_bounded() {
        let mut engine = PermissionEngine::new(2000, 500);
        for _ in 0..1000 {
            engine.feed("compiling crate with a long log line that never asks anything\n");
            assert!(engine.buffered_chars() <= 2000);
        }
        let prompts = engine.feed("Allow write to late.txt?\n");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].request_id, "r1");
        assert!(prompts[0].full_text.chars().count() <= 500);
    }

    struct Always;

    impl PromptDetector for Always {
        fn detect(&self, text: &str) -> Option<PromptMatch> {
            let end = text.find('!')? + 1;
            Some(PromptMatch {
                tool: "custom".to_string(),
                action: text[..end].trim().to_string(),
                style: PromptStyle::Menu,
                start: 0,
                end,
            })
        }
    }

    #[test]
    fn test_custom_detector() {
        let mut engine = PermissionEngine::with_detector(100, 50, Box::new(Always));
        let prompts = engine.feed("go!\nagain!\n");
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[1].action, "again!");
        assert_eq!(prompts[1].style, PromptStyle::Menu);
    }
}
