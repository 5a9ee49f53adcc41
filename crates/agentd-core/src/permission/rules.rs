//! Permission prompt patterns
//!
//! An ordered list of rules. The earliest prompt in the text wins; when two
//! rules match on the same line the first rule decides the tool and action.
//! Running a command is checked before file writes, writes before reads, and
//! the generic yes/no cues come last so a specific rule always wins over them.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// How the agent expects an answer to be typed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// `(y/n)` style: type the letter and Enter
    YesNo,
    /// Numbered menu with the cursor on "1. Yes"
    Menu,
}

impl PromptStyle {
    /// Keystrokes that answer the prompt
    pub fn keystrokes(self, approved: bool) -> &'static [u8] {
        match (self, approved) {
            (PromptStyle::YesNo, true) => b"y\r",
            (PromptStyle::YesNo, false) => b"n\r",
            // Enter on the highlighted "Yes"
            (PromptStyle::Menu, true) => b"\r",
            // Down twice to "No", then Enter
            (PromptStyle::Menu, false) => b"\x1b[B\x1b[B\r",
        }
    }

    /// Menus are phrased "Do you want to ...?"; everything else takes a letter
    fn infer(prompt: &str) -> Self {
        if YES_NO_CUE.is_match(prompt) {
            PromptStyle::YesNo
        } else if DO_YOU_WANT.is_match(prompt) {
            PromptStyle::Menu
        } else {
            PromptStyle::YesNo
        }
    }
}

/// A recognized prompt within a piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMatch {
    pub tool: String,
    pub action: String,
    pub style: PromptStyle,
    /// Byte range of the match in the scanned text
    pub start: usize,
    pub end: usize,
}

/// Something that can spot a permission prompt in plain text
pub trait PromptDetector: Send + Sync {
    fn detect(&self, text: &str) -> Option<PromptMatch>;
}

struct Rule {
    name: &'static str,
    pattern: &'static Lazy<Regex>,
    /// Fixed tool name, or `None` to take it from the `tool` capture
    tool: Option<&'static str>,
}

static YES_NO_CUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[(\[]\s*(?:y|yes)\s*/\s*(?:n|no)\s*[)\]]").unwrap());

static DO_YOU_WANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bdo you want to\b").unwrap());

/// "Bash command\n  <cmd>\n ... Do you want to proceed?"
static COMMAND_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)\bbash command[^\S\n]*[│|]?[^\S\n]*\n[\s│|]*(?P<action>[^\n│]+?)[\s│|]*\n.*?do you want to proceed\?",
    )
    .unwrap()
});

/// "Allow running `npm test`? (y/n)", "Do you want to run: ls -la?"
static COMMAND_ASK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:allow|approve|permit|ok to|permission to|want to)\s+(?:run|running|execute|executing)\s+(?:the\s+)?(?:(?:bash|shell)\s+)?(?:command\s*)?:?\s*[`'"]?(?P<action>[^`'"\n?]+?)[`'"]?[^\S\n]*(?:\?|[(\[]\s*y\s*/\s*n\s*[)\]])"#,
    )
    .unwrap()
});

/// "Allow write to config.json? (y/n)", "Do you want to make this edit to main.rs?"
static WRITE_ASK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:allow|approve|permit|ok to|permission to|want to)\s+(?:write|writing|create|creating|edit|editing|modify|modifying|overwrite|overwriting|make this edit|delete|deleting)\s+(?:to\s+)?(?:the\s+)?(?:file\s+)?[`'"]?(?P<action>[^\s`'"?]+)[`'"]?[^\S\n]*(?:\?|[(\[]\s*y\s*/\s*n\s*[)\]])"#,
    )
    .unwrap()
});

/// "Allow read of /etc/hosts?", "Do you want to read notes.md?"
static READ_ASK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:allow|approve|permit|ok to|permission to|want to)\s+(?:read|reading|open|opening|view|viewing|access|accessing)\s+(?:of\s+|from\s+)?(?:the\s+)?(?:file\s+)?[`'"]?(?P<action>[^\s`'"?]+)[`'"]?[^\S\n]*(?:\?|[(\[]\s*y\s*/\s*n\s*[)\]])"#,
    )
    .unwrap()
});

/// A whole line carrying a bare confirmation cue
static CONFIRM_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?P<action>[^\n]*(?:[(\[]\s*(?:y|yes)\s*/\s*(?:n|no)\s*[)\]]|do you want to proceed\?)[^\n]*)",
    )
    .unwrap()
});

/// `<tool_use name="Bash">ls</tool_use>`
static TOOL_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<tool_use\s+name\s*=\s*"(?P<tool>[^"]+)"\s*>(?P<action>.*?)</tool_use>"#)
        .unwrap()
});

/// `⏺ Bash(npm test)` style call marker preceding a bare confirmation
static CALL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"⏺\s*(?P<tool>[A-Za-z]+)\((?P<args>[^)\n]*)\)").unwrap());

fn action_capture(caps: &Captures<'_>) -> String {
    caps.name("action")
        .map(|m| trim_frame(m.as_str()).to_string())
        .unwrap_or_default()
}

/// Strip whitespace and the box-drawing border agents draw around prompts
fn trim_frame(text: &str) -> &str {
    text.trim_matches(|c: char| c.is_whitespace() || c == '│' || c == '|')
}

/// The full line(s) around a byte range
fn enclosing_lines(text: &str, start: usize, end: usize) -> &str {
    let line_start = text[..start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = text[end..].find('\n').map(|i| end + i).unwrap_or(text.len());
    &text[line_start..line_end]
}

static RULES: [Rule; 6] = [
    Rule {
        name: "command-block",
        pattern: &COMMAND_BLOCK,
        tool: Some("bash"),
    },
    Rule {
        name: "command",
        pattern: &COMMAND_ASK,
        tool: Some("bash"),
    },
    Rule {
        name: "write",
        pattern: &WRITE_ASK,
        tool: Some("write"),
    },
    Rule {
        name: "read",
        pattern: &READ_ASK,
        tool: Some("read"),
    },
    Rule {
        name: "confirm",
        pattern: &CONFIRM_LINE,
        tool: Some("confirm"),
    },
    Rule {
        name: "tool-marker",
        pattern: &TOOL_MARKER,
        tool: None,
    },
];

/// Built-in detector for interactive coding agents
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleSet;

impl RuleSet {
    pub fn new() -> Self {
        Self
    }
}

impl RuleSet {
    fn build(rule: &Rule, text: &str, caps: &Captures<'_>, start: usize, end: usize) -> PromptMatch {
        let mut tool = match rule.tool {
            Some(tool) => tool.to_string(),
            None => caps
                .name("tool")
                .map(|m| m.as_str().trim().to_lowercase())
                .unwrap_or_default(),
        };
        let mut action = action_capture(caps);

        // A bare "proceed?" reads better with the call it is about
        if rule.name == "confirm" {
            if let Some(call) = CALL_MARKER.captures_iter(&text[..start]).last() {
                tool = call["tool"].to_lowercase();
                action = call["args"].trim().to_string();
            }
        }

        let style = match rule.name {
            "command-block" => PromptStyle::Menu,
            _ => PromptStyle::infer(enclosing_lines(text, start, end)),
        };

        PromptMatch {
            tool,
            action,
            style,
            start,
            end,
        }
    }
}

impl PromptDetector for RuleSet {
    /// The prompt whose line ends first; on the same line, the earlier rule
    fn detect(&self, text: &str) -> Option<PromptMatch> {
        let mut best: Option<(usize, PromptMatch)> = None;

        for rule in RULES.iter() {
            let Some(caps) = rule.pattern.captures(text) else {
                continue;
            };
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let line_end = text[whole.end()..]
                .find('\n')
                .map(|i| whole.end() + i)
                .unwrap_or(text.len());
            if best.as_ref().is_some_and(|(best_end, _)| *best_end <= line_end) {
                continue;
            }
            let found = Self::build(rule, text, &caps, whole.start(), whole.end());
            best = Some((line_end, found));
        }

        best.map(|(_, found)| found)
    }
}
