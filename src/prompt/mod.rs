//! Interactive-prompt heuristic for PTY output.
//!
//! Decides whether the tail of a command's output looks like the command is
//! sitting at a prompt waiting for a human. The check is intentionally cheap
//! and fuzzy: it only looks at the last few non-blank lines, after stripping
//! ANSI escapes, and fires on any of three signals:
//!
//! 1. the text ends in a prompt-ish character (`?`, `:`, `>`, `]`),
//! 2. a known keyword appears (`password`, `[y/n]`, ...),
//! 3. a TUI selection glyph is on screen (`❯`, `●`, `└`, ...).
//!
//! False positives and negatives are expected. The monitor loop treats a
//! positive as "hand this to someone who can type", never as a hard fact.

use regex::Regex;

/// Characters that commonly terminate a prompt line.
pub const DEFAULT_PROMPT_ENDINGS: &[char] = &['?', ':', '>', ']'];

/// Case-insensitive keywords that indicate a pending question.
pub const DEFAULT_PROMPT_KEYWORDS: &[&str] = &["password", "confirmation", "[y/n]", "enter choice"];

/// Glyphs drawn by TUI pickers and trees (inquirer, gum, clack, ...).
pub const DEFAULT_TUI_GLYPHS: &[char] = &['❯', '◯', '●', '│', '└'];

/// Default number of trailing non-blank lines inspected.
pub const DEFAULT_TAIL_LINES: usize = 5;

/// Which rule matched, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptSignal {
    /// Trimmed text ends with one of the prompt endings.
    TrailingChar(char),
    /// A keyword matched (lowercased form).
    Keyword(String),
    /// A TUI glyph is present.
    TuiGlyph(char),
}

/// A detected prompt: the signal that fired and the tail it fired on.
#[derive(Debug, Clone)]
pub struct DetectedPrompt {
    pub signal: PromptSignal,
    pub tail: String,
}

/// Compiled prompt heuristic.
#[derive(Debug, Clone)]
pub struct PromptHeuristic {
    endings: Vec<char>,
    keywords: Vec<String>,
    glyphs: Vec<char>,
    tail_lines: usize,
}

impl Default for PromptHeuristic {
    fn default() -> Self {
        Self::new(
            DEFAULT_PROMPT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            DEFAULT_TAIL_LINES,
        )
    }
}

impl PromptHeuristic {
    /// Build a heuristic with custom keywords and tail size. Endings and
    /// glyphs keep their defaults.
    pub fn new(keywords: Vec<String>, tail_lines: usize) -> Self {
        Self {
            endings: DEFAULT_PROMPT_ENDINGS.to_vec(),
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            glyphs: DEFAULT_TUI_GLYPHS.to_vec(),
            tail_lines: tail_lines.max(1),
        }
    }

    pub fn tail_lines(&self) -> usize {
        self.tail_lines
    }

    /// Run the rules against already-extracted text.
    ///
    /// Empty (after trimming) text never matches.
    pub fn classify(&self, text: &str) -> Option<PromptSignal> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(last) = trimmed.chars().last() {
            if self.endings.contains(&last) {
                return Some(PromptSignal::TrailingChar(last));
            }
        }

        let lower = trimmed.to_lowercase();
        if let Some(keyword) = self.keywords.iter().find(|k| lower.contains(k.as_str())) {
            return Some(PromptSignal::Keyword(keyword.clone()));
        }

        trimmed
            .chars()
            .find(|c| self.glyphs.contains(c))
            .map(PromptSignal::TuiGlyph)
    }

    /// `true` when `text` looks like an interactive prompt.
    pub fn is_interactive(&self, text: &str) -> bool {
        self.classify(text).is_some()
    }

    /// Inspect the tail of an accumulated output buffer.
    pub fn detect(&self, buffer: &str) -> Option<DetectedPrompt> {
        let tail = recent_text(buffer, self.tail_lines)?;
        self.classify(&tail)
            .map(|signal| DetectedPrompt { signal, tail })
    }
}

/// Join the last `max_lines` lines of `buffer`, after dropping trailing blank
/// lines and ANSI escapes. Returns `None` when nothing non-blank remains.
pub fn recent_text(buffer: &str, max_lines: usize) -> Option<String> {
    // Only the tail matters; avoid stripping a multi-megabyte buffer.
    let window_start = tail_window_start(buffer, max_lines);
    let stripped = strip_ansi(&buffer[window_start..]);

    let mut lines: Vec<&str> = stripped.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.is_empty() {
        return None;
    }

    let start = lines.len().saturating_sub(max_lines);
    Some(lines[start..].join("\n"))
}

/// Byte offset from which the last `max_lines` non-blank lines (plus any
/// trailing blank ones) are guaranteed to be contained.
fn tail_window_start(buffer: &str, max_lines: usize) -> usize {
    let mut non_blank = 0;
    let mut end = buffer.len();
    while let Some(pos) = buffer[..end].rfind('\n') {
        if !buffer[pos + 1..end].trim().is_empty() {
            non_blank += 1;
            if non_blank >= max_lines {
                return pos + 1;
            }
        }
        end = pos;
    }
    0
}

/// Strip ANSI escape sequences from PTY output.
pub fn strip_ansi(input: &str) -> String {
    // CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("ANSI pattern is valid")
    });
    ANSI_RE.replace_all(input, "").to_string()
}
