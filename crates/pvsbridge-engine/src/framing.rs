//! Reply boundary detection
//!
//! The engine has no message framing of its own. A reply is over when the
//! REPL shows its prompt again, so boundary detection is a heuristic kept
//! behind [`ReplyFraming`] and swappable per handle.

use std::fmt::Debug;

use regex::Regex;

/// Top-level prompts: lisp REPL, PVSio evaluator, prover
pub const DEFAULT_PROMPT_PATTERN: &str = r"pvs\(\d+\):|<PVSio>|Rule\?";

/// What the buffered output looks like so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Keep reading
    Incomplete,
    /// A top-level prompt ends the buffer; the reply is `buffer[..body_end]`
    Complete { body_end: usize },
    /// A nested break-level prompt (`[k] pvs(N):`) ends the buffer
    Nested { body_end: usize, level: u32 },
}

/// Strategy deciding where one reply ends
pub trait ReplyFraming: Send + Sync + Debug {
    /// Inspect everything buffered for the current command
    fn scan(&self, buffer: &str) -> FrameStatus;

    /// Text sent to leave a nested error prompt and return to top level
    fn acknowledgement(&self) -> &str {
        ":reset"
    }
}

/// Prompt-matching framing for the PVS REPL
#[derive(Debug, Clone)]
pub struct PromptFraming {
    prompt: Regex,
}

impl PromptFraming {
    /// Framing with the standard PVS prompts
    pub fn new() -> Self {
        Self::with_pattern(DEFAULT_PROMPT_PATTERN).expect("default prompt pattern is valid")
    }

    /// Framing with a custom top-level prompt pattern
    pub fn with_pattern(top_level: &str) -> Result<Self, regex::Error> {
        let prompt = Regex::new(&format!(
            r"(?:\A|\n)(?P<prompt>(?:\[(?P<level>\d+)[a-z]?\][ \t]*)?(?:{top_level}))[ \t]*\z"
        ))?;
        Ok(Self { prompt })
    }
}

impl Default for PromptFraming {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyFraming for PromptFraming {
    fn scan(&self, buffer: &str) -> FrameStatus {
        let Some(caps) = self.prompt.captures(buffer) else {
            return FrameStatus::Incomplete;
        };
        let Some(prompt) = caps.name("prompt") else {
            return FrameStatus::Incomplete;
        };
        let body_end = prompt.start();
        match caps.name("level").and_then(|m| m.as_str().parse().ok()) {
            Some(level) => FrameStatus::Nested { body_end, level },
            None => FrameStatus::Complete { body_end },
        }
    }
}
