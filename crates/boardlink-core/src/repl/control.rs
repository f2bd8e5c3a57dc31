//! REPL control sequences and prompt tracking

use serde::{Deserialize, Serialize};

/// Ctrl-A: enter raw REPL
pub const RAW_REPL: &str = "\r\x01";
/// Ctrl-B: back to the friendly REPL
pub const FRIENDLY_REPL: &str = "\r\x02";
/// Ctrl-C twice: interrupt any running program
pub const INTERRUPT: &str = "\r\x03\x03";
/// Ctrl-D in the friendly REPL: soft reset
pub const SOFT_RESET: &str = "\x04";
/// Ctrl-D in the raw REPL: execute what was sent
pub const EOF: &str = "\x04";
/// Ctrl-D in paste mode: done
pub const EXIT_PASTE: &str = "\r\x04";
/// Ctrl-E: enter paste mode
pub const ENTER_PASTE: &str = "\r\x05";
/// Raw REPL acknowledgement preceding command output
pub const RAW_EXECUTE_OK: &str = "OK";
/// Tail of the banner printed on entering the raw REPL
pub const RAW_BANNER: &str = "CTRL-B to exit\r\n";
pub const FRIENDLY_PROMPT: &str = ">>>";

const RAW_MODE_MARKER: &str = "raw REPL; CTRL-B to exit";
const PASTE_PROMPT: &str = "=== ";

/// Interpreter mode as last observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplState {
    #[default]
    Unknown,
    Friendly,
    Raw,
    Paste,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusyState {
    #[default]
    Unknown,
    Idle,
    Busy,
}

/// Keeps enough recent output to recognise a prompt split across chunks
const TAIL_LEN: usize = 64;

/// Infers the REPL mode from device output
#[derive(Debug, Default)]
pub struct PromptTracker {
    tail: String,
}

impl PromptTracker {
    /// Feed output text, returning the new state when a prompt completes
    pub fn observe(&mut self, text: &str) -> Option<(ReplState, BusyState)> {
        self.tail.push_str(text);
        if self.tail.len() > TAIL_LEN {
            let mut cut = self.tail.len() - TAIL_LEN;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }

        let state = if self.tail.ends_with(">>> ") {
            ReplState::Friendly
        } else if self.tail.ends_with(PASTE_PROMPT) {
            ReplState::Paste
        } else if self.tail.ends_with('>') && self.tail.contains(RAW_MODE_MARKER) {
            ReplState::Raw
        } else {
            return None;
        };
        self.tail.clear();
        Some((state, BusyState::Idle))
    }
}
