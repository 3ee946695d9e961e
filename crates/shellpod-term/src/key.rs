use std::fmt;

/// Identity of one terminal tab within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerminalKey {
    pub session_id: String,
    pub terminal_id: String,
}

impl TerminalKey {
    pub fn new(session_id: impl Into<String>, terminal_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            terminal_id: terminal_id.into(),
        }
    }
}

impl fmt::Display for TerminalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.terminal_id)
    }
}
