use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The grammar's entry transition is not in the table.
    MissingEntry,
    /// A primitive named a transition that is not in the table.
    InvalidTransition,
    /// A transition tried to consume the current character at end-of-stream.
    UnexpectedEnd,
    /// The call stack had not unwound to the sentinel frame at finish.
    UnterminatedStack,
    /// A mutating call on an engine that already finished.
    Spent,
    /// A domain error raised by a transition.
    Grammar,
}

/// A parse error decorated with the position of the character being
/// processed when it was raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrammarError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: usize,
    pub col: usize,
    pub pos: usize,
}

impl GrammarError {
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        line: usize,
        col: usize,
        pos: usize,
    ) -> Self {
        GrammarError {
            kind,
            message: message.into(),
            line,
            col,
            pos,
        }
    }

    pub fn missing_entry(entry: &str) -> Self {
        GrammarError::new(
            ErrorKind::MissingEntry,
            format!("grammar does not define entry transition {entry:?}"),
            0,
            0,
            0,
        )
    }

    pub fn invalid_transition(name: &str, line: usize, col: usize, pos: usize) -> Self {
        GrammarError::new(
            ErrorKind::InvalidTransition,
            format!("unknown transition target {name:?}"),
            line,
            col,
            pos,
        )
    }

    pub fn unexpected_end(line: usize, col: usize, pos: usize) -> Self {
        GrammarError::new(
            ErrorKind::UnexpectedEnd,
            "unexpected end of input",
            line,
            col,
            pos,
        )
    }

    pub fn unterminated_stack(depth: usize, line: usize, col: usize, pos: usize) -> Self {
        GrammarError::new(
            ErrorKind::UnterminatedStack,
            format!("{depth} call frame(s) never returned before end of input"),
            line,
            col,
            pos,
        )
    }

    pub fn spent(line: usize, col: usize, pos: usize) -> Self {
        GrammarError::new(ErrorKind::Spent, "engine already finished", line, col, pos)
    }

    pub fn grammar(message: impl Into<String>, line: usize, col: usize, pos: usize) -> Self {
        GrammarError::new(ErrorKind::Grammar, message, line, col, pos)
    }
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at line {} col {} (pos {})",
            self.message, self.line, self.col, self.pos
        )
    }
}

impl std::error::Error for GrammarError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_downcast() {
        let err = GrammarError::unexpected_end(1, 0, 4);
        assert_eq!(err.to_string(), "unexpected end of input at line 1 col 0 (pos 4)");
        let any: anyhow::Error = err.into();
        let back = any.downcast_ref::<GrammarError>().unwrap();
        assert_eq!(back.kind, ErrorKind::UnexpectedEnd);
        assert_eq!((back.line, back.col, back.pos), (1, 0, 4));
    }
}
