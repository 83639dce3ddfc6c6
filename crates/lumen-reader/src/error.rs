/// Error types for the Lumen reader

use thiserror::Error;

use crate::form::Position;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("Unexpected end of input at {at}: unclosed '{open}' opened at {opened}")]
    UnclosedDelimiter { open: char, opened: Position, at: Position },

    #[error("Unexpected end of input at {at}: {context}")]
    UnexpectedEof { context: &'static str, at: Position },

    #[error("Unmatched delimiter '{delimiter}' at {at}")]
    UnmatchedDelimiter { delimiter: char, at: Position },

    #[error("Invalid token '{token}' at {at}")]
    InvalidToken { token: String, at: Position },

    #[error("Invalid number '{token}' at {at}")]
    InvalidNumber { token: String, at: Position },

    #[error("Invalid escape '\\{escape}' in string at {at}")]
    InvalidEscape { escape: String, at: Position },

    #[error("Unsupported character literal '\\{name}' at {at}")]
    InvalidCharacter { name: String, at: Position },

    #[error("Map literal must contain an even number of forms at {at}")]
    OddMap { at: Position },

    #[error("Metadata must be a symbol, keyword, string or map at {at}")]
    InvalidMetadata { at: Position },

    #[error("Unsupported reader macro '#{dispatch}' at {at}")]
    UnsupportedDispatch { dispatch: char, at: Position },

    #[error("Expression too deeply nested at {at} (max depth: {max})")]
    TooDeep { max: usize, at: Position },
}

impl ReadError {
    /// Position the error was detected at.
    pub fn position(&self) -> Position {
        match self {
            ReadError::UnclosedDelimiter { at, .. }
            | ReadError::UnexpectedEof { at, .. }
            | ReadError::UnmatchedDelimiter { at, .. }
            | ReadError::InvalidToken { at, .. }
            | ReadError::InvalidNumber { at, .. }
            | ReadError::InvalidEscape { at, .. }
            | ReadError::InvalidCharacter { at, .. }
            | ReadError::OddMap { at }
            | ReadError::InvalidMetadata { at }
            | ReadError::UnsupportedDispatch { at, .. }
            | ReadError::TooDeep { at, .. } => *at,
        }
    }

    /// True when more input could complete the form.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            ReadError::UnclosedDelimiter { .. } | ReadError::UnexpectedEof { .. }
        )
    }
}
