//! Error types for the Lumen sandbox.

use lumen_reader::ReadError;
use thiserror::Error;

use crate::runtime::RuntimeState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    /// A core form with the wrong shape, caught while inserting checkpoints.
    #[error("Syntax error: {0}")]
    Syntax(String),

    /// A native or internal failure not caught by the program.
    #[error("{0}")]
    Runtime(String),

    /// A value passed to `throw` and not caught, rendered as text.
    #[error("{0}")]
    Exception(String),

    /// The run was stopped by an external halt request.
    #[error("Execution halted")]
    Halted,

    #[error("Runtime is {0} and cannot execute more code")]
    Terminated(RuntimeState),
}

impl Error {
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime(message.into())
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Error::Syntax(message.into())
    }
}
