//! Error types for the Lumen compiler and driver.

use lumen_reader::ReadError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompileError>;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read error in {namespace}: {source}")]
    Read {
        namespace: String,
        #[source]
        source: ReadError,
    },

    #[error("Semantic error in {namespace}: {message}")]
    Semantic { namespace: String, message: String },

    #[error("Module not found: '{module}' required from {from}")]
    ModuleNotFound { module: String, from: String },

    #[error("Module resolution error for {path}: {reason}")]
    ModuleResolution { path: String, reason: String },

    /// Execution of a compiled unit failed or was halted.
    #[error(transparent)]
    Eval(#[from] lumen_eval::Error),
}

impl CompileError {
    pub fn read(namespace: impl Into<String>, source: ReadError) -> Self {
        CompileError::Read {
            namespace: namespace.into(),
            source,
        }
    }

    pub fn semantic(namespace: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError::Semantic {
            namespace: namespace.into(),
            message: message.into(),
        }
    }

    /// Whether this error is the result of a halt request.
    pub fn is_halt(&self) -> bool {
        matches!(self, CompileError::Eval(lumen_eval::Error::Halted))
    }
}
