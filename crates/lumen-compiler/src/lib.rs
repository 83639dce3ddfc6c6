//! Lumen compile-and-run driver.
//!
//! A [`Driver`] takes buffer text through one full cycle: the [`Compiler`]
//! reads it, loads required modules through the [`ModuleResolver`], expands
//! macros and hands each unit to a fresh [`Sandbox`](lumen_eval::Sandbox).
//! The outcome comes back as a single [`RunResult`], while a
//! [`RunController`] lets other tasks read output and halt the active run.

pub mod analyzer;
pub mod buffer;
pub mod compiler;
pub mod driver;
pub mod error;
pub mod module;
pub mod service;
pub mod session;
pub mod vfs;

pub use analyzer::{Analyzer, NsDecl, Require, MACROS};
pub use buffer::{list_files, Buffer};
pub use compiler::Compiler;
pub use driver::{Driver, RunOptions, RunResult, DEFAULT_NAMESPACE};
pub use error::{CompileError, Result};
pub use module::{Extensions, ModuleKind, ModuleRecord, ModuleRequest, ModuleResolver};
pub use service::{CompiledUnit, CompilerService, Strategies};
pub use session::{RunController, Session, SessionHandle, SessionStrategies};
pub use vfs::{DiskFs, FileSystem, MemoryFs};
