//! The seam between the driver and the compiler.

use std::path::PathBuf;

use lumen_eval::Value;

use crate::error::Result;
use crate::module::{ModuleRecord, ModuleRequest};

/// One unit of compiled code, ready to be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    /// Core-form source text.
    pub source_text: String,
    /// Namespace the unit starts in.
    pub namespace: String,
    /// File the unit was compiled from, if any.
    pub cache_hint: Option<PathBuf>,
}

/// Callbacks the compiler uses to evaluate units and load required modules.
#[allow(async_fn_in_trait)]
pub trait Strategies {
    /// Evaluate a compiled unit, returning its last value.
    async fn eval(&mut self, unit: CompiledUnit) -> Result<Value>;

    /// Find the module for `request`; `None` when no file exists.
    async fn load(&mut self, request: &ModuleRequest) -> Result<Option<ModuleRecord>>;

    /// Record `namespace` as loaded in this run. Returns `false` if it already was.
    fn mark_loaded(&mut self, namespace: &str) -> bool;
}

/// Compiles buffer text and everything it requires, evaluating through `strategies`.
#[allow(async_fn_in_trait)]
pub trait CompilerService {
    async fn compile<S: Strategies>(
        &self,
        source: &str,
        namespace: &str,
        strategies: &mut S,
    ) -> Result<Value>;
}
