//! The compilation driver: one compile-and-run cycle per call to [`Driver::run`].

use lumen_eval::{RuntimeOptions, Value};
use serde::Serialize;

use crate::compiler::Compiler;
use crate::module::ModuleResolver;
use crate::service::CompilerService;
use crate::session::{RunController, Session, SessionStrategies};
use crate::vfs::FileSystem;

/// Namespace a buffer without an `ns` form runs in.
pub const DEFAULT_NAMESPACE: &str = "untitled";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub namespace: String,
    pub runtime: RuntimeOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            runtime: RuntimeOptions::default(),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn runtime(mut self, runtime: RuntimeOptions) -> Self {
        self.runtime = runtime;
        self
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    /// The value of the last form, printed readably.
    Success { value: String },
    Error { message: String },
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success { .. })
    }
}

/// Drives compile-and-run cycles against a module resolver.
pub struct Driver<F, C = Compiler> {
    resolver: ModuleResolver<F>,
    compiler: C,
    options: RunOptions,
    controller: RunController,
    globals: Vec<(String, Value)>,
    session: Option<Session>,
}

impl<F: FileSystem> Driver<F> {
    pub fn new(resolver: ModuleResolver<F>) -> Self {
        Self {
            resolver,
            compiler: Compiler::new(),
            options: RunOptions::default(),
            controller: RunController::new(),
            globals: Vec::new(),
            session: None,
        }
    }
}

impl<F: FileSystem, C: CompilerService> Driver<F, C> {
    /// Swap in another compiler service.
    pub fn with_compiler<D: CompilerService>(self, compiler: D) -> Driver<F, D> {
        Driver {
            resolver: self.resolver,
            compiler,
            options: self.options,
            controller: self.controller,
            globals: self.globals,
            session: self.session,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn resolver(&self) -> &ModuleResolver<F> {
        &self.resolver
    }

    /// The session of the last run, kept until the next run replaces it.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// A handle onto whichever session is active. Stays valid across runs.
    pub fn controller(&self) -> RunController {
        self.controller.clone()
    }

    /// Make `value` available to every later run as `(lumen.host/require name)`.
    pub fn provide(&mut self, name: impl Into<String>, value: Value) {
        self.globals.push((name.into(), value));
    }

    /// Compile and run `source` in a fresh session.
    ///
    /// Every failure, a halt included, comes back as [`RunResult::Error`] and
    /// is also appended to the session's output as an error fragment.
    pub async fn run(&mut self, source: &str) -> RunResult {
        self.session = None;
        let session = self.session.insert(Session::new(self.options.runtime.clone()));
        for (name, value) in &self.globals {
            session.sandbox().bridge().provide(name, value.clone());
        }
        self.controller.publish(session.handle());
        tracing::info!("starting run in {}", self.options.namespace);

        let result = {
            let mut strategies = SessionStrategies {
                session: &mut *session,
                resolver: &self.resolver,
            };
            self.compiler
                .compile(source, &self.options.namespace, &mut strategies)
                .await
        };

        match result {
            Ok(value) => {
                session.sandbox_mut().complete();
                tracing::info!("run completed after {} checkpoints", session.sandbox().checkpoints());
                RunResult::Success { value: value.pr_str() }
            }
            Err(e) => {
                session.sandbox_mut().fail();
                let message = e.to_string();
                if e.is_halt() {
                    tracing::info!("run halted after {} checkpoints", session.sandbox().checkpoints());
                } else {
                    tracing::warn!("run failed: {}", message);
                }
                session.output().error(message.clone());
                RunResult::Error { message }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;

    #[test]
    fn test_run_result_json() {
        let ok = RunResult::Success { value: "3".into() };
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#"{"status":"success","value":"3"}"#);

        let err = RunResult::Error {
            message: "Execution halted".into(),
        };
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"status":"error","message":"Execution halted"}"#
        );
    }

    #[tokio::test]
    async fn test_provided_globals_reach_the_program() {
        let mut driver = Driver::new(ModuleResolver::new(MemoryFs::new()));
        driver.provide("config", Value::string("dark"));

        let result = driver.run("(lumen.host/require \"config\")").await;
        assert_eq!(result, RunResult::Success { value: "\"dark\"".into() });
    }

    #[tokio::test]
    async fn test_default_namespace() {
        let mut driver = Driver::new(ModuleResolver::new(MemoryFs::new()));
        assert_eq!(driver.options().namespace, "untitled");

        let result = driver.run("(def answer 42) answer").await;
        assert_eq!(result, RunResult::Success { value: "42".into() });
    }
}
