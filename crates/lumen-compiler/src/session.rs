//! Per-run sessions and the controller the display talks to.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lumen_eval::{transform, HaltHandle, OutputSink, RuntimeOptions, RuntimeState, Sandbox, Value};

use crate::error::Result;
use crate::module::{ModuleRecord, ModuleRequest, ModuleResolver};
use crate::service::{CompiledUnit, Strategies};
use crate::vfs::FileSystem;

/// State that lives for exactly one run.
pub struct Session {
    loaded: HashSet<String>,
    sandbox: Sandbox,
}

impl Session {
    pub fn new(options: RuntimeOptions) -> Self {
        Self {
            loaded: HashSet::new(),
            sandbox: Sandbox::new(OutputSink::new(), options),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn sandbox_mut(&mut self) -> &mut Sandbox {
        &mut self.sandbox
    }

    pub fn output(&self) -> &OutputSink {
        self.sandbox.output()
    }

    /// Namespaces loaded so far in this run. Macro loads are keyed as
    /// `name$macros`.
    pub fn loaded(&self) -> &HashSet<String> {
        &self.loaded
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            halt: self.sandbox.halt_handle(),
            output: self.sandbox.output().clone(),
        }
    }
}

/// Strategies that evaluate into a session's sandbox and load through a resolver.
pub struct SessionStrategies<'a, F> {
    pub session: &'a mut Session,
    pub resolver: &'a ModuleResolver<F>,
}

impl<F: FileSystem> Strategies for SessionStrategies<'_, F> {
    async fn eval(&mut self, unit: CompiledUnit) -> Result<Value> {
        let program = transform(&unit.source_text, &unit.namespace)?;
        if let Some(path) = &unit.cache_hint {
            tracing::debug!("executing {} from {}", unit.namespace, path.display());
        }
        Ok(self.session.sandbox.execute(&program).await?)
    }

    async fn load(&mut self, request: &ModuleRequest) -> Result<Option<ModuleRecord>> {
        self.resolver.resolve(request).await
    }

    fn mark_loaded(&mut self, namespace: &str) -> bool {
        self.session.loaded.insert(namespace.to_string())
    }
}

/// What the display keeps of a session: its halt handle and output.
#[derive(Clone)]
pub struct SessionHandle {
    pub halt: HaltHandle,
    pub output: OutputSink,
}

/// Shared view of the active session, usable from any thread.
///
/// The display reads output from it and the halt button stops through it.
/// Publishing a new session replaces the previous one.
#[derive(Clone, Default)]
pub struct RunController {
    current: Arc<Mutex<Option<SessionHandle>>>,
}

impl RunController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, handle: SessionHandle) {
        *self.lock() = Some(handle);
    }

    pub fn current(&self) -> Option<SessionHandle> {
        self.lock().clone()
    }

    /// Halt the active session. Returns `false` if no run has started yet.
    pub fn halt(&self) -> bool {
        match self.current() {
            Some(handle) => {
                handle.halt.halt();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> Option<RuntimeState> {
        self.lock().as_ref().map(|handle| handle.halt.state())
    }

    pub fn output(&self) -> Option<OutputSink> {
        self.lock().as_ref().map(|handle| handle.output.clone())
    }

    /// Output of the active session joined by newlines.
    pub fn contents(&self) -> String {
        self.output().map(|output| output.contents()).unwrap_or_default()
    }

    /// Wait for the active session to settle.
    ///
    /// A session that never started executing only settles once it is
    /// dropped, which happens when the next run replaces it.
    pub async fn wait_settled(&self) -> Option<RuntimeState> {
        let mut handle = self.current()?;
        Some(handle.halt.wait_settled().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_controller_is_shareable() {
        assert_send_sync::<RunController>();
    }

    #[test]
    fn test_empty_controller() {
        let controller = RunController::new();
        assert!(!controller.halt());
        assert_eq!(controller.state(), None);
        assert_eq!(controller.contents(), "");
    }

    #[tokio::test]
    async fn test_strategies_track_loaded_namespaces() {
        let mut session = Session::new(RuntimeOptions::default());
        let resolver = ModuleResolver::new(MemoryFs::new().with_file("app/util.cljs", "(ns app.util)"));
        let mut strategies = SessionStrategies {
            session: &mut session,
            resolver: &resolver,
        };

        assert!(strategies.mark_loaded("app.util"));
        assert!(!strategies.mark_loaded("app.util"));
        let record = strategies
            .load(&ModuleRequest::for_namespace("app.util", false))
            .await
            .unwrap();
        assert!(record.is_some());

        let value = strategies
            .eval(CompiledUnit {
                source_text: "(ns* app.util {} {}) (println \"hi\") 42".into(),
                namespace: "app.util".into(),
                cache_hint: None,
            })
            .await
            .unwrap();
        assert_eq!(value, Value::Number(42.0));
        assert_eq!(session.output().contents(), "hi");
        assert!(session.loaded().contains("app.util"));
    }
}
