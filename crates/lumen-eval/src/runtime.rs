//! The sandboxed runtime.
//!
//! A [`Sandbox`] executes transformed programs against its own host bridge
//! and output sink. It can be halted from any task through a [`HaltHandle`];
//! the interpreter notices the request at its next checkpoint.

use std::fmt;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::bridge::{HostBridge, CORE_NS};
use crate::builtins;
use crate::code::Program;
use crate::env::Env;
use crate::error::Error;
use crate::machine::Machine;
use crate::output::OutputSink;
use crate::transform::transform;
use crate::value::Value;

/// Core functions written in the language itself, loaded before the first program.
const PRELUDE: &str = include_str!("prelude.cljs");

/// Lifecycle of a sandbox.
///
/// `Completed`, `Errored` and `Halted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeState {
    Idle,
    Running,
    Completed,
    Errored,
    Halted,
}

impl RuntimeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeState::Completed | RuntimeState::Errored | RuntimeState::Halted
        )
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeState::Idle => "idle",
            RuntimeState::Running => "running",
            RuntimeState::Completed => "completed",
            RuntimeState::Errored => "errored",
            RuntimeState::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Options for a sandbox.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Checkpoints between yields to the host scheduler.
    pub yield_interval: u64,
    /// Maximum depth of nested function calls.
    pub max_stack_depth: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            yield_interval: 1000,
            max_stack_depth: 10_000,
        }
    }
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the yield interval. Zero is treated as one.
    pub fn yield_interval(mut self, checkpoints: u64) -> Self {
        self.yield_interval = checkpoints.max(1);
        self
    }

    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }
}

/// Halts a sandbox and observes its state from another task.
#[derive(Clone)]
pub struct HaltHandle {
    token: CancellationToken,
    state: watch::Receiver<RuntimeState>,
}

impl HaltHandle {
    /// Request a halt. Takes effect at the next checkpoint; a no-op once the
    /// sandbox has finished.
    pub fn halt(&self) {
        if !self.state().is_terminal() {
            tracing::info!("halt requested");
        }
        self.token.cancel();
    }

    pub fn is_halt_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Wait until the sandbox reaches a terminal state.
    ///
    /// Returns the last state seen if the sandbox is dropped first.
    pub async fn wait_settled(&mut self) -> RuntimeState {
        let settled = self.state.wait_for(|s| s.is_terminal()).await.ok().map(|state| *state);
        settled.unwrap_or_else(|| *self.state.borrow())
    }
}

/// An isolated execution environment for one run.
pub struct Sandbox {
    state: watch::Sender<RuntimeState>,
    token: CancellationToken,
    bridge: HostBridge,
    output: OutputSink,
    options: RuntimeOptions,
    checkpoints: u64,
    prelude_loaded: bool,
}

impl Sandbox {
    /// Create a sandbox writing to `output`, with the core natives installed.
    pub fn new(output: OutputSink, options: RuntimeOptions) -> Self {
        let bridge = HostBridge::new();
        builtins::install(&bridge);
        let (state, _) = watch::channel(RuntimeState::Idle);
        Self {
            state,
            token: CancellationToken::new(),
            bridge,
            output,
            options,
            checkpoints: 0,
            prelude_loaded: false,
        }
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    pub fn bridge(&self) -> &HostBridge {
        &self.bridge
    }

    /// Checkpoints passed across every execution so far.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints
    }

    pub fn halt_handle(&self) -> HaltHandle {
        HaltHandle {
            token: self.token.clone(),
            state: self.state.subscribe(),
        }
    }

    fn transition(&self, next: RuntimeState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!("runtime {} -> {}", previous, next);
        }
    }

    /// Execute a transformed program.
    ///
    /// The first call moves the sandbox to `Running`. A halt leaves it
    /// `Halted` and any other failure leaves it `Errored`; call
    /// [`Sandbox::complete`] once the last program of the run has finished.
    pub async fn execute(&mut self, program: &Program) -> Result<Value, Error> {
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::Terminated(state));
        }
        self.transition(RuntimeState::Running);

        if self.token.is_cancelled() {
            self.transition(RuntimeState::Halted);
            return Err(Error::Halted);
        }

        let result = self.execute_in_place(program).await;
        match &result {
            Err(Error::Halted) => self.transition(RuntimeState::Halted),
            Err(e) => {
                tracing::debug!("execution of {} failed: {}", program.namespace, e);
                self.transition(RuntimeState::Errored);
            }
            Ok(_) => {}
        }
        result
    }

    async fn execute_in_place(&mut self, program: &Program) -> Result<Value, Error> {
        if !self.prelude_loaded {
            let prelude = transform(PRELUDE, CORE_NS)?;
            self.run(&prelude).await?;
            self.prelude_loaded = true;
        }
        self.run(program).await
    }

    async fn run(&mut self, program: &Program) -> Result<Value, Error> {
        let mut machine = Machine::new(
            &self.bridge,
            &self.output,
            &self.token,
            self.options.yield_interval,
            self.options.max_stack_depth,
            &mut self.checkpoints,
        );
        machine.run(program.body.clone(), Env::root()).await
    }

    /// Transform `source` in `namespace` and execute it.
    ///
    /// Source that fails to read or lower is never executed, so the state is
    /// left untouched.
    pub async fn eval_str(&mut self, source: &str, namespace: &str) -> Result<Value, Error> {
        let program = transform(source, namespace)?;
        self.execute(&program).await
    }

    /// Mark a running sandbox `Completed`.
    pub fn complete(&mut self) {
        if self.state() == RuntimeState::Running {
            self.transition(RuntimeState::Completed);
        }
    }

    /// Mark a running sandbox `Errored`.
    pub fn fail(&mut self) {
        if self.state() == RuntimeState::Running {
            self.transition(RuntimeState::Errored);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new(OutputSink::new(), RuntimeOptions::default())
    }

    #[tokio::test]
    async fn test_state_moves_to_running_then_completed() {
        let mut sandbox = sandbox();
        assert_eq!(sandbox.state(), RuntimeState::Idle);

        let value = sandbox.eval_str("(+ 1 2)", "user").await.unwrap();
        assert_eq!(value, Value::Number(3.0));
        assert_eq!(sandbox.state(), RuntimeState::Running);

        sandbox.complete();
        assert_eq!(sandbox.state(), RuntimeState::Completed);
    }

    #[tokio::test]
    async fn test_terminal_sandbox_refuses_work() {
        let mut sandbox = sandbox();
        sandbox.eval_str("1", "user").await.unwrap();
        sandbox.complete();

        let err = sandbox.eval_str("2", "user").await.unwrap_err();
        assert_eq!(err, Error::Terminated(RuntimeState::Completed));
        assert_eq!(err.to_string(), "Runtime is completed and cannot execute more code");
    }

    #[tokio::test]
    async fn test_uncaught_error_marks_errored() {
        let mut sandbox = sandbox();
        let err = sandbox.eval_str("(throw (ex-info \"bad\" {}))", "user").await.unwrap_err();
        assert_eq!(err, Error::Exception("bad".into()));
        assert_eq!(sandbox.state(), RuntimeState::Errored);
    }

    #[tokio::test]
    async fn test_read_error_leaves_sandbox_idle() {
        let mut sandbox = sandbox();
        let err = sandbox.eval_str("(println \"never\"", "user").await.unwrap_err();
        assert!(matches!(err, Error::Read(_)));
        assert_eq!(sandbox.state(), RuntimeState::Idle);
        assert!(sandbox.output().is_empty());

        sandbox.fail();
        assert_eq!(sandbox.state(), RuntimeState::Idle);
    }

    #[tokio::test]
    async fn test_halt_before_execute() {
        let mut sandbox = sandbox();
        let handle = sandbox.halt_handle();
        handle.halt();

        let err = sandbox.eval_str("(loop* [] (recur))", "user").await.unwrap_err();
        assert_eq!(err, Error::Halted);
        assert_eq!(handle.state(), RuntimeState::Halted);
    }

    #[tokio::test]
    async fn test_halt_after_completion_is_ignored() {
        let mut sandbox = sandbox();
        let handle = sandbox.halt_handle();
        sandbox.eval_str("1", "user").await.unwrap();
        sandbox.complete();

        handle.halt();
        assert_eq!(sandbox.state(), RuntimeState::Completed);
    }
}
