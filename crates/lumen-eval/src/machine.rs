//! The interpreter loop.
//!
//! Evaluation never recurses on the host stack: pending work lives in an
//! explicit stack of [`Frame`]s and the loop alternates between evaluating a
//! code node, delivering a value to the top frame, and unwinding a thrown
//! value to the nearest `try`. This keeps deep programs from overflowing the
//! host and gives every checkpoint a chance to suspend the whole run.

use std::cell::RefCell;
use std::rc::Rc;

use lumen_reader::CollKind;
use tokio_util::sync::CancellationToken;

use crate::bridge::HostBridge;
use crate::builtins::{self, NativeCtx};
use crate::code::{Block, Catch, Code, Names};
use crate::env::Env;
use crate::error::Error;
use crate::output::OutputSink;
use crate::value::{Closure, NativeKind, Value};

/// Who raised a value being unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// The program called `throw`.
    Program,
    /// A native function or the interpreter itself failed.
    Runtime,
}

enum Control {
    Eval(Rc<Code>, Env),
    Return(Value),
    Throw(Value, Origin),
}

/// How a `try` body finished, replayed after its `finally` runs.
enum Completion {
    Return(Value),
    Throw(Value, Origin),
}

enum Frame {
    If {
        then: Rc<Code>,
        otherwise: Rc<Code>,
        env: Env,
    },
    Do {
        body: Block,
        next: usize,
        env: Env,
    },
    Bind {
        names: Names,
        inits: Block,
        next: usize,
        scope: Env,
        outer: Env,
        body: Rc<Code>,
        looping: bool,
    },
    LoopHead {
        names: Names,
        body: Rc<Code>,
        env: Env,
    },
    FnHead {
        closure: Rc<Closure>,
        arity: usize,
    },
    Recur {
        args: Block,
        values: Vec<Value>,
        env: Env,
    },
    Def {
        ns: Rc<str>,
        name: Rc<str>,
    },
    Callee {
        args: Block,
        env: Env,
    },
    Args {
        callee: Value,
        args: Block,
        values: Vec<Value>,
        env: Env,
    },
    Collect {
        kind: CollKind,
        items: Block,
        values: Vec<Value>,
        env: Env,
    },
    Try {
        catch: Option<Catch>,
        finally: Option<Rc<Code>>,
        env: Env,
    },
    Finally {
        pending: Completion,
    },
    Throw,
    Swap {
        atom: Rc<RefCell<Value>>,
    },
}

/// Limits and hooks for one execution.
pub(crate) struct Machine<'a> {
    bridge: &'a HostBridge,
    output: &'a OutputSink,
    token: &'a CancellationToken,
    yield_interval: u64,
    max_stack_depth: usize,
    /// Checkpoints passed so far, shared across executions of one sandbox.
    checkpoints: &'a mut u64,
    frames: Vec<Frame>,
    depth: usize,
}

impl<'a> Machine<'a> {
    pub fn new(
        bridge: &'a HostBridge,
        output: &'a OutputSink,
        token: &'a CancellationToken,
        yield_interval: u64,
        max_stack_depth: usize,
        checkpoints: &'a mut u64,
    ) -> Self {
        Self {
            bridge,
            output,
            token,
            yield_interval: yield_interval.max(1),
            max_stack_depth,
            checkpoints,
            frames: Vec::new(),
            depth: 0,
        }
    }

    /// Run `code` to completion, halt, or an uncaught error.
    pub async fn run(&mut self, code: Rc<Code>, env: Env) -> Result<Value, Error> {
        let mut control = Control::Eval(code, env);
        loop {
            control = match control {
                Control::Eval(code, env) => {
                    if let Code::Checkpoint(inner) = &*code {
                        self.checkpoint().await?;
                        Control::Eval(inner.clone(), env)
                    } else {
                        self.eval(&code, env)
                    }
                }
                Control::Return(value) => match self.frames.pop() {
                    Some(frame) => self.deliver(frame, value),
                    None => return Ok(value),
                },
                Control::Throw(value, origin) => self.unwind(value, origin)?,
            };
        }
    }

    async fn checkpoint(&mut self) -> Result<(), Error> {
        *self.checkpoints += 1;
        if self.token.is_cancelled() {
            return Err(Error::Halted);
        }
        if *self.checkpoints % self.yield_interval == 0 {
            tokio::task::yield_now().await;
            if self.token.is_cancelled() {
                return Err(Error::Halted);
            }
        }
        Ok(())
    }

    fn eval(&mut self, code: &Code, env: Env) -> Control {
        match code {
            Code::Const(value) => Control::Return(value.clone()),
            Code::Local(name) => match env.lookup(name) {
                Some(value) => Control::Return(value),
                None => fail(format!("Unable to resolve symbol: {}", name)),
            },
            Code::Global { ns, name, fallback } => match self.bridge.resolve(ns, name, *fallback) {
                Ok(value) => Control::Return(value),
                Err(e) => fail(e.to_string()),
            },
            Code::Namespace(name) => Control::Return(Value::Namespace(self.bridge.namespace(name))),
            Code::Def { ns, name, value } => {
                self.frames.push(Frame::Def {
                    ns: ns.clone(),
                    name: name.clone(),
                });
                Control::Eval(value.clone(), env)
            }
            Code::If { test, then, otherwise } => {
                self.frames.push(Frame::If {
                    then: then.clone(),
                    otherwise: otherwise.clone(),
                    env: env.clone(),
                });
                Control::Eval(test.clone(), env)
            }
            Code::Do(body) => self.sequence(body.clone(), 0, env),
            Code::Let { names, inits, body } | Code::Loop { names, inits, body } => {
                let looping = matches!(code, Code::Loop { .. });
                let scope = env.extend();
                if inits.is_empty() {
                    return self.enter_body(names.clone(), body.clone(), scope, env, looping);
                }
                self.frames.push(Frame::Bind {
                    names: names.clone(),
                    inits: inits.clone(),
                    next: 0,
                    scope: scope.clone(),
                    outer: env,
                    body: body.clone(),
                    looping,
                });
                Control::Eval(inits[0].clone(), scope)
            }
            Code::Recur(args) => {
                if args.is_empty() {
                    return self.recur(Vec::new());
                }
                self.frames.push(Frame::Recur {
                    args: args.clone(),
                    values: Vec::with_capacity(args.len()),
                    env: env.clone(),
                });
                Control::Eval(args[0].clone(), env)
            }
            Code::Fn(lambda) => Control::Return(Value::Fn(Rc::new(Closure {
                lambda: lambda.clone(),
                env,
            }))),
            Code::Call { callee, args } => {
                self.frames.push(Frame::Callee {
                    args: args.clone(),
                    env: env.clone(),
                });
                Control::Eval(callee.clone(), env)
            }
            Code::Collection { kind, items } => {
                if items.is_empty() {
                    return Control::Return(Value::collection(*kind, Vec::new()));
                }
                self.frames.push(Frame::Collect {
                    kind: *kind,
                    items: items.clone(),
                    values: Vec::with_capacity(items.len()),
                    env: env.clone(),
                });
                Control::Eval(items[0].clone(), env)
            }
            Code::Try { body, catch, finally } => {
                self.frames.push(Frame::Try {
                    catch: catch.clone(),
                    finally: finally.clone(),
                    env: env.clone(),
                });
                Control::Eval(body.clone(), env)
            }
            Code::Throw(value) => {
                self.frames.push(Frame::Throw);
                Control::Eval(value.clone(), env)
            }
            // Polled in `run`.
            Code::Checkpoint(inner) => Control::Eval(inner.clone(), env),
        }
    }

    /// Evaluate `body[next..]`, dropping the frame before the last form.
    fn sequence(&mut self, body: Block, next: usize, env: Env) -> Control {
        match body.len() - next {
            0 => Control::Return(Value::Nil),
            1 => Control::Eval(body[next].clone(), env),
            _ => {
                let code = body[next].clone();
                self.frames.push(Frame::Do {
                    body,
                    next: next + 1,
                    env: env.clone(),
                });
                Control::Eval(code, env)
            }
        }
    }

    fn enter_body(&mut self, names: Names, body: Rc<Code>, scope: Env, outer: Env, looping: bool) -> Control {
        if looping {
            self.frames.push(Frame::LoopHead {
                names,
                body: body.clone(),
                env: outer,
            });
        }
        Control::Eval(body, scope)
    }

    /// Hand `value` to `frame`.
    fn deliver(&mut self, frame: Frame, value: Value) -> Control {
        match frame {
            Frame::If { then, otherwise, env } => {
                let branch = if value.is_truthy() { then } else { otherwise };
                Control::Eval(branch, env)
            }
            Frame::Do { body, next, env } => self.sequence(body, next, env),
            Frame::Bind {
                names,
                inits,
                next,
                scope,
                outer,
                body,
                looping,
            } => {
                scope.define(names[next].clone(), value);
                if next + 1 == inits.len() {
                    return self.enter_body(names, body, scope, outer, looping);
                }
                let init = inits[next + 1].clone();
                self.frames.push(Frame::Bind {
                    names,
                    inits,
                    next: next + 1,
                    scope: scope.clone(),
                    outer,
                    body,
                    looping,
                });
                Control::Eval(init, scope)
            }
            Frame::LoopHead { .. } => Control::Return(value),
            Frame::FnHead { .. } => {
                self.depth -= 1;
                Control::Return(value)
            }
            Frame::Recur { args, mut values, env } => {
                values.push(value);
                if values.len() == args.len() {
                    return self.recur(values);
                }
                let arg = args[values.len()].clone();
                self.frames.push(Frame::Recur {
                    args,
                    values,
                    env: env.clone(),
                });
                Control::Eval(arg, env)
            }
            Frame::Def { ns, name } => {
                self.bridge.namespace(&ns).define(&name, value);
                Control::Return(Value::Var(format!("{}/{}", ns, name).into()))
            }
            Frame::Callee { args, env } => {
                if args.is_empty() {
                    return self.apply(value, Vec::new());
                }
                let arg = args[0].clone();
                self.frames.push(Frame::Args {
                    callee: value,
                    values: Vec::with_capacity(args.len()),
                    args,
                    env: env.clone(),
                });
                Control::Eval(arg, env)
            }
            Frame::Args {
                callee,
                args,
                mut values,
                env,
            } => {
                values.push(value);
                if values.len() == args.len() {
                    return self.apply(callee, values);
                }
                let arg = args[values.len()].clone();
                self.frames.push(Frame::Args {
                    callee,
                    args,
                    values,
                    env: env.clone(),
                });
                Control::Eval(arg, env)
            }
            Frame::Collect {
                kind,
                items,
                mut values,
                env,
            } => {
                values.push(value);
                if values.len() == items.len() {
                    return Control::Return(Value::collection(kind, values));
                }
                let item = items[values.len()].clone();
                self.frames.push(Frame::Collect {
                    kind,
                    items,
                    values,
                    env: env.clone(),
                });
                Control::Eval(item, env)
            }
            Frame::Try { finally, env, .. } => match finally {
                Some(cleanup) => {
                    self.frames.push(Frame::Finally {
                        pending: Completion::Return(value),
                    });
                    Control::Eval(cleanup, env)
                }
                None => Control::Return(value),
            },
            Frame::Finally { pending } => match pending {
                Completion::Return(value) => Control::Return(value),
                Completion::Throw(value, origin) => Control::Throw(value, origin),
            },
            Frame::Throw => Control::Throw(value, Origin::Program),
            Frame::Swap { atom } => {
                *atom.borrow_mut() = value.clone();
                Control::Return(value)
            }
        }
    }

    /// Pop frames until a `try` takes the thrown value.
    fn unwind(&mut self, value: Value, origin: Origin) -> Result<Control, Error> {
        while let Some(frame) = self.frames.pop() {
            match frame {
                Frame::FnHead { .. } => self.depth -= 1,
                Frame::Try {
                    catch: Some(catch),
                    finally,
                    env,
                } => {
                    let scope = env.extend();
                    scope.define(catch.name.clone(), value);
                    self.frames.push(Frame::Try {
                        catch: None,
                        finally,
                        env,
                    });
                    return Ok(Control::Eval(catch.body, scope));
                }
                Frame::Try {
                    catch: None,
                    finally: Some(cleanup),
                    env,
                } => {
                    self.frames.push(Frame::Finally {
                        pending: Completion::Throw(value, origin),
                    });
                    return Ok(Control::Eval(cleanup, env));
                }
                _ => {}
            }
        }

        let message = match &value {
            Value::Error(e) => e.message.clone(),
            other => other.pr_str(),
        };
        tracing::debug!("uncaught {:?} error: {}", origin, message);
        Err(match origin {
            Origin::Program => Error::Exception(message),
            Origin::Runtime => Error::Runtime(message),
        })
    }

    /// Rebind the nearest loop or function head with `values` and re-enter it.
    fn recur(&mut self, values: Vec<Value>) -> Control {
        while let Some(frame) = self.frames.pop() {
            match frame {
                Frame::LoopHead { names, body, env } => {
                    let scope = env.extend();
                    for (name, value) in names.iter().zip(values) {
                        scope.define(name.clone(), value);
                    }
                    self.frames.push(Frame::LoopHead {
                        names,
                        body: body.clone(),
                        env,
                    });
                    return Control::Eval(body, scope);
                }
                Frame::FnHead { closure, arity } => {
                    let (scope, body) = bind_arity(&closure, arity, values, true);
                    self.frames.push(Frame::FnHead { closure, arity });
                    return Control::Eval(body, scope);
                }
                _ => {}
            }
        }
        fail("recur outside of a loop or function")
    }

    fn apply(&mut self, callee: Value, mut args: Vec<Value>) -> Control {
        match &callee {
            Value::Fn(closure) => {
                let closure = closure.clone();
                let Some(arity) = closure.lambda.select(args.len()) else {
                    return fail(format!(
                        "Wrong number of args ({}) passed to {}",
                        args.len(),
                        closure.lambda.display_name()
                    ));
                };
                if self.depth >= self.max_stack_depth {
                    return fail("Maximum call stack size exceeded");
                }
                let (scope, body) = bind_arity(&closure, arity, args, false);
                self.depth += 1;
                self.frames.push(Frame::FnHead { closure, arity });
                Control::Eval(body, scope)
            }
            Value::Native(native) => match native.kind {
                NativeKind::Fn(f) => {
                    let mut ctx = NativeCtx {
                        output: self.output,
                        bridge: self.bridge,
                    };
                    match f(&mut ctx, args) {
                        Ok(value) => Control::Return(value),
                        Err(e) => fail(e.to_string()),
                    }
                }
                NativeKind::Apply => {
                    let Some(last) = args.pop() else {
                        return fail("Wrong number of args (0) passed to apply");
                    };
                    if args.is_empty() {
                        return fail("Wrong number of args (1) passed to apply");
                    }
                    let Some(spread) = last.seq_items() else {
                        return fail(format!("apply expects a collection, got {}", last.type_name()));
                    };
                    let f = args.remove(0);
                    args.extend(spread);
                    self.apply(f, args)
                }
                NativeKind::Swap => {
                    if args.len() < 2 {
                        return fail(format!("Wrong number of args ({}) passed to swap!", args.len()));
                    }
                    let Value::Atom(atom) = &args[0] else {
                        return fail("swap! expects an atom");
                    };
                    let atom = atom.clone();
                    args.remove(0);
                    let f = args.remove(0);
                    let current = atom.borrow().clone();
                    args.insert(0, current);
                    self.frames.push(Frame::Swap { atom });
                    self.apply(f, args)
                }
            },
            Value::Keyword(_) => match args.as_slice() {
                [coll] => Control::Return(builtins::lookup(coll, &callee).unwrap_or_default()),
                [coll, default] => Control::Return(builtins::lookup(coll, &callee).unwrap_or_else(|| default.clone())),
                _ => fail(format!("Wrong number of args ({}) passed to {}", args.len(), callee.pr_str())),
            },
            Value::Map(_) | Value::Set(_) | Value::Vector(_) => match args.as_slice() {
                [key] => Control::Return(builtins::lookup(&callee, key).unwrap_or_default()),
                [key, default] => Control::Return(builtins::lookup(&callee, key).unwrap_or_else(|| default.clone())),
                _ => fail(format!("Wrong number of args ({}) passed to {}", args.len(), callee.type_name())),
            },
            other => fail(format!("{} is not a function", other.pr_str())),
        }
    }
}

/// Scope for running `arity` of `closure` with `values`.
///
/// With `from_recur` the rest parameter receives its value as is instead of
/// collecting the surplus arguments.
fn bind_arity(closure: &Rc<Closure>, arity: usize, mut values: Vec<Value>, from_recur: bool) -> (Env, Rc<Code>) {
    let lambda = &closure.lambda;
    let arity = &lambda.arities[arity];
    let scope = closure.env.extend();
    if let Some(name) = &lambda.name {
        scope.define(name.clone(), Value::Fn(closure.clone()));
    }

    let surplus = values.split_off(arity.params.len().min(values.len()));
    for (name, value) in arity.params.iter().zip(values) {
        scope.define(name.clone(), value);
    }
    if let Some(rest) = &arity.rest {
        let rest_value = if from_recur {
            surplus.into_iter().next().unwrap_or_default()
        } else if surplus.is_empty() {
            Value::Nil
        } else {
            Value::list(surplus)
        };
        scope.define(rest.clone(), rest_value);
    }
    (scope, arity.body.clone())
}

fn fail(message: impl Into<String>) -> Control {
    Control::Throw(Value::error(message, Value::Nil), Origin::Runtime)
}
