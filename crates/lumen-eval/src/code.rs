//! Executable code: core forms after checkpoint insertion.

use std::rc::Rc;

use lumen_reader::CollKind;

use crate::value::Value;

/// A sequence of code nodes, shared between frames.
pub type Block = Rc<[Rc<Code>]>;

/// Names bound by `let*`, `loop*` or a function arity.
pub type Names = Rc<[Rc<str>]>;

#[derive(Debug)]
pub enum Code {
    Const(Value),
    Local(Rc<str>),
    /// A var in a namespace. Unqualified symbols fall back to `lumen.core`.
    Global {
        ns: Rc<str>,
        name: Rc<str>,
        fallback: bool,
    },
    /// Provide (or fetch) the namespace object for the unit being run.
    Namespace(Rc<str>),
    Def {
        ns: Rc<str>,
        name: Rc<str>,
        value: Rc<Code>,
    },
    If {
        test: Rc<Code>,
        then: Rc<Code>,
        otherwise: Rc<Code>,
    },
    Do(Block),
    Let {
        names: Names,
        inits: Block,
        body: Rc<Code>,
    },
    Loop {
        names: Names,
        inits: Block,
        body: Rc<Code>,
    },
    Recur(Block),
    Fn(Rc<Lambda>),
    Call {
        callee: Rc<Code>,
        args: Block,
    },
    Collection {
        kind: CollKind,
        items: Block,
    },
    Try {
        body: Rc<Code>,
        catch: Option<Catch>,
        finally: Option<Rc<Code>>,
    },
    Throw(Rc<Code>),
    /// Poll for halt (and maybe yield) before running the inner code.
    Checkpoint(Rc<Code>),
}

#[derive(Debug, Clone)]
pub struct Catch {
    pub name: Rc<str>,
    pub body: Rc<Code>,
}

/// A function literal with one or more arities.
#[derive(Debug)]
pub struct Lambda {
    pub name: Option<Rc<str>>,
    /// Namespace the function was defined in.
    pub ns: Rc<str>,
    pub arities: Vec<Arity>,
}

#[derive(Debug)]
pub struct Arity {
    pub params: Names,
    pub rest: Option<Rc<str>>,
    pub body: Rc<Code>,
}

impl Arity {
    /// Number of values `recur` must supply.
    pub fn recur_width(&self) -> usize {
        self.params.len() + usize::from(self.rest.is_some())
    }
}

impl Lambda {
    /// Pick the arity for a call with `argc` arguments.
    ///
    /// An exact fixed arity wins over a variadic one.
    pub fn select(&self, argc: usize) -> Option<usize> {
        self.arities
            .iter()
            .position(|a| a.rest.is_none() && a.params.len() == argc)
            .or_else(|| {
                self.arities
                    .iter()
                    .position(|a| a.rest.is_some() && argc >= a.params.len())
            })
    }

    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{}/{}", self.ns, name),
            None => format!("{}/fn", self.ns),
        }
    }
}

/// A transformed compilation unit ready to execute.
#[derive(Debug)]
pub struct Program {
    pub namespace: Rc<str>,
    pub body: Rc<Code>,
    /// Number of checkpoints inserted by the transform.
    pub checkpoints: usize,
}
