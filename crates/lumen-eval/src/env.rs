//! Lexical environments for local bindings.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

struct Scope {
    vars: RefCell<Vec<(Rc<str>, Value)>>,
    parent: Option<Env>,
}

/// A chain of scopes. Cloning shares the chain.
#[derive(Clone)]
pub struct Env(Rc<Scope>);

impl Env {
    /// An empty top-level environment.
    pub fn root() -> Self {
        Env(Rc::new(Scope {
            vars: RefCell::new(Vec::new()),
            parent: None,
        }))
    }

    /// A new child scope of this one.
    pub fn extend(&self) -> Self {
        Env(Rc::new(Scope {
            vars: RefCell::new(Vec::new()),
            parent: Some(self.clone()),
        }))
    }

    /// Bind `name` in this scope, shadowing any previous binding here.
    pub fn define(&self, name: Rc<str>, value: Value) {
        let mut vars = self.0.vars.borrow_mut();
        match vars.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => vars.push((name, value)),
        }
    }

    /// Find the innermost binding of `name`.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(env) = scope {
            if let Some((_, value)) = env.0.vars.borrow().iter().find(|(n, _)| &**n == name) {
                return Some(value.clone());
            }
            scope = env.0.parent.as_ref();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_scope_shadows_outer() {
        let root = Env::root();
        root.define("x".into(), Value::Number(1.0));

        let inner = root.extend();
        assert_eq!(inner.lookup("x"), Some(Value::Number(1.0)));

        inner.define("x".into(), Value::Number(2.0));
        assert_eq!(inner.lookup("x"), Some(Value::Number(2.0)));
        assert_eq!(root.lookup("x"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_missing_binding() {
        assert_eq!(Env::root().extend().lookup("y"), None);
    }
}
