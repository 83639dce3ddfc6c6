//! Host bridge: the `provide`/`require` namespace registry seen by executed code.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Error;
use crate::value::{Namespace, Value};

/// Namespace holding the native functions and the prelude.
pub const CORE_NS: &str = "lumen.core";

/// Namespace holding the bridge functions themselves.
pub const HOST_NS: &str = "lumen.host";

/// Registry of provided namespaces for one run.
///
/// Owned by a single sandbox, so it lives exactly as long as the run.
#[derive(Default)]
pub struct HostBridge {
    provided: RefCell<HashMap<Rc<str>, Value>>,
}

impl HostBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `name`, replacing any earlier value.
    pub fn provide(&self, name: &str, value: Value) {
        tracing::debug!("provide {}", name);
        self.provided.borrow_mut().insert(name.into(), value);
    }

    /// The value provided under `name`.
    pub fn require(&self, name: &str) -> Result<Value, Error> {
        self.provided
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::runtime(format!("Namespace {} has not been provided", name)))
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.provided.borrow().contains_key(name)
    }

    /// The namespace object for `name`, providing an empty one if needed.
    pub fn namespace(&self, name: &str) -> Rc<Namespace> {
        if let Some(Value::Namespace(ns)) = self.provided.borrow().get(name) {
            return ns.clone();
        }
        let ns = Rc::new(Namespace::new(name));
        self.provide(name, Value::Namespace(ns.clone()));
        ns
    }

    /// Resolve `ns/name`.
    ///
    /// Namespaces expose their vars; a provided map exposes its keyword or
    /// string keys. With `fallback`, names missing from `ns` are looked up in
    /// `lumen.core`.
    pub fn resolve(&self, ns: &str, name: &str, fallback: bool) -> Result<Value, Error> {
        let provided = self.provided.borrow().get(ns).cloned();
        if let Some(value) = provided.as_ref().and_then(|target| member(target, name)) {
            return Ok(value);
        }
        if fallback && ns != CORE_NS {
            if let Some(value) = self.provided.borrow().get(CORE_NS).and_then(|core| member(core, name)) {
                return Ok(value);
            }
        }
        match provided {
            Some(_) => Err(Error::runtime(format!("Use of undeclared Var {}/{}", ns, name))),
            None if fallback => Err(Error::runtime(format!("Unable to resolve symbol: {}", name))),
            None => Err(Error::runtime(format!("Namespace {} has not been provided", ns))),
        }
    }
}

fn member(target: &Value, name: &str) -> Option<Value> {
    match target {
        Value::Namespace(ns) => ns.get(name),
        Value::Map(entries) => Value::map_get(entries, &Value::keyword(name))
            .or_else(|| Value::map_get(entries, &Value::string(name)))
            .cloned(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_fails_until_provided() {
        let bridge = HostBridge::new();
        assert!(bridge.require("app.util").is_err());

        bridge.provide("app.util", Value::Number(1.0));
        assert_eq!(bridge.require("app.util").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_namespace_is_created_once() {
        let bridge = HostBridge::new();
        let a = bridge.namespace("app.core");
        a.define("x", Value::Number(3.0));
        let b = bridge.namespace("app.core");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(bridge.resolve("app.core", "x", false).unwrap(), Value::Number(3.0));
    }

    #[test]
    fn test_resolve_falls_back_to_core() {
        let bridge = HostBridge::new();
        bridge.namespace(CORE_NS).define("inc", Value::Number(0.0));
        bridge.namespace("user");

        assert!(bridge.resolve("user", "inc", true).is_ok());
        assert!(bridge.resolve("user", "inc", false).is_err());
        assert!(bridge.resolve("missing", "inc", false).is_err());
    }

    #[test]
    fn test_provided_map_exposes_keys() {
        let bridge = HostBridge::new();
        bridge.provide(
            "js.widgets",
            Value::map(vec![(Value::keyword("slider"), Value::Number(1.0))]),
        );
        assert_eq!(bridge.resolve("js.widgets", "slider", false).unwrap(), Value::Number(1.0));
        let err = bridge.resolve("js.widgets", "knob", false).unwrap_err();
        assert_eq!(err.to_string(), "Use of undeclared Var js.widgets/knob");
    }
}
