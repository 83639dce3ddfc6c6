//! Checkpoint transform.
//!
//! Lowers the core forms of a compiled unit into [`Code`] and inserts a
//! [`Code::Checkpoint`] before every call and at the head of every loop
//! iteration and function body. Those are the only places the sandbox polls
//! for halt requests or yields to the host scheduler.
//!
//! Core forms understood here:
//!
//! ```text
//! (ns* name {alias ns ...} {referred-name ns ...})
//! (def name value?)   (if test then else?)   (do body...)
//! (fn* name? [params & rest] body...)   (fn* name? ([params] body...)+)
//! (let* [name init ...] body...)   (loop* [name init ...] body...)   (recur args...)
//! (quote form)   (throw value)   (try body... (catch type name handler...) (finally cleanup...))
//! ```

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use lumen_reader::{read_all, Atom, CollKind, Form, FormKind};

use crate::bridge::{CORE_NS, HOST_NS};
use crate::code::{Arity, Block, Catch, Code, Lambda, Program};
use crate::error::Error;
use crate::value::Value;

/// Whether a form is in tail position of its loop or function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Yes,
    No,
}

/// Read `source` and lower it with checkpoints, starting in `namespace`.
pub fn transform(source: &str, namespace: &str) -> Result<Program, Error> {
    let forms = read_all(source)?;
    transform_forms(&forms, namespace)
}

/// Lower already-read forms with checkpoints.
pub fn transform_forms(forms: &[Form], namespace: &str) -> Result<Program, Error> {
    let mut lowerer = Lowerer::new(namespace);
    let mut body = Vec::with_capacity(forms.len());
    for form in forms {
        body.push(lowerer.lower(form, Tail::No)?);
    }
    let body = match body.len() {
        0 => Rc::new(Code::Const(Value::Nil)),
        1 => body.remove(0),
        _ => Rc::new(Code::Do(body.into())),
    };
    Ok(Program {
        namespace: namespace.into(),
        body,
        checkpoints: lowerer.checkpoints,
    })
}

struct Lowerer {
    ns: Rc<str>,
    aliases: HashMap<String, String>,
    refers: HashMap<String, String>,
    scopes: Vec<HashSet<Rc<str>>>,
    /// Width of the innermost recur target, `None` where recur is not allowed.
    recur_targets: Vec<Option<usize>>,
    checkpoints: usize,
}

impl Lowerer {
    fn new(namespace: &str) -> Self {
        Self {
            ns: namespace.into(),
            aliases: HashMap::new(),
            refers: HashMap::new(),
            scopes: Vec::new(),
            recur_targets: Vec::new(),
            checkpoints: 0,
        }
    }

    fn checkpoint(&mut self, code: Code) -> Rc<Code> {
        self.checkpoints += 1;
        Rc::new(Code::Checkpoint(Rc::new(code)))
    }

    fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().rev().any(|scope| scope.contains(name))
    }

    fn lower(&mut self, form: &Form, tail: Tail) -> Result<Rc<Code>, Error> {
        match &form.kind {
            FormKind::Atom(Atom::Symbol(name)) => Ok(Rc::new(self.resolve_symbol(name))),
            FormKind::Atom(_) => Ok(Rc::new(Code::Const(Value::from_form(form)))),
            FormKind::Collection(CollKind::List, items) => self.lower_list(form, items, tail),
            FormKind::Collection(kind, items) => self.lower_literal(*kind, items),
        }
    }

    fn resolve_symbol(&self, name: &str) -> Code {
        if self.is_local(name) {
            return Code::Local(name.into());
        }
        if let Some((ns, var)) = name.split_once('/').filter(|(ns, var)| !ns.is_empty() && !var.is_empty()) {
            let ns = self.aliases.get(ns).map(String::as_str).unwrap_or(ns);
            return Code::Global {
                ns: ns.into(),
                name: var.into(),
                fallback: false,
            };
        }
        if let Some(ns) = self.refers.get(name) {
            return Code::Global {
                ns: ns.as_str().into(),
                name: name.into(),
                fallback: false,
            };
        }
        Code::Global {
            ns: self.ns.clone(),
            name: name.into(),
            fallback: true,
        }
    }

    fn lower_literal(&mut self, kind: CollKind, items: &[Form]) -> Result<Rc<Code>, Error> {
        let codes = self.lower_each(items)?;
        if codes.iter().all(|c| matches!(**c, Code::Const(_))) {
            let values = codes
                .iter()
                .filter_map(|c| match &**c {
                    Code::Const(v) => Some(v.clone()),
                    _ => None,
                })
                .collect();
            return Ok(Rc::new(Code::Const(Value::collection(kind, values))));
        }
        Ok(Rc::new(Code::Collection {
            kind,
            items: codes.into(),
        }))
    }

    fn lower_each(&mut self, forms: &[Form]) -> Result<Vec<Rc<Code>>, Error> {
        forms.iter().map(|f| self.lower(f, Tail::No)).collect()
    }

    /// Lower a body; the last form inherits `tail`.
    fn lower_body(&mut self, forms: &[Form], tail: Tail) -> Result<Rc<Code>, Error> {
        let mut codes = Vec::with_capacity(forms.len());
        for (i, form) in forms.iter().enumerate() {
            let position = if i + 1 == forms.len() { tail } else { Tail::No };
            codes.push(self.lower(form, position)?);
        }
        Ok(match codes.len() {
            0 => Rc::new(Code::Const(Value::Nil)),
            1 => codes.remove(0),
            _ => Rc::new(Code::Do(codes.into())),
        })
    }

    fn lower_list(&mut self, form: &Form, items: &[Form], tail: Tail) -> Result<Rc<Code>, Error> {
        let Some(head) = items.first() else {
            return Ok(Rc::new(Code::Const(Value::list(Vec::new()))));
        };
        let args = &items[1..];
        let special = head.as_symbol().filter(|name| !self.is_local(name));

        match special {
            Some("quote") => {
                let [quoted] = args else {
                    return Err(shape_error("quote", "expects exactly one form", form));
                };
                Ok(Rc::new(Code::Const(Value::from_form(quoted))))
            }
            Some("if") => self.lower_if(form, args, tail),
            Some("do") => self.lower_body(args, tail),
            Some("def") => self.lower_def(form, args),
            Some("fn*") => self.lower_fn(form, args),
            Some("let*") => self.lower_let(form, args, tail, false),
            Some("loop*") => self.lower_let(form, args, tail, true),
            Some("recur") => self.lower_recur(form, args, tail),
            Some("throw") => {
                let [value] = args else {
                    return Err(shape_error("throw", "expects exactly one form", form));
                };
                Ok(Rc::new(Code::Throw(self.lower(value, Tail::No)?)))
            }
            Some("try") => self.lower_try(form, args),
            Some("ns*") => self.lower_ns(form, args),
            Some(name @ ("catch" | "finally")) => {
                Err(shape_error(name, "is only allowed at the end of a try", form))
            }
            _ => {
                let callee = self.lower(head, Tail::No)?;
                let args: Block = self.lower_each(args)?.into();
                Ok(self.checkpoint(Code::Call { callee, args }))
            }
        }
    }

    fn lower_if(&mut self, form: &Form, args: &[Form], tail: Tail) -> Result<Rc<Code>, Error> {
        let (test, then, otherwise) = match args {
            [test, then] => (test, then, None),
            [test, then, otherwise] => (test, then, Some(otherwise)),
            _ => return Err(shape_error("if", "expects a test, a then branch and an optional else branch", form)),
        };
        let test = self.lower(test, Tail::No)?;
        let then = self.lower(then, tail)?;
        let otherwise = match otherwise {
            Some(f) => self.lower(f, tail)?,
            None => Rc::new(Code::Const(Value::Nil)),
        };
        Ok(Rc::new(Code::If { test, then, otherwise }))
    }

    fn lower_def(&mut self, form: &Form, args: &[Form]) -> Result<Rc<Code>, Error> {
        let (name, value) = match args {
            [name] => (name, None),
            [name, value] => (name, Some(value)),
            _ => return Err(shape_error("def", "expects a name and an optional value", form)),
        };
        let name = name
            .as_symbol()
            .filter(|n| !n.contains('/'))
            .ok_or_else(|| shape_error("def", "name must be an unqualified symbol", form))?;

        // Nested function bodies get their own recur targets.
        self.recur_targets.push(None);
        let value = match value {
            Some(v) => self.lower(v, Tail::No),
            None => Ok(Rc::new(Code::Const(Value::Nil))),
        };
        self.recur_targets.pop();

        Ok(Rc::new(Code::Def {
            ns: self.ns.clone(),
            name: name.into(),
            value: value?,
        }))
    }

    fn lower_fn(&mut self, form: &Form, args: &[Form]) -> Result<Rc<Code>, Error> {
        let (name, rest) = match args.first().and_then(Form::as_symbol) {
            Some(name) => (Some(Rc::<str>::from(name)), &args[1..]),
            None => (None, args),
        };

        let clauses: Vec<(&Form, &[Form])> = match rest.first() {
            Some(params) if params.as_vector().is_some() => vec![(params, &rest[1..])],
            Some(_) => rest
                .iter()
                .map(|clause| match clause.as_list() {
                    Some([params, body @ ..]) if params.as_vector().is_some() => Ok((params, body)),
                    _ => Err(shape_error("fn*", "arity clauses must look like ([params] body...)", form)),
                })
                .collect::<Result<_, _>>()?,
            None => return Err(shape_error("fn*", "expects a parameter vector", form)),
        };

        let mut arities = Vec::with_capacity(clauses.len());
        for (params, body) in clauses {
            let (params, rest_param) = parse_params(params, form)?;

            let mut scope: HashSet<Rc<str>> = params.iter().cloned().collect();
            scope.extend(rest_param.clone());
            scope.extend(name.clone());
            let width = params.len() + usize::from(rest_param.is_some());

            self.scopes.push(scope);
            self.recur_targets.push(Some(width));
            let lowered = self.lower_body(body, Tail::Yes);
            self.recur_targets.pop();
            self.scopes.pop();

            let body = match Rc::try_unwrap(lowered?) {
                Ok(code) => self.checkpoint(code),
                Err(shared) => self.checkpoint(Code::Do(vec![shared].into())),
            };
            arities.push(Arity {
                params: params.into(),
                rest: rest_param,
                body,
            });
        }

        let fixed: Vec<usize> = arities.iter().filter(|a| a.rest.is_none()).map(|a| a.params.len()).collect();
        let mut seen = HashSet::new();
        if fixed.iter().any(|n| !seen.insert(*n)) {
            return Err(shape_error("fn*", "cannot have two arities with the same number of parameters", form));
        }
        if arities.iter().filter(|a| a.rest.is_some()).count() > 1 {
            return Err(shape_error("fn*", "cannot have more than one variadic arity", form));
        }

        Ok(Rc::new(Code::Fn(Rc::new(Lambda {
            name,
            ns: self.ns.clone(),
            arities,
        }))))
    }

    fn lower_let(&mut self, form: &Form, args: &[Form], tail: Tail, looping: bool) -> Result<Rc<Code>, Error> {
        let special = if looping { "loop*" } else { "let*" };
        let Some((bindings, body)) = args.split_first() else {
            return Err(shape_error(special, "expects a binding vector", form));
        };
        let bindings = bindings
            .as_vector()
            .filter(|b| b.len() % 2 == 0)
            .ok_or_else(|| shape_error(special, "bindings must be a vector of name/value pairs", form))?;

        self.scopes.push(HashSet::new());
        let result = self.lower_bindings(special, form, bindings);
        let lowered = result.and_then(|(names, inits)| {
            if looping {
                self.recur_targets.push(Some(names.len()));
                let body = self.lower_body(body, Tail::Yes);
                self.recur_targets.pop();
                let body = self.checkpoint(Code::Do(vec![body?].into()));
                Ok(Code::Loop {
                    names: names.into(),
                    inits: inits.into(),
                    body,
                })
            } else {
                Ok(Code::Let {
                    names: names.into(),
                    inits: inits.into(),
                    body: self.lower_body(body, tail)?,
                })
            }
        });
        self.scopes.pop();
        Ok(Rc::new(lowered?))
    }

    fn lower_bindings(
        &mut self,
        special: &str,
        form: &Form,
        bindings: &[Form],
    ) -> Result<(Vec<Rc<str>>, Vec<Rc<Code>>), Error> {
        let mut names = Vec::with_capacity(bindings.len() / 2);
        let mut inits = Vec::with_capacity(bindings.len() / 2);
        for pair in bindings.chunks(2) {
            let name: Rc<str> = pair[0]
                .as_symbol()
                .filter(|n| !n.contains('/'))
                .ok_or_else(|| shape_error(special, "binding names must be unqualified symbols", form))?
                .into();
            inits.push(self.lower(&pair[1], Tail::No)?);
            if let Some(scope) = self.scopes.last_mut() {
                scope.insert(name.clone());
            }
            names.push(name);
        }
        Ok((names, inits))
    }

    fn lower_recur(&mut self, form: &Form, args: &[Form], tail: Tail) -> Result<Rc<Code>, Error> {
        let target = self.recur_targets.last().copied().flatten();
        match (tail, target) {
            (Tail::Yes, Some(width)) if width == args.len() => {
                let args: Block = self.lower_each(args)?.into();
                Ok(Rc::new(Code::Recur(args)))
            }
            (Tail::Yes, Some(width)) => Err(Error::syntax(format!(
                "recur expects {} arguments, got {} at {}",
                width,
                args.len(),
                form.span.start
            ))),
            _ => Err(Error::syntax(format!(
                "Can only recur from tail position of a loop or function at {}",
                form.span.start
            ))),
        }
    }

    fn lower_try(&mut self, form: &Form, args: &[Form]) -> Result<Rc<Code>, Error> {
        let clause_start = args
            .iter()
            .position(|f| matches!(f.head_symbol(), Some("catch" | "finally")))
            .unwrap_or(args.len());
        let (body, clauses) = args.split_at(clause_start);

        let mut catch = None;
        let mut finally = None;
        for clause in clauses {
            let items = clause.children();
            match clause.head_symbol() {
                Some("catch") if catch.is_none() && finally.is_none() => {
                    let name: Rc<str> = items
                        .get(2)
                        .and_then(Form::as_symbol)
                        .ok_or_else(|| shape_error("catch", "expects (catch type name body...)", form))?
                        .into();
                    self.scopes.push(HashSet::from([name.clone()]));
                    self.recur_targets.push(None);
                    let handler = self.lower_body(&items[3..], Tail::No);
                    self.recur_targets.pop();
                    self.scopes.pop();
                    catch = Some(Catch { name, body: handler? });
                }
                Some("finally") if finally.is_none() => {
                    finally = Some(self.lower_body(&items[1..], Tail::No)?);
                }
                _ => return Err(shape_error("try", "expects at most one catch followed by at most one finally", form)),
            }
        }

        self.recur_targets.push(None);
        let body = self.lower_body(body, Tail::No);
        self.recur_targets.pop();

        Ok(Rc::new(Code::Try {
            body: body?,
            catch,
            finally,
        }))
    }

    fn lower_ns(&mut self, form: &Form, args: &[Form]) -> Result<Rc<Code>, Error> {
        let name = args
            .first()
            .and_then(Form::as_symbol)
            .ok_or_else(|| shape_error("ns*", "expects a namespace name", form))?;

        let aliases = symbol_table(args.get(1)).ok_or_else(|| shape_error("ns*", "aliases must be a map of symbols", form))?;
        let refers = symbol_table(args.get(2)).ok_or_else(|| shape_error("ns*", "refers must be a map of symbols", form))?;

        self.ns = name.into();
        self.aliases = aliases;
        self.refers = refers;
        Ok(Rc::new(Code::Namespace(self.ns.clone())))
    }
}

/// Parse `[a b & rest]`.
fn parse_params(params: &Form, form: &Form) -> Result<(Vec<Rc<str>>, Option<Rc<str>>), Error> {
    let items = params.as_vector().unwrap_or_default();
    let mut names = Vec::with_capacity(items.len());
    let mut iter = items.iter();
    while let Some(item) = iter.next() {
        let name = item
            .as_symbol()
            .filter(|n| !n.contains('/'))
            .ok_or_else(|| shape_error("fn*", "parameters must be unqualified symbols", form))?;
        if name == "&" {
            let rest = match (iter.next(), iter.next()) {
                (Some(rest), None) => rest.as_symbol(),
                _ => None,
            };
            let rest = rest.ok_or_else(|| shape_error("fn*", "'&' must be followed by exactly one name", form))?;
            return Ok((names, Some(rest.into())));
        }
        names.push(name.into());
    }
    Ok((names, None))
}

/// `{sym sym ...}` as a string table; a missing table is empty.
fn symbol_table(form: Option<&Form>) -> Option<HashMap<String, String>> {
    let Some(form) = form else {
        return Some(HashMap::new());
    };
    match &form.kind {
        FormKind::Collection(CollKind::Map, items) => items
            .chunks(2)
            .map(|pair| Some((pair[0].as_symbol()?.to_string(), pair[1].as_symbol()?.to_string())))
            .collect(),
        FormKind::Atom(Atom::Nil) => Some(HashMap::new()),
        _ => None,
    }
}

fn shape_error(special: &str, message: &str, form: &Form) -> Error {
    Error::syntax(format!("{} {} at {}", special, message, form.span.start))
}

/// Namespaces that exist in every sandbox without being loaded.
pub fn is_builtin_namespace(name: &str) -> bool {
    name == CORE_NS || name == HOST_NS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_checkpoints(source: &str) -> usize {
        transform(source, "user").expect("transform failed").checkpoints
    }

    #[test]
    fn test_calls_and_loops_get_checkpoints() {
        assert_eq!(count_checkpoints("1"), 0);
        assert_eq!(count_checkpoints("(inc 1)"), 1);
        assert_eq!(count_checkpoints("(+ (inc 1) (dec 2))"), 3);
        assert_eq!(count_checkpoints("(loop* [i 0] (if (< i 3) (recur (inc i)) i))"), 3);
        assert_eq!(count_checkpoints("(fn* [x] x)"), 1);
        assert_eq!(count_checkpoints("'(a b c)"), 0);
    }

    #[test]
    fn test_symbols_resolve_by_scope() {
        let program = transform("(let* [x 1] x)", "user").unwrap();
        match &*program.body {
            Code::Let { body, .. } => assert!(matches!(**body, Code::Local(_))),
            other => panic!("expected let, got {:?}", other),
        }

        let program = transform("(ns* app {u app.util} {helper app.util}) (u/f helper)", "user").unwrap();
        let Code::Do(forms) = &*program.body else {
            panic!("expected do");
        };
        let Code::Checkpoint(call) = &*forms[1] else {
            panic!("expected checkpointed call");
        };
        let Code::Call { callee, args } = &**call else {
            panic!("expected call");
        };
        assert!(matches!(&**callee, Code::Global { ns, name, fallback: false } if &**ns == "app.util" && &**name == "f"));
        assert!(matches!(&*args[0], Code::Global { ns, fallback: false, .. } if &**ns == "app.util"));
    }

    #[test]
    fn test_recur_must_be_in_tail_position() {
        assert!(transform("(loop* [i 0] (recur (inc i)))", "user").is_ok());
        assert!(transform("(fn* [a b] (if a (recur b a) b))", "user").is_ok());

        let err = transform("(loop* [i 0] (inc (recur i)))", "user").unwrap_err();
        assert!(err.to_string().contains("tail position"), "{}", err);

        let err = transform("(loop* [i 0] (recur))", "user").unwrap_err();
        assert!(err.to_string().contains("recur expects 1 arguments"), "{}", err);

        assert!(transform("(recur 1)", "user").is_err());
        assert!(transform("(loop* [i 0] (try (recur i)))", "user").is_err());
    }

    #[test]
    fn test_malformed_special_forms() {
        assert!(matches!(transform("(if)", "user"), Err(Error::Syntax(_))));
        assert!(matches!(transform("(def 1 2)", "user"), Err(Error::Syntax(_))));
        assert!(matches!(transform("(let* [a] a)", "user"), Err(Error::Syntax(_))));
        assert!(matches!(transform("(fn* [a & b c] a)", "user"), Err(Error::Syntax(_))));
        assert!(matches!(transform("(fn* ([a] a) ([b] b))", "user"), Err(Error::Syntax(_))));
        assert!(matches!(transform("(catch e)", "user"), Err(Error::Syntax(_))));
        assert!(matches!(transform("(+ 1", "user"), Err(Error::Read(_))));
    }

    #[test]
    fn test_constant_literals_fold() {
        let program = transform("[1 :a \"s\"]", "user").unwrap();
        assert!(matches!(&*program.body, Code::Const(Value::Vector(_))));

        let program = transform("[1 (inc 1)]", "user").unwrap();
        assert!(matches!(&*program.body, Code::Collection { kind: CollKind::Vector, .. }));
    }
}
