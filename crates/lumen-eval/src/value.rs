//! Runtime values for the Lumen sandbox.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write};
use std::rc::Rc;

use lumen_reader::form::{write_char_literal, write_string_literal};
use lumen_reader::{Atom, CollKind, Form, FormKind};
use serde_json::Value as JsonValue;

use crate::builtins::NativeCtx;
use crate::code::Lambda;
use crate::env::Env;
use crate::error::Error;
use crate::stack::ensure_sufficient_stack;

/// Nesting limit of JSON conversion, matching the parser's own limit.
const MAX_JSON_DEPTH: usize = 128;

/// Persistent sequence backing lists, vectors and sets.
///
/// Clones share structure, so `rest` and `conj` do not copy the elements.
pub type Seq = im::Vector<Value>;

/// A runtime value in the Lumen language.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    /// Numbers are always f64, like JavaScript.
    Number(f64),
    String(Rc<str>),
    Char(char),
    Keyword(Rc<str>),
    Symbol(Rc<str>),
    List(Seq),
    Vector(Seq),
    /// Insertion-ordered map entries with unique keys.
    Map(Rc<Vec<(Value, Value)>>),
    /// Insertion-ordered unique members.
    Set(Seq),
    Fn(Rc<Closure>),
    Native(Native),
    Atom(Rc<RefCell<Value>>),
    Namespace(Rc<Namespace>),
    /// Result of `def`: the qualified name of the var.
    Var(Rc<str>),
    Error(Rc<ErrorValue>),
}

/// A user function together with its captured environment.
pub struct Closure {
    pub lambda: Rc<Lambda>,
    pub env: Env,
}

/// Signature of native functions.
pub type NativeFn = fn(&mut NativeCtx<'_>, Vec<Value>) -> Result<Value, Error>;

/// How a native function runs.
#[derive(Clone, Copy)]
pub enum NativeKind {
    /// Plain Rust function over evaluated arguments.
    Fn(NativeFn),
    /// `apply`: re-enters the interpreter with spread arguments.
    Apply,
    /// `swap!`: calls a function on the atom's value and stores the result.
    Swap,
}

#[derive(Clone, Copy)]
pub struct Native {
    pub name: &'static str,
    pub kind: NativeKind,
}

/// A thrown error value (`ex-info` or an internal runtime failure).
#[derive(Debug)]
pub struct ErrorValue {
    pub message: String,
    pub data: Value,
}

/// A namespace object: the vars defined by one compiled unit.
pub struct Namespace {
    pub name: Rc<str>,
    vars: RefCell<HashMap<Rc<str>, Value>>,
}

impl Namespace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            vars: RefCell::new(HashMap::new()),
        }
    }

    pub fn define(&self, name: &str, value: Value) {
        self.vars.borrow_mut().insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.borrow().get(name).cloned()
    }

    /// Names defined in this namespace, sorted.
    pub fn names(&self) -> Vec<Rc<str>> {
        let mut names: Vec<_> = self.vars.borrow().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(s.as_ref().into())
    }

    pub fn keyword(s: impl AsRef<str>) -> Value {
        Value::Keyword(s.as_ref().into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Seq::from(items))
    }

    pub fn vector(items: Vec<Value>) -> Value {
        Value::Vector(Seq::from(items))
    }

    /// Build a map, later keys replacing earlier ones.
    pub fn map(entries: Vec<(Value, Value)>) -> Value {
        let mut out: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match out.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => out.push((key, value)),
            }
        }
        Value::Map(Rc::new(out))
    }

    /// Build a set, dropping duplicates.
    pub fn set(items: Vec<Value>) -> Value {
        let mut out = Seq::new();
        for item in items {
            if !out.iter().any(|member| *member == item) {
                out.push_back(item);
            }
        }
        Value::Set(out)
    }

    pub fn error(message: impl Into<String>, data: Value) -> Value {
        Value::Error(Rc::new(ErrorValue {
            message: message.into(),
            data,
        }))
    }

    /// Everything except `nil` and `false` is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Char(_) => "char",
            Value::Keyword(_) => "keyword",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Vector(_) => "vector",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Fn(_) | Value::Native(_) => "function",
            Value::Atom(_) => "atom",
            Value::Namespace(_) => "namespace",
            Value::Var(_) => "var",
            Value::Error(_) => "error",
        }
    }

    /// Elements of a sequential or collection value, for iteration.
    ///
    /// `nil` is the empty sequence; maps yield `[key value]` vectors and
    /// strings yield characters.
    pub fn seq_items(&self) -> Option<Vec<Value>> {
        Some(match self {
            Value::Nil => Vec::new(),
            Value::List(items) | Value::Vector(items) | Value::Set(items) => items.iter().cloned().collect(),
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| Value::vector(vec![k.clone(), v.clone()]))
                .collect(),
            Value::String(s) => s.chars().map(Value::Char).collect(),
            _ => return None,
        })
    }

    /// Like [`Value::seq_items`], but sequential values share their
    /// storage instead of being copied.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Value::List(items) | Value::Vector(items) | Value::Set(items) => Some(items.clone()),
            other => other.seq_items().map(Seq::from),
        }
    }

    /// Look up `key` in a map entry list.
    pub fn map_get<'a>(entries: &'a [(Value, Value)], key: &Value) -> Option<&'a Value> {
        entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Convert a quoted form into data.
    pub fn from_form(form: &Form) -> Value {
        match &form.kind {
            FormKind::Atom(atom) => match atom {
                Atom::Nil => Value::Nil,
                Atom::Bool(b) => Value::Bool(*b),
                Atom::Int(n) => Value::Number(*n as f64),
                Atom::Float(n) => Value::Number(*n),
                Atom::Str(s) => Value::string(s),
                Atom::Char(c) => Value::Char(*c),
                Atom::Keyword(k) => Value::keyword(k),
                Atom::Symbol(s) => Value::Symbol(s.as_str().into()),
            },
            FormKind::Collection(kind, items) => {
                let values: Vec<Value> = items.iter().map(Value::from_form).collect();
                Value::collection(*kind, values)
            }
        }
    }

    /// Build a collection of the given kind from evaluated items.
    ///
    /// Map items alternate key, value.
    pub fn collection(kind: CollKind, values: Vec<Value>) -> Value {
        match kind {
            CollKind::List => Value::list(values),
            CollKind::Vector => Value::vector(values),
            CollKind::Set => Value::set(values),
            CollKind::Map => {
                let mut entries = Vec::with_capacity(values.len() / 2);
                let mut iter = values.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    entries.push((k, v));
                }
                Value::map(entries)
            }
        }
    }

    /// Text as produced by `str`: like `print` but `nil` is empty.
    pub fn to_str(&self) -> String {
        match self {
            Value::Nil => String::new(),
            other => other.to_string(),
        }
    }

    /// Readable representation, as produced by `pr-str`.
    pub fn pr_str(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = Printer::readable().write(&mut out, self);
        out
    }

    /// Parse a JSON string into a Value. Object keys become keywords.
    pub fn from_json(s: &str) -> Result<Value, String> {
        let json: JsonValue =
            serde_json::from_str(s).map_err(|e| format!("JSON parse error: {}", e))?;
        Ok(Value::from_json_value(json))
    }

    fn from_json_value(json: JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Nil,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => Value::string(s),
            JsonValue::Array(arr) => {
                Value::vector(arr.into_iter().map(Value::from_json_value).collect())
            }
            JsonValue::Object(obj) => Value::map(
                obj.into_iter()
                    .map(|(k, v)| (Value::keyword(k), Value::from_json_value(v)))
                    .collect(),
            ),
        }
    }

    /// Convert this Value to a JSON string.
    ///
    /// Fails for values nested deeper than JSON parsing accepts.
    pub fn to_json(&self) -> Result<String, String> {
        Ok(self.to_json_value(0)?.to_string())
    }

    fn to_json_value(&self, depth: usize) -> Result<JsonValue, String> {
        if depth >= MAX_JSON_DEPTH {
            return Err(format!("JSON nesting exceeds {} levels", MAX_JSON_DEPTH));
        }
        Ok(match self {
            Value::Nil => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) | Value::Keyword(s) | Value::Symbol(s) => {
                JsonValue::String(s.to_string())
            }
            Value::Char(c) => JsonValue::String(c.to_string()),
            Value::List(items) | Value::Vector(items) | Value::Set(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|v| v.to_json_value(depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => {
                let map = entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::String(s) | Value::Keyword(s) | Value::Symbol(s) => s.to_string(),
                            other => other.pr_str(),
                        };
                        Ok((key, v.to_json_value(depth + 1)?))
                    })
                    .collect::<Result<serde_json::Map<String, JsonValue>, String>>()?;
                JsonValue::Object(map)
            }
            Value::Error(e) => JsonValue::String(e.message.clone()),
            _ => JsonValue::Null,
        })
    }
}

fn write_number(out: &mut impl Write, n: f64) -> fmt::Result {
    if n.is_nan() {
        write!(out, "##NaN")
    } else if n.is_infinite() {
        write!(out, "{}", if n > 0.0 { "##Inf" } else { "##-Inf" })
    } else if n == n.trunc() && n.abs() < 1e15 {
        // Integer-like numbers without decimal point
        write!(out, "{}", n as i64)
    } else {
        write!(out, "{}", n)
    }
}

/// Writes values as text.
///
/// An atom shows its contents, but atoms reached from inside another atom
/// print as `#<atom>` so that self-referencing atoms terminate.
#[derive(Clone, Copy)]
struct Printer {
    readable: bool,
    in_atom: bool,
}

impl Printer {
    fn plain() -> Self {
        Self {
            readable: false,
            in_atom: false,
        }
    }

    fn readable() -> Self {
        Self {
            readable: true,
            in_atom: false,
        }
    }

    fn write(self, out: &mut impl Write, value: &Value) -> fmt::Result {
        ensure_sufficient_stack(|| self.write_inner(out, value))
    }

    fn write_seq(self, out: &mut impl Write, open: &str, items: &Seq, close: &str) -> fmt::Result {
        out.write_str(open)?;
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.write_char(' ')?;
            }
            self.write(out, item)?;
        }
        out.write_str(close)
    }

    fn write_inner(self, out: &mut impl Write, value: &Value) -> fmt::Result {
        let readable = self.readable;
        match value {
            Value::Nil => out.write_str("nil"),
            Value::Bool(b) => write!(out, "{}", b),
            Value::Number(n) => write_number(out, *n),
            Value::String(s) if readable => write_string_literal(out, s),
            Value::String(s) => out.write_str(s),
            Value::Char(c) if readable => write_char_literal(out, *c),
            Value::Char(c) => out.write_char(*c),
            Value::Keyword(k) => write!(out, ":{}", k),
            Value::Symbol(s) => out.write_str(s),
            Value::List(items) => self.write_seq(out, "(", items, ")"),
            Value::Vector(items) => self.write_seq(out, "[", items, "]"),
            Value::Set(items) => self.write_seq(out, "#{", items, "}"),
            Value::Map(entries) => {
                out.write_char('{')?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.write_str(", ")?;
                    }
                    self.write(out, k)?;
                    out.write_char(' ')?;
                    self.write(out, v)?;
                }
                out.write_char('}')
            }
            Value::Fn(closure) => match &closure.lambda.name {
                Some(name) => write!(out, "#<fn {}/{}>", closure.lambda.ns, name),
                None => write!(out, "#<fn {}/anonymous>", closure.lambda.ns),
            },
            Value::Native(native) => write!(out, "#<native {}>", native.name),
            Value::Atom(_) if self.in_atom => out.write_str("#<atom>"),
            Value::Atom(cell) => {
                out.write_str("#<atom ")?;
                let inner = Printer {
                    in_atom: true,
                    ..self
                };
                match cell.try_borrow() {
                    Ok(contents) => inner.write(out, &contents)?,
                    Err(_) => out.write_str("...")?,
                }
                out.write_char('>')
            }
            Value::Namespace(ns) => write!(out, "#<namespace {}>", ns.name),
            Value::Var(name) => write!(out, "#'{}", name),
            Value::Error(e) => {
                out.write_str("#error {:message ")?;
                write_string_literal(out, &e.message)?;
                if !e.data.is_nil() {
                    out.write_str(", :data ")?;
                    self.write(out, &e.data)?;
                }
                out.write_char('}')
            }
        }
    }
}

/// Text as produced by `print`/`println`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer::plain().write(f, self)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Printer::readable().write(f, self)
    }
}

fn seq_eq(a: &Seq, b: &Seq) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        ensure_sufficient_stack(|| values_eq(self, other))
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Char(a), Value::Char(b)) => a == b,
        (Value::Keyword(a), Value::Keyword(b)) => a == b,
        (Value::Symbol(a), Value::Symbol(b)) => a == b,
        (
            Value::List(a) | Value::Vector(a),
            Value::List(b) | Value::Vector(b),
        ) => seq_eq(a, b),
        (Value::Set(a), Value::Set(b)) => a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x == y)),
        (Value::Map(a), Value::Map(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| Value::map_get(b, k) == Some(v))
        }
        (Value::Fn(a), Value::Fn(b)) => Rc::ptr_eq(a, b),
        (Value::Native(a), Value::Native(b)) => a.name == b.name,
        (Value::Atom(a), Value::Atom(b)) => Rc::ptr_eq(a, b),
        (Value::Namespace(a), Value::Namespace(b)) => Rc::ptr_eq(a, b),
        (Value::Var(a), Value::Var(b)) => a == b,
        (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

/// Nested values are released on a growable stack.
impl Drop for Value {
    fn drop(&mut self) {
        match self {
            Value::List(items) | Value::Vector(items) | Value::Set(items) if !items.is_empty() => {
                let items = std::mem::take(items);
                ensure_sufficient_stack(move || drop(items));
            }
            Value::Map(entries) => {
                if let Some(entries) = Rc::get_mut(entries) {
                    let entries = std::mem::take(entries);
                    ensure_sufficient_stack(move || drop(entries));
                }
            }
            Value::Atom(cell) => {
                if let Some(cell) = Rc::get_mut(cell) {
                    let contents = std::mem::take(cell.get_mut());
                    ensure_sufficient_stack(move || drop(contents));
                }
            }
            _ => {}
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}
