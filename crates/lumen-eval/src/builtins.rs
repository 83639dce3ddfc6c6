//! Native functions of `lumen.core` and the host bridge functions of `lumen.host`.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::bridge::{HostBridge, CORE_NS, HOST_NS};
use crate::error::Error;
use crate::output::OutputSink;
use crate::value::{Native, NativeFn, NativeKind, Seq, Value};

/// What a native function may touch besides its arguments.
pub struct NativeCtx<'a> {
    pub output: &'a OutputSink,
    pub bridge: &'a HostBridge,
}

/// Largest list `range` will build.
pub const MAX_RANGE: usize = 1_000_000;

const CORE: &[(&str, NativeFn)] = &[
    ("+", add),
    ("-", sub),
    ("*", mul),
    ("/", div),
    ("mod", modulo),
    ("rem", rem),
    ("quot", quot),
    ("inc", inc),
    ("dec", dec),
    ("max", max),
    ("min", min),
    ("abs", abs),
    ("=", equal),
    ("not=", not_equal),
    ("<", lt),
    (">", gt),
    ("<=", le),
    (">=", ge),
    ("not", not),
    ("identity", identity),
    ("nil?", is_nil),
    ("some?", is_some),
    ("true?", is_true),
    ("false?", is_false),
    ("boolean?", is_boolean),
    ("number?", is_number),
    ("string?", is_string),
    ("keyword?", is_keyword),
    ("symbol?", is_symbol),
    ("fn?", is_fn),
    ("list?", is_list),
    ("vector?", is_vector),
    ("map?", is_map),
    ("set?", is_set),
    ("coll?", is_coll),
    ("seq?", is_list),
    ("atom?", is_atom),
    ("empty?", is_empty),
    ("zero?", is_zero),
    ("pos?", is_pos),
    ("neg?", is_neg),
    ("even?", is_even),
    ("odd?", is_odd),
    ("count", count),
    ("first", first),
    ("rest", rest),
    ("next", next),
    ("second", second),
    ("nth", nth),
    ("cons", cons),
    ("conj", conj),
    ("get", get),
    ("assoc", assoc),
    ("dissoc", dissoc),
    ("contains?", contains),
    ("keys", keys),
    ("vals", vals),
    ("seq", seq),
    ("concat", concat),
    ("range", range),
    ("sort", sort),
    ("vec", vec),
    ("list", list),
    ("vector", vector),
    ("hash-map", hash_map),
    ("hash-set", hash_set),
    ("str", str),
    ("subs", subs),
    ("name", name),
    ("keyword", keyword),
    ("symbol", symbol),
    ("atom", atom),
    ("deref", deref),
    ("reset!", reset),
    ("print", print),
    ("println", print),
    ("prn", prn),
    ("pr-str", pr_str),
    ("ex-info", ex_info),
    ("ex-message", ex_message),
    ("ex-data", ex_data),
    ("type", type_of),
    ("json-encode", json_encode),
    ("json-decode", json_decode),
];

const HOST: &[(&str, NativeFn)] = &[
    ("provide", provide),
    ("require", require),
    ("console-log", console_log),
];

/// Define every native in the `lumen.core` and `lumen.host` namespaces of `bridge`.
pub fn install(bridge: &HostBridge) {
    let core = bridge.namespace(CORE_NS);
    for &(name, f) in CORE {
        core.define(name, native(name, NativeKind::Fn(f)));
    }
    core.define("apply", native("apply", NativeKind::Apply));
    core.define("swap!", native("swap!", NativeKind::Swap));

    let host = bridge.namespace(HOST_NS);
    for &(name, f) in HOST {
        host.define(name, native(name, NativeKind::Fn(f)));
    }
}

fn native(name: &'static str, kind: NativeKind) -> Value {
    Value::Native(Native { name, kind })
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), Error> {
    if args.len() != expected {
        return Err(Error::runtime(format!(
            "Wrong number of args ({}) passed to {}",
            args.len(),
            name
        )));
    }
    Ok(())
}

fn arity_between(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), Error> {
    if args.len() < min || args.len() > max {
        return Err(Error::runtime(format!(
            "Wrong number of args ({}) passed to {}",
            args.len(),
            name
        )));
    }
    Ok(())
}

fn number(name: &str, value: &Value) -> Result<f64, Error> {
    match value {
        Value::Number(n) => Ok(*n),
        other => Err(Error::runtime(format!(
            "{} expects a number, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn items(name: &str, value: &Value) -> Result<Vec<Value>, Error> {
    value.seq_items().ok_or_else(|| {
        Error::runtime(format!("{} is not a collection (in {})", value.type_name(), name))
    })
}

/// Like [`items`], sharing the storage of sequential values.
fn seq_of(name: &str, value: &Value) -> Result<Seq, Error> {
    value.seq().ok_or_else(|| {
        Error::runtime(format!("{} is not a collection (in {})", value.type_name(), name))
    })
}

/// Everything after the first element.
fn tail(all: Seq) -> Seq {
    all.skip(all.len().min(1))
}

fn fold(name: &str, args: &[Value], init: f64, op: fn(f64, f64) -> f64) -> Result<Value, Error> {
    let mut acc = init;
    for arg in args {
        acc = op(acc, number(name, arg)?);
    }
    Ok(Value::Number(acc))
}

fn add(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    fold("+", &args, 0.0, |a, b| a + b)
}

fn mul(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    fold("*", &args, 1.0, |a, b| a * b)
}

fn sub(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    match args.split_first() {
        None => arity("-", &args, 1).map(|_| Value::Nil),
        Some((only, [])) => Ok(Value::Number(-number("-", only)?)),
        Some((head, tail)) => fold("-", tail, number("-", head)?, |a, b| a - b),
    }
}

fn div(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    match args.split_first() {
        None => arity("/", &args, 1).map(|_| Value::Nil),
        Some((only, [])) => Ok(Value::Number(1.0 / number("/", only)?)),
        Some((head, tail)) => fold("/", tail, number("/", head)?, |a, b| a / b),
    }
}

fn modulo(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("mod", &args, 2)?;
    let (a, b) = (number("mod", &args[0])?, number("mod", &args[1])?);
    Ok(Value::Number(a - b * (a / b).floor()))
}

fn rem(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("rem", &args, 2)?;
    Ok(Value::Number(number("rem", &args[0])? % number("rem", &args[1])?))
}

fn quot(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("quot", &args, 2)?;
    Ok(Value::Number((number("quot", &args[0])? / number("quot", &args[1])?).trunc()))
}

fn inc(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("inc", &args, 1)?;
    Ok(Value::Number(number("inc", &args[0])? + 1.0))
}

fn dec(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("dec", &args, 1)?;
    Ok(Value::Number(number("dec", &args[0])? - 1.0))
}

fn max(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("max", &args, 1, usize::MAX)?;
    fold("max", &args, f64::NEG_INFINITY, f64::max)
}

fn min(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("min", &args, 1, usize::MAX)?;
    fold("min", &args, f64::INFINITY, f64::min)
}

fn abs(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("abs", &args, 1)?;
    Ok(Value::Number(number("abs", &args[0])?.abs()))
}

fn equal(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("=", &args, 1, usize::MAX)?;
    Ok(Value::Bool(args.windows(2).all(|w| w[0] == w[1])))
}

fn not_equal(ctx: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    let eq = equal(ctx, args)?;
    Ok(Value::Bool(!eq.is_truthy()))
}

/// Numbers compare numerically, strings lexically.
fn compare(name: &str, a: &Value, b: &Value) -> Result<Ordering, Error> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal)),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Keyword(x), Value::Keyword(y)) => Ok(x.cmp(y)),
        _ => Err(Error::runtime(format!(
            "{} cannot compare {} and {}",
            name,
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn chain(name: &str, args: &[Value], pred: fn(Ordering) -> bool) -> Result<Value, Error> {
    arity_between(name, args, 1, usize::MAX)?;
    if let [only] = args {
        number(name, only)?;
    }
    for pair in args.windows(2) {
        if !pred(compare(name, &pair[0], &pair[1])?) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn lt(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    chain("<", &args, Ordering::is_lt)
}

fn gt(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    chain(">", &args, Ordering::is_gt)
}

fn le(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    chain("<=", &args, Ordering::is_le)
}

fn ge(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    chain(">=", &args, Ordering::is_ge)
}

fn not(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("not", &args, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

fn identity(_: &mut NativeCtx<'_>, mut args: Vec<Value>) -> Result<Value, Error> {
    arity("identity", &args, 1)?;
    Ok(args.remove(0))
}

fn predicate(name: &str, args: &[Value], test: fn(&Value) -> bool) -> Result<Value, Error> {
    arity(name, args, 1)?;
    Ok(Value::Bool(test(&args[0])))
}

fn is_nil(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("nil?", &args, Value::is_nil)
}

fn is_some(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("some?", &args, |v| !v.is_nil())
}

fn is_true(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("true?", &args, |v| matches!(v, Value::Bool(true)))
}

fn is_false(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("false?", &args, |v| matches!(v, Value::Bool(false)))
}

fn is_boolean(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("boolean?", &args, |v| matches!(v, Value::Bool(_)))
}

fn is_number(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("number?", &args, |v| matches!(v, Value::Number(_)))
}

fn is_string(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("string?", &args, |v| matches!(v, Value::String(_)))
}

fn is_keyword(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("keyword?", &args, |v| matches!(v, Value::Keyword(_)))
}

fn is_symbol(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("symbol?", &args, |v| matches!(v, Value::Symbol(_)))
}

fn is_fn(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("fn?", &args, |v| matches!(v, Value::Fn(_) | Value::Native(_)))
}

fn is_list(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("list?", &args, |v| matches!(v, Value::List(_)))
}

fn is_vector(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("vector?", &args, |v| matches!(v, Value::Vector(_)))
}

fn is_map(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("map?", &args, |v| matches!(v, Value::Map(_)))
}

fn is_set(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("set?", &args, |v| matches!(v, Value::Set(_)))
}

fn is_coll(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("coll?", &args, |v| {
        matches!(v, Value::List(_) | Value::Vector(_) | Value::Map(_) | Value::Set(_))
    })
}

fn is_atom(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    predicate("atom?", &args, |v| matches!(v, Value::Atom(_)))
}

fn is_empty(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("empty?", &args, 1)?;
    Ok(Value::Bool(items("empty?", &args[0])?.is_empty()))
}

fn number_predicate(name: &str, args: &[Value], test: fn(f64) -> bool) -> Result<Value, Error> {
    arity(name, args, 1)?;
    Ok(Value::Bool(test(number(name, &args[0])?)))
}

fn is_zero(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    number_predicate("zero?", &args, |n| n == 0.0)
}

fn is_pos(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    number_predicate("pos?", &args, |n| n > 0.0)
}

fn is_neg(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    number_predicate("neg?", &args, |n| n < 0.0)
}

fn is_even(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    number_predicate("even?", &args, |n| n % 2.0 == 0.0)
}

fn is_odd(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    number_predicate("odd?", &args, |n| n.abs() % 2.0 == 1.0)
}

fn count(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("count", &args, 1)?;
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Map(entries) => entries.len(),
        other => seq_of("count", other)?.len(),
    };
    Ok(Value::Number(n as f64))
}

fn first(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("first", &args, 1)?;
    Ok(seq_of("first", &args[0])?.front().cloned().unwrap_or_default())
}

fn rest(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("rest", &args, 1)?;
    Ok(Value::List(tail(seq_of("rest", &args[0])?)))
}

fn next(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("next", &args, 1)?;
    let rest = tail(seq_of("next", &args[0])?);
    Ok(if rest.is_empty() { Value::Nil } else { Value::List(rest) })
}

fn second(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("second", &args, 1)?;
    Ok(seq_of("second", &args[0])?.get(1).cloned().unwrap_or_default())
}

fn nth(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("nth", &args, 2, 3)?;
    let index = number("nth", &args[1])?;
    let found = if index >= 0.0 {
        seq_of("nth", &args[0])?.get(index as usize).cloned()
    } else {
        None
    };
    match (found, args.get(2)) {
        (Some(value), _) => Ok(value),
        (None, Some(default)) => Ok(default.clone()),
        (None, None) => Err(Error::runtime(format!("Index {} out of bounds", index))),
    }
}

fn cons(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("cons", &args, 2)?;
    let mut out = seq_of("cons", &args[1])?;
    out.push_front(args[0].clone());
    Ok(Value::List(out))
}

fn conj(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    let Some((coll, added)) = args.split_first() else {
        return Ok(Value::vector(Vec::new()));
    };
    match coll {
        Value::Nil | Value::List(_) => {
            let mut out = coll.seq().unwrap_or_default();
            for item in added {
                out.push_front(item.clone());
            }
            Ok(Value::List(out))
        }
        Value::Vector(existing) => {
            let mut out = existing.clone();
            out.extend(added.iter().cloned());
            Ok(Value::Vector(out))
        }
        Value::Set(existing) => {
            let mut out = existing.clone();
            for item in added {
                if !out.iter().any(|member| member == item) {
                    out.push_back(item.clone());
                }
            }
            Ok(Value::Set(out))
        }
        Value::Map(existing) => {
            let mut out = existing.as_ref().clone();
            for entry in added {
                match entry.seq_items().as_deref() {
                    Some([k, v]) => out.push((k.clone(), v.clone())),
                    _ => return Err(Error::runtime("conj on a map expects [key value] entries")),
                }
            }
            Ok(Value::map(out))
        }
        other => Err(Error::runtime(format!("Cannot conj onto {}", other.type_name()))),
    }
}

/// Lookup shared by `get` and collections used as functions.
pub(crate) fn lookup(coll: &Value, key: &Value) -> Option<Value> {
    match coll {
        Value::Map(entries) => Value::map_get(entries, key).cloned(),
        Value::Set(members) => members.iter().any(|member| member == key).then(|| key.clone()),
        Value::Vector(items) => match key {
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 => items.get(*n as usize).cloned(),
            _ => None,
        },
        Value::String(s) => match key {
            Value::Number(n) if *n >= 0.0 => s.chars().nth(*n as usize).map(Value::Char),
            _ => None,
        },
        _ => None,
    }
}

fn get(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("get", &args, 2, 3)?;
    Ok(lookup(&args[0], &args[1])
        .or_else(|| args.get(2).cloned())
        .unwrap_or_default())
}

fn assoc(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    if args.len() < 3 || args.len() % 2 == 0 {
        return Err(Error::runtime(format!(
            "Wrong number of args ({}) passed to assoc",
            args.len()
        )));
    }
    let pairs = args[1..].chunks(2).map(|kv| (kv[0].clone(), kv[1].clone()));
    match &args[0] {
        Value::Nil => Ok(Value::map(pairs.collect())),
        Value::Map(entries) => {
            let mut out = entries.as_ref().clone();
            out.extend(pairs);
            Ok(Value::map(out))
        }
        Value::Vector(items) => {
            let mut out = items.clone();
            for (k, v) in pairs {
                let index = number("assoc", &k)?;
                match index as usize {
                    i if index >= 0.0 && i < out.len() => {
                        out.set(i, v);
                    }
                    i if index >= 0.0 && i == out.len() => out.push_back(v),
                    _ => return Err(Error::runtime(format!("Index {} out of bounds", index))),
                }
            }
            Ok(Value::Vector(out))
        }
        other => Err(Error::runtime(format!("Cannot assoc on {}", other.type_name()))),
    }
}

fn dissoc(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    let Some((coll, keys)) = args.split_first() else {
        return arity("dissoc", &args, 1).map(|_| Value::Nil);
    };
    match coll {
        Value::Nil => Ok(Value::Nil),
        Value::Map(entries) => Ok(Value::Map(Rc::new(
            entries
                .iter()
                .filter(|(k, _)| !keys.contains(k))
                .cloned()
                .collect(),
        ))),
        other => Err(Error::runtime(format!("Cannot dissoc on {}", other.type_name()))),
    }
}

fn contains(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("contains?", &args, 2)?;
    let found = match &args[0] {
        Value::Map(entries) => Value::map_get(entries, &args[1]).is_some(),
        Value::Set(members) => members.iter().any(|member| *member == args[1]),
        other => lookup(other, &args[1]).is_some(),
    };
    Ok(Value::Bool(found))
}

fn keys(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("keys", &args, 1)?;
    match &args[0] {
        Value::Map(entries) if entries.is_empty() => Ok(Value::Nil),
        Value::Map(entries) => Ok(Value::list(entries.iter().map(|(k, _)| k.clone()).collect())),
        Value::Nil => Ok(Value::Nil),
        other => Err(Error::runtime(format!("Cannot get keys of {}", other.type_name()))),
    }
}

fn vals(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("vals", &args, 1)?;
    match &args[0] {
        Value::Map(entries) if entries.is_empty() => Ok(Value::Nil),
        Value::Map(entries) => Ok(Value::list(entries.iter().map(|(_, v)| v.clone()).collect())),
        Value::Nil => Ok(Value::Nil),
        other => Err(Error::runtime(format!("Cannot get vals of {}", other.type_name()))),
    }
}

fn seq(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("seq", &args, 1)?;
    let all = seq_of("seq", &args[0])?;
    Ok(if all.is_empty() { Value::Nil } else { Value::List(all) })
}

fn concat(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    let mut out = Vec::new();
    for arg in &args {
        out.extend(items("concat", arg)?);
    }
    Ok(Value::list(out))
}

fn range(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("range", &args, 1, 3)?;
    let nums = args
        .iter()
        .map(|a| number("range", a))
        .collect::<Result<Vec<f64>, Error>>()?;
    let (start, end, step) = match nums.as_slice() {
        [end] => (0.0, *end, 1.0),
        [start, end] => (*start, *end, 1.0),
        [start, end, step] => (*start, *end, *step),
        _ => unreachable!("arity checked above"),
    };
    if step == 0.0 {
        return Err(Error::runtime("range step must not be zero"));
    }
    if !(start.is_finite() && end.is_finite() && step.is_finite()) {
        return Err(Error::runtime("range bounds must be finite"));
    }
    let count = ((end - start) / step).ceil().max(0.0);
    if count > MAX_RANGE as f64 {
        return Err(Error::runtime(format!(
            "range of {} elements exceeds the limit of {}",
            count, MAX_RANGE
        )));
    }
    let out = (0..count as usize)
        .map(|i| Value::Number(start + i as f64 * step))
        .collect();
    Ok(Value::list(out))
}

fn sort(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("sort", &args, 1)?;
    let mut all = items("sort", &args[0])?;
    let mut failure = None;
    all.sort_by(|a, b| {
        compare("sort", a, b).unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(Value::list(all)),
    }
}

fn vec(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("vec", &args, 1)?;
    Ok(Value::Vector(seq_of("vec", &args[0])?))
}

fn list(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::list(args))
}

fn vector(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::vector(args))
}

fn hash_map(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::runtime("hash-map expects an even number of arguments"));
    }
    Ok(Value::map(
        args.chunks(2).map(|kv| (kv[0].clone(), kv[1].clone())).collect(),
    ))
}

fn hash_set(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::set(args))
}

fn str(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::string(args.iter().map(Value::to_str).collect::<String>()))
}

fn subs(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("subs", &args, 2, 3)?;
    let Value::String(s) = &args[0] else {
        return Err(Error::runtime(format!("subs expects a string, got {}", args[0].type_name())));
    };
    let chars: Vec<char> = s.chars().collect();
    let start = number("subs", &args[1])?;
    let end = match args.get(2) {
        Some(end) => number("subs", end)?,
        None => chars.len() as f64,
    };
    if start < 0.0 || end < start || end > chars.len() as f64 {
        return Err(Error::runtime(format!("String index out of range: {}", end)));
    }
    Ok(Value::string(chars[start as usize..end as usize].iter().collect::<String>()))
}

fn name(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("name", &args, 1)?;
    match &args[0] {
        Value::Keyword(s) | Value::Symbol(s) => {
            let short = s.rsplit_once('/').map_or(&**s, |(_, n)| n);
            Ok(Value::string(short))
        }
        Value::String(s) => Ok(Value::String(s.clone())),
        other => Err(Error::runtime(format!("Doesn't support name: {}", other.type_name()))),
    }
}

fn keyword(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("keyword", &args, 1)?;
    match &args[0] {
        Value::Keyword(k) => Ok(Value::Keyword(k.clone())),
        Value::String(s) | Value::Symbol(s) => Ok(Value::Keyword(s.clone())),
        _ => Ok(Value::Nil),
    }
}

fn symbol(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("symbol", &args, 1)?;
    match &args[0] {
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => Ok(Value::Symbol(s.clone())),
        other => Err(Error::runtime(format!("Cannot make a symbol from {}", other.type_name()))),
    }
}

fn atom(_: &mut NativeCtx<'_>, mut args: Vec<Value>) -> Result<Value, Error> {
    arity("atom", &args, 1)?;
    Ok(Value::Atom(Rc::new(RefCell::new(args.remove(0)))))
}

fn deref(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("deref", &args, 1)?;
    match &args[0] {
        Value::Atom(cell) => Ok(cell.borrow().clone()),
        Value::Var(name) => Ok(Value::Var(name.clone())),
        other => Err(Error::runtime(format!("Cannot deref {}", other.type_name()))),
    }
}

fn reset(_: &mut NativeCtx<'_>, mut args: Vec<Value>) -> Result<Value, Error> {
    arity("reset!", &args, 2)?;
    let value = args.remove(1);
    match &args[0] {
        Value::Atom(cell) => {
            *cell.borrow_mut() = value.clone();
            Ok(value)
        }
        other => Err(Error::runtime(format!("reset! expects an atom, got {}", other.type_name()))),
    }
}

fn joined(args: &[Value], render: fn(&Value) -> String) -> String {
    args.iter().map(render).collect::<Vec<_>>().join(" ")
}

fn print(ctx: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    ctx.output.print(joined(&args, Value::to_string));
    Ok(Value::Nil)
}

fn prn(ctx: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    ctx.output.print(joined(&args, Value::pr_str));
    Ok(Value::Nil)
}

fn pr_str(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    Ok(Value::string(joined(&args, Value::pr_str)))
}

fn ex_info(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity_between("ex-info", &args, 1, 2)?;
    let data = args.get(1).cloned().unwrap_or_default();
    Ok(Value::error(args[0].to_str(), data))
}

fn ex_message(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("ex-message", &args, 1)?;
    match &args[0] {
        Value::Error(e) => Ok(Value::string(&e.message)),
        _ => Ok(Value::Nil),
    }
}

fn ex_data(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("ex-data", &args, 1)?;
    match &args[0] {
        Value::Error(e) => Ok(e.data.clone()),
        _ => Ok(Value::Nil),
    }
}

fn type_of(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("type", &args, 1)?;
    Ok(Value::keyword(args[0].type_name()))
}

fn json_encode(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("json-encode", &args, 1)?;
    args[0].to_json().map(Value::string).map_err(Error::runtime)
}

fn json_decode(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("json-decode", &args, 1)?;
    Value::from_json(&args[0].to_str()).map_err(Error::Runtime)
}

fn provide(ctx: &mut NativeCtx<'_>, mut args: Vec<Value>) -> Result<Value, Error> {
    arity("provide", &args, 2)?;
    let value = args.remove(1);
    ctx.bridge.provide(&args[0].to_str(), value.clone());
    Ok(value)
}

fn require(ctx: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    arity("require", &args, 1)?;
    ctx.bridge.require(&args[0].to_str())
}

fn console_log(_: &mut NativeCtx<'_>, args: Vec<Value>) -> Result<Value, Error> {
    let line = joined(&args, Value::to_string);
    tracing::info!(target: "lumen::console", "{}", line);
    Ok(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, Error> {
        call_with(&OutputSink::new(), CORE_NS, name, args)
    }

    fn call_with(output: &OutputSink, ns: &str, name: &str, args: Vec<Value>) -> Result<Value, Error> {
        let bridge = HostBridge::new();
        install(&bridge);
        let mut ctx = NativeCtx {
            output,
            bridge: &bridge,
        };
        match bridge.resolve(ns, name, false)? {
            Value::Native(Native {
                kind: NativeKind::Fn(f),
                ..
            }) => f(&mut ctx, args),
            other => panic!("{} is not a plain native: {:?}", name, other),
        }
    }

    fn nums(ns: &[f64]) -> Vec<Value> {
        ns.iter().map(|n| Value::Number(*n)).collect()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(call("+", nums(&[1.0, 2.0, 3.0])).unwrap(), Value::Number(6.0));
        assert_eq!(call("+", vec![]).unwrap(), Value::Number(0.0));
        assert_eq!(call("-", nums(&[5.0])).unwrap(), Value::Number(-5.0));
        assert_eq!(call("-", nums(&[10.0, 3.0, 2.0])).unwrap(), Value::Number(5.0));
        assert_eq!(call("/", nums(&[1.0, 2.0])).unwrap(), Value::Number(0.5));
        assert_eq!(call("mod", nums(&[-7.0, 3.0])).unwrap(), Value::Number(2.0));
        assert_eq!(call("rem", nums(&[-7.0, 3.0])).unwrap(), Value::Number(-1.0));

        let err = call("+", vec![Value::Number(1.0), Value::string("a")]).unwrap_err();
        assert_eq!(err.to_string(), "+ expects a number, got string");
    }

    #[test]
    fn test_comparison_chains() {
        assert_eq!(call("<", nums(&[1.0, 2.0, 3.0])).unwrap(), Value::Bool(true));
        assert_eq!(call("<", nums(&[1.0, 3.0, 2.0])).unwrap(), Value::Bool(false));
        assert_eq!(call("=", vec![Value::vector(nums(&[1.0])), Value::list(nums(&[1.0]))]).unwrap(), Value::Bool(true));
        assert!(call("<", vec![Value::Number(1.0), Value::Nil]).is_err());
    }

    #[test]
    fn test_sequence_functions_on_shared_storage() {
        let l = Value::list(nums(&[1.0, 2.0, 3.0]));
        assert_eq!(call("rest", vec![l.clone()]).unwrap(), Value::list(nums(&[2.0, 3.0])));
        assert_eq!(call("rest", vec![Value::Nil]).unwrap(), Value::list(vec![]));
        assert_eq!(call("first", vec![Value::Nil]).unwrap(), Value::Nil);
        assert_eq!(call("next", vec![Value::string("ab")]).unwrap(), Value::list(vec![Value::Char('b')]));
        assert_eq!(
            call("cons", vec![Value::Number(0.0), l.clone()]).unwrap(),
            Value::list(nums(&[0.0, 1.0, 2.0, 3.0]))
        );
        assert_eq!(call("conj", vec![Value::Nil, Value::Number(1.0), Value::Number(2.0)]).unwrap(), Value::list(nums(&[2.0, 1.0])));
        assert_eq!(
            call("conj", vec![Value::set(nums(&[1.0])), Value::Number(1.0), Value::Number(2.0)]).unwrap(),
            Value::set(nums(&[1.0, 2.0]))
        );
        assert_eq!(
            call("assoc", vec![Value::vector(nums(&[1.0])), Value::Number(0.0), Value::Number(5.0)]).unwrap(),
            Value::vector(nums(&[5.0]))
        );
        // The original is untouched.
        assert_eq!(l, Value::list(nums(&[1.0, 2.0, 3.0])));
    }

    #[test]
    fn test_range_limits() {
        let err = call("range", nums(&[f64::INFINITY])).unwrap_err();
        assert_eq!(err.to_string(), "range bounds must be finite");
        assert!(call("range", nums(&[0.0, f64::NAN])).is_err());
        assert!(call("range", nums(&[0.0, 1.0, 0.0])).is_err());

        let err = call("range", nums(&[1e12])).unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"), "{}", err);

        // Steps too small to move the float still terminate.
        let big = call("range", nums(&[1e16, 1e16 + 10.0])).unwrap();
        assert_eq!(call("count", vec![big]).unwrap(), Value::Number(10.0));

        let last = call("range", nums(&[MAX_RANGE as f64])).unwrap();
        assert_eq!(call("count", vec![last]).unwrap(), Value::Number(MAX_RANGE as f64));
    }

    #[test]
    fn test_console_log_bypasses_output() {
        let output = OutputSink::new();
        let result = call_with(&output, HOST_NS, "console-log", vec![Value::string("hi"), Value::Number(1.0)]);
        assert_eq!(result.unwrap(), Value::Nil);
        assert!(output.is_empty());
    }

    #[test]
    fn test_collections() {
        let v = Value::vector(nums(&[1.0, 2.0, 3.0]));
        assert_eq!(call("count", vec![v.clone()]).unwrap(), Value::Number(3.0));
        assert_eq!(call("first", vec![v.clone()]).unwrap(), Value::Number(1.0));
        assert_eq!(call("next", vec![Value::vector(nums(&[1.0]))]).unwrap(), Value::Nil);
        assert_eq!(call("conj", vec![v.clone(), Value::Number(4.0)]).unwrap(), Value::vector(nums(&[1.0, 2.0, 3.0, 4.0])));
        assert_eq!(call("conj", vec![Value::list(nums(&[1.0])), Value::Number(0.0)]).unwrap(), Value::list(nums(&[0.0, 1.0])));
        assert_eq!(call("nth", vec![v.clone(), Value::Number(2.0)]).unwrap(), Value::Number(3.0));
        assert!(call("nth", vec![v, Value::Number(9.0)]).is_err());
        assert_eq!(call("range", nums(&[3.0])).unwrap(), Value::list(nums(&[0.0, 1.0, 2.0])));
        assert_eq!(call("range", nums(&[1.0, 0.0, -0.5])).unwrap(), Value::list(nums(&[1.0, 0.5])));
        assert_eq!(call("range", nums(&[5.0, 1.0])).unwrap(), Value::list(vec![]));

        let m = call("assoc", vec![Value::Nil, Value::keyword("a"), Value::Number(1.0)]).unwrap();
        assert_eq!(call("get", vec![m.clone(), Value::keyword("a")]).unwrap(), Value::Number(1.0));
        assert_eq!(call("get", vec![m.clone(), Value::keyword("b"), Value::Number(0.0)]).unwrap(), Value::Number(0.0));
        let m = call("dissoc", vec![m, Value::keyword("a")]).unwrap();
        assert_eq!(call("count", vec![m]).unwrap(), Value::Number(0.0));
    }

    #[test]
    fn test_strings_and_sort() {
        let s = call("str", vec![Value::string("a"), Value::Nil, Value::Number(1.0), Value::keyword("k")]).unwrap();
        assert_eq!(s, Value::string("a1:k"));
        assert_eq!(call("subs", vec![Value::string("hello"), Value::Number(1.0), Value::Number(3.0)]).unwrap(), Value::string("el"));
        assert_eq!(call("name", vec![Value::keyword("ns/kw")]).unwrap(), Value::string("kw"));
        assert_eq!(call("sort", vec![Value::vector(nums(&[3.0, 1.0, 2.0]))]).unwrap(), Value::list(nums(&[1.0, 2.0, 3.0])));
        assert!(call("sort", vec![Value::vector(vec![Value::Number(1.0), Value::Nil])]).is_err());
    }

    #[test]
    fn test_printing_goes_to_the_sink() {
        let output = OutputSink::new();
        let bridge = HostBridge::new();
        let mut ctx = NativeCtx {
            output: &output,
            bridge: &bridge,
        };
        print(&mut ctx, vec![Value::string("a"), Value::Number(1.0)]).unwrap();
        prn(&mut ctx, vec![Value::string("a")]).unwrap();
        assert_eq!(output.lines(), vec!["a 1".to_string(), "\"a\"".to_string()]);
    }

    #[test]
    fn test_host_bridge_natives() {
        let output = OutputSink::new();
        let bridge = HostBridge::new();
        let mut ctx = NativeCtx {
            output: &output,
            bridge: &bridge,
        };
        assert!(require(&mut ctx, vec![Value::string("widgets")]).is_err());
        provide(&mut ctx, vec![Value::string("widgets"), Value::Number(7.0)]).unwrap();
        assert_eq!(require(&mut ctx, vec![Value::string("widgets")]).unwrap(), Value::Number(7.0));
    }

    #[test]
    fn test_json_natives() {
        let decoded = call("json-decode", vec![Value::string(r#"{"a": [1, 2]}"#)]).unwrap();
        assert_eq!(
            call("get", vec![decoded.clone(), Value::keyword("a")]).unwrap(),
            Value::vector(nums(&[1.0, 2.0]))
        );
        assert_eq!(call("json-encode", vec![decoded]).unwrap(), Value::string(r#"{"a":[1.0,2.0]}"#));
    }
}
