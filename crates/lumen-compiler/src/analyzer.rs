//! Namespace declarations and macro expansion.
//!
//! The analyzer reads the leading `(ns ...)` form of a unit and rewrites the
//! built-in macros into core forms. Generated forms reuse the span of the
//! macro call they came from.

use std::cell::Cell;
use std::collections::BTreeMap;

use lumen_reader::{Atom, CollKind, Form, FormKind, Span};

/// Macros expanded by [`Analyzer::expand`].
pub const MACROS: &[&str] = &[
    "defn", "defn-", "fn", "let", "loop", "when", "when-not", "if-not", "if-let", "when-let",
    "cond", "and", "or", "->", "->>", "dotimes", "while", "doseq", "comment", "declare",
];

/// Expansions of a single form before giving up.
const MAX_EXPANSIONS: usize = 256;

/// One entry of a `:require` or `:require-macros` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Require {
    pub namespace: String,
    pub alias: Option<String>,
    pub refers: Vec<String>,
    pub is_macro: bool,
}

/// A parsed `(ns name ...)` declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NsDecl {
    pub name: String,
    pub requires: Vec<Require>,
}

impl NsDecl {
    /// Alias to namespace, for the unit header.
    pub fn aliases(&self) -> BTreeMap<&str, &str> {
        self.requires
            .iter()
            .filter_map(|r| Some((r.alias.as_deref()?, r.namespace.as_str())))
            .collect()
    }

    /// Referred name to namespace, for the unit header.
    pub fn refers(&self) -> BTreeMap<&str, &str> {
        self.requires
            .iter()
            .flat_map(|r| r.refers.iter().map(move |name| (name.as_str(), r.namespace.as_str())))
            .collect()
    }
}

/// Macro expander for one unit.
pub struct Analyzer {
    gensym: Cell<usize>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self { gensym: Cell::new(0) }
    }

    fn gensym(&self, prefix: &str, span: Span) -> Form {
        let n = self.gensym.get() + 1;
        self.gensym.set(n);
        Form::symbol(format!("{}__{}__auto__", prefix, n), span)
    }

    /// Parse `form` as an `ns` declaration, or `Ok(None)` if it is not one.
    pub fn parse_ns(&self, form: &Form) -> Result<Option<NsDecl>, String> {
        if form.head_symbol() != Some("ns") {
            return Ok(None);
        }
        let items = form.children();
        let name = items
            .get(1)
            .and_then(Form::as_symbol)
            .ok_or_else(|| at(form, "ns expects a namespace name"))?;

        let mut decl = NsDecl {
            name: name.to_string(),
            requires: Vec::new(),
        };
        for clause in &items[2..] {
            // Docstrings and attribute maps are allowed and ignored.
            if !matches!(clause.kind, FormKind::Collection(CollKind::List, _)) {
                continue;
            }
            let is_macro = match clause.children().first().and_then(Form::as_keyword) {
                Some("require") => false,
                Some("require-macros") => true,
                Some(other) => {
                    tracing::warn!("ignoring unsupported ns clause :{} in {}", other, name);
                    continue;
                }
                None => return Err(at(clause, "ns clauses must start with a keyword")),
            };
            for spec in &clause.children()[1..] {
                decl.requires.push(parse_require(spec, is_macro)?);
            }
        }
        Ok(Some(decl))
    }

    /// Expand every macro in `form`, recursively.
    pub fn expand(&self, form: &Form) -> Result<Form, String> {
        let mut current = form.clone();
        for _ in 0..MAX_EXPANSIONS {
            match self.expand_once(&current)? {
                Some(expanded) => current = expanded,
                None => return self.expand_children(current),
            }
        }
        Err(at(form, "macro expansion did not terminate"))
    }

    fn expand_children(&self, form: Form) -> Result<Form, String> {
        let Form { kind, span, tags } = form;
        let kind = match kind {
            FormKind::Collection(CollKind::List, items)
                if items.first().and_then(Form::as_symbol) == Some("quote") =>
            {
                FormKind::Collection(CollKind::List, items)
            }
            FormKind::Collection(coll, items) => FormKind::Collection(
                coll,
                items.iter().map(|item| self.expand(item)).collect::<Result<_, _>>()?,
            ),
            atom => atom,
        };
        Ok(Form { kind, span, tags })
    }

    /// Expand the head macro of `form` once, `None` if there is none.
    pub fn expand_once(&self, form: &Form) -> Result<Option<Form>, String> {
        let Some(head) = form.head_symbol() else {
            return Ok(None);
        };
        let args = &form.children()[1..];
        let span = form.span;
        let expanded = match head {
            "defn" | "defn-" => self.expand_defn(form, args)?,
            "fn" => list(span, [sym("fn*", span)].into_iter().chain(args.iter().cloned())),
            "let" => core_form("let*", span, args),
            "loop" => core_form("loop*", span, args),
            "when" => {
                let (test, body) = split_test(form, args, "when")?;
                list(span, [sym("if", span), test.clone(), do_form(span, body), Form::nil(span)])
            }
            "when-not" => {
                let (test, body) = split_test(form, args, "when-not")?;
                list(span, [sym("if", span), test.clone(), Form::nil(span), do_form(span, body)])
            }
            "if-not" => match args {
                [test, then] => list(span, [sym("if", span), test.clone(), Form::nil(span), then.clone()]),
                [test, then, otherwise] => {
                    list(span, [sym("if", span), test.clone(), otherwise.clone(), then.clone()])
                }
                _ => return Err(at(form, "if-not expects a test, a then branch and an optional else branch")),
            },
            "if-let" | "when-let" => self.expand_conditional_let(form, head, args)?,
            "cond" => expand_cond(form, args)?,
            "and" => self.expand_logic(span, args, true),
            "or" => self.expand_logic(span, args, false),
            "->" | "->>" => expand_thread(form, args, head == "->>")?,
            "dotimes" => self.expand_dotimes(form, args)?,
            "while" => {
                let (test, body) = split_test(form, args, "while")?;
                let mut step: Vec<Form> = body.to_vec();
                step.push(list(span, [sym("recur", span)]));
                let branch = do_form(span, &step);
                list(
                    span,
                    [
                        sym("loop*", span),
                        Form::vector(Vec::new(), span),
                        list(span, [sym("if", span), test.clone(), branch, Form::nil(span)]),
                    ],
                )
            }
            "doseq" => self.expand_doseq(form, args)?,
            "comment" => Form::nil(span),
            "declare" => {
                let mut defs = vec![sym("do", span)];
                for name in args {
                    if name.as_symbol().is_none() {
                        return Err(at(form, "declare expects symbols"));
                    }
                    defs.push(list(span, [sym("def", span), name.clone()]));
                }
                list(span, defs)
            }
            "ns" => return Err(at(form, "ns must be the first form of a unit")),
            _ => return Ok(None),
        };
        Ok(Some(expanded))
    }

    fn expand_defn(&self, form: &Form, args: &[Form]) -> Result<Form, String> {
        let span = form.span;
        let Some((name, rest)) = args.split_first() else {
            return Err(at(form, "defn expects a name"));
        };
        if name.as_symbol().is_none() {
            return Err(at(form, "defn name must be a symbol"));
        }
        let mut rest = rest;
        if let Some((Form { kind: FormKind::Atom(Atom::Str(_)), .. }, tail)) = rest.split_first() {
            rest = tail;
        }
        if let Some((Form { kind: FormKind::Collection(CollKind::Map, _), .. }, tail)) = rest.split_first() {
            rest = tail;
        }
        if rest.is_empty() {
            return Err(at(form, "defn expects a parameter vector or arity clauses"));
        }
        let function = list(
            span,
            [sym("fn*", span), name.clone()].into_iter().chain(rest.iter().cloned()),
        );
        Ok(list(span, [sym("def", span), name.clone(), function]))
    }

    fn expand_conditional_let(&self, form: &Form, head: &str, args: &[Form]) -> Result<Form, String> {
        let span = form.span;
        let Some((bindings, body)) = args.split_first() else {
            return Err(at(form, &format!("{} expects a binding vector", head)));
        };
        let [name, init] = bindings.as_vector().unwrap_or_default() else {
            return Err(at(form, &format!("{} expects exactly one binding", head)));
        };
        let temp = self.gensym("temp", span);
        let (then, otherwise) = if head == "if-let" {
            match body {
                [then] => (then.clone(), Form::nil(span)),
                [then, otherwise] => (then.clone(), otherwise.clone()),
                _ => return Err(at(form, "if-let expects a then branch and an optional else branch")),
            }
        } else {
            (do_form(span, body), Form::nil(span))
        };
        let inner = list(
            span,
            [sym("let*", span), Form::vector(vec![name.clone(), temp.clone()], span), then],
        );
        Ok(list(
            span,
            [
                sym("let*", span),
                Form::vector(vec![temp.clone(), init.clone()], span),
                list(span, [sym("if", span), temp, inner, otherwise]),
            ],
        ))
    }

    fn expand_logic(&self, span: Span, args: &[Form], is_and: bool) -> Form {
        match args {
            [] => {
                if is_and {
                    Form::atom(Atom::Bool(true), span)
                } else {
                    Form::nil(span)
                }
            }
            [only] => only.clone(),
            [first, rest @ ..] => {
                let temp = self.gensym(if is_and { "and" } else { "or" }, span);
                let head = if is_and { "and" } else { "or" };
                let remaining = list(span, [sym(head, span)].into_iter().chain(rest.iter().cloned()));
                let (then, otherwise) = if is_and {
                    (remaining, temp.clone())
                } else {
                    (temp.clone(), remaining)
                };
                list(
                    span,
                    [
                        sym("let*", span),
                        Form::vector(vec![temp.clone(), first.clone()], span),
                        list(span, [sym("if", span), temp, then, otherwise]),
                    ],
                )
            }
        }
    }

    fn expand_dotimes(&self, form: &Form, args: &[Form]) -> Result<Form, String> {
        let span = form.span;
        let Some((bindings, body)) = args.split_first() else {
            return Err(at(form, "dotimes expects a binding vector"));
        };
        let [name, count] = bindings.as_vector().unwrap_or_default() else {
            return Err(at(form, "dotimes expects [name count]"));
        };
        let limit = self.gensym("n", span);
        let mut step: Vec<Form> = body.to_vec();
        step.push(list(
            span,
            [sym("recur", span), list(span, [core("inc", span), name.clone()])],
        ));
        let test = list(span, [core("<", span), name.clone(), limit.clone()]);
        let iteration = list(
            span,
            [
                sym("loop*", span),
                Form::vector(vec![name.clone(), Form::atom(Atom::Int(0), span)], span),
                list(span, [sym("if", span), test, do_form(span, &step), Form::nil(span)]),
            ],
        );
        Ok(list(
            span,
            [sym("let*", span), Form::vector(vec![limit, count.clone()], span), iteration],
        ))
    }

    fn expand_doseq(&self, form: &Form, args: &[Form]) -> Result<Form, String> {
        let span = form.span;
        let Some((bindings, body)) = args.split_first() else {
            return Err(at(form, "doseq expects a binding vector"));
        };
        let [name, coll] = bindings.as_vector().unwrap_or_default() else {
            return Err(at(form, "doseq expects [name collection]"));
        };
        let cursor = self.gensym("seq", span);
        let mut step: Vec<Form> = vec![
            sym("let*", span),
            Form::vector(vec![name.clone(), list(span, [core("first", span), cursor.clone()])], span),
        ];
        step.extend(body.iter().cloned());
        step.push(list(
            span,
            [sym("recur", span), list(span, [core("next", span), cursor.clone()])],
        ));
        Ok(list(
            span,
            [
                sym("loop*", span),
                Form::vector(vec![cursor.clone(), list(span, [core("seq", span), coll.clone()])], span),
                list(span, [sym("if", span), cursor, list(span, step), Form::nil(span)]),
            ],
        ))
    }
}

fn parse_require(spec: &Form, is_macro: bool) -> Result<Require, String> {
    if let Some(name) = spec.as_symbol() {
        return Ok(Require {
            namespace: name.to_string(),
            alias: None,
            refers: Vec::new(),
            is_macro,
        });
    }
    let Some([name, options @ ..]) = spec.as_vector() else {
        return Err(at(spec, "require specs must be a symbol or a vector"));
    };
    let namespace = name
        .as_symbol()
        .ok_or_else(|| at(spec, "require spec must start with a namespace symbol"))?;
    let mut require = Require {
        namespace: namespace.to_string(),
        alias: None,
        refers: Vec::new(),
        is_macro,
    };
    for pair in options.chunks(2) {
        match (pair[0].as_keyword(), pair.get(1)) {
            (Some("as"), Some(alias)) => {
                let alias = alias.as_symbol().ok_or_else(|| at(spec, ":as expects a symbol"))?;
                require.alias = Some(alias.to_string());
            }
            (Some("refer"), Some(names)) => {
                let names = names
                    .as_vector()
                    .ok_or_else(|| at(spec, ":refer expects a vector of symbols"))?;
                for name in names {
                    let name = name.as_symbol().ok_or_else(|| at(spec, ":refer expects a vector of symbols"))?;
                    require.refers.push(name.to_string());
                }
            }
            _ => return Err(at(spec, "require options are :as alias and :refer [names]")),
        }
    }
    Ok(require)
}

fn expand_cond(form: &Form, args: &[Form]) -> Result<Form, String> {
    if args.len() % 2 != 0 {
        return Err(at(form, "cond requires an even number of forms"));
    }
    let span = form.span;
    let mut expanded = Form::nil(span);
    for pair in args.chunks(2).rev() {
        expanded = list(span, [sym("if", span), pair[0].clone(), pair[1].clone(), expanded]);
    }
    Ok(expanded)
}

fn expand_thread(form: &Form, args: &[Form], last: bool) -> Result<Form, String> {
    let Some((initial, steps)) = args.split_first() else {
        return Err(at(form, "threading macros expect an initial value"));
    };
    let mut acc = initial.clone();
    for step in steps {
        acc = match &step.kind {
            FormKind::Collection(CollKind::List, items) if !items.is_empty() => {
                let mut items = items.clone();
                if last {
                    items.push(acc);
                } else {
                    items.insert(1, acc);
                }
                Form::list(items, step.span)
            }
            _ => Form::list(vec![step.clone(), acc], step.span),
        };
    }
    Ok(acc)
}

fn split_test<'a>(form: &Form, args: &'a [Form], name: &str) -> Result<(&'a Form, &'a [Form]), String> {
    args.split_first()
        .ok_or_else(|| at(form, &format!("{} expects a test", name)))
}

fn core_form(name: &str, span: Span, args: &[Form]) -> Form {
    list(span, [sym(name, span)].into_iter().chain(args.iter().cloned()))
}

fn do_form(span: Span, body: &[Form]) -> Form {
    list(span, [sym("do", span)].into_iter().chain(body.iter().cloned()))
}

fn list(span: Span, items: impl IntoIterator<Item = Form>) -> Form {
    Form::list(items.into_iter().collect(), span)
}

fn sym(name: &str, span: Span) -> Form {
    Form::symbol(name, span)
}

/// A symbol pinned to `lumen.core`, immune to local definitions.
fn core(name: &str, span: Span) -> Form {
    Form::symbol(format!("lumen.core/{}", name), span)
}

fn at(form: &Form, message: &str) -> String {
    format!("{} at {}", message, form.span.start)
}
