/// Syntax tree types for Lumen source
///
/// A `Form` is either an atom or a collection of forms. Every form carries the
/// span it was read from and the tags attached with `^` metadata.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// A 1-based position as reported by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Convert to the 0-based coordinates used by the display.
    pub fn to_zero_based(self) -> Self {
        Self {
            line: self.line.saturating_sub(1),
            column: self.column.saturating_sub(1),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Source range of a form. Both ends are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Zero-width span used for forms synthesized during expansion.
    pub fn point(at: Position) -> Self {
        Self { start: at, end: at }
    }
}

/// Atomic values
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    Keyword(String),
    Symbol(String),
}

/// Collection flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollKind {
    List,
    Vector,
    Map,
    Set,
}

impl CollKind {
    fn delimiters(self) -> (&'static str, &'static str) {
        match self {
            CollKind::List => ("(", ")"),
            CollKind::Vector => ("[", "]"),
            CollKind::Map => ("{", "}"),
            CollKind::Set => ("#{", "}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormKind {
    Atom(Atom),
    Collection(CollKind, Vec<Form>),
}

/// A parsed syntax node
#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub kind: FormKind,
    pub span: Span,
    /// Tags attached with `^` metadata, if any.
    pub tags: Option<BTreeSet<String>>,
}

impl Form {
    pub fn atom(atom: Atom, span: Span) -> Self {
        Self {
            kind: FormKind::Atom(atom),
            span,
            tags: None,
        }
    }

    pub fn collection(kind: CollKind, items: Vec<Form>, span: Span) -> Self {
        Self {
            kind: FormKind::Collection(kind, items),
            span,
            tags: None,
        }
    }

    pub fn list(items: Vec<Form>, span: Span) -> Self {
        Self::collection(CollKind::List, items, span)
    }

    pub fn vector(items: Vec<Form>, span: Span) -> Self {
        Self::collection(CollKind::Vector, items, span)
    }

    pub fn symbol(name: impl Into<String>, span: Span) -> Self {
        Self::atom(Atom::Symbol(name.into()), span)
    }

    pub fn keyword(name: impl Into<String>, span: Span) -> Self {
        Self::atom(Atom::Keyword(name.into()), span)
    }

    pub fn string(text: impl Into<String>, span: Span) -> Self {
        Self::atom(Atom::Str(text.into()), span)
    }

    pub fn nil(span: Span) -> Self {
        Self::atom(Atom::Nil, span)
    }

    pub fn as_atom(&self) -> Option<&Atom> {
        match &self.kind {
            FormKind::Atom(atom) => Some(atom),
            FormKind::Collection(..) => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            FormKind::Atom(Atom::Symbol(name)) => Some(name),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match &self.kind {
            FormKind::Atom(Atom::Keyword(name)) => Some(name),
            _ => None,
        }
    }

    /// Items of a list form.
    pub fn as_list(&self) -> Option<&[Form]> {
        match &self.kind {
            FormKind::Collection(CollKind::List, items) => Some(items),
            _ => None,
        }
    }

    /// Items of a vector form.
    pub fn as_vector(&self) -> Option<&[Form]> {
        match &self.kind {
            FormKind::Collection(CollKind::Vector, items) => Some(items),
            _ => None,
        }
    }

    /// Children of any collection; empty for atoms.
    pub fn children(&self) -> &[Form] {
        match &self.kind {
            FormKind::Collection(_, items) => items,
            FormKind::Atom(_) => &[],
        }
    }

    /// Name of the head symbol when this is a list like `(head ...)`.
    pub fn head_symbol(&self) -> Option<&str> {
        self.as_list()?.first()?.as_symbol()
    }

    /// True when the tag set is exactly `{tag}`.
    pub fn has_exact_tag(&self, tag: &str) -> bool {
        match &self.tags {
            Some(tags) => tags.len() == 1 && tags.contains(tag),
            None => false,
        }
    }

    /// Walk this form with a visitor.
    pub fn accept<V: FormVisitor + ?Sized>(&self, visitor: &mut V) {
        match &self.kind {
            FormKind::Atom(atom) => visitor.visit_atom(self, atom),
            FormKind::Collection(kind, items) => {
                if visitor.visit_collection(self, *kind, items) == Descend::Yes {
                    for item in items {
                        item.accept(visitor);
                    }
                }
            }
        }
    }
}

/// Whether a visitor wants to see a collection's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descend {
    Yes,
    No,
}

/// Recursive visitor over forms.
///
/// Atoms are leaves: `accept` never looks inside them. Collections are
/// descended into unless `visit_collection` returns `Descend::No`.
pub trait FormVisitor {
    fn visit_atom(&mut self, _form: &Form, _atom: &Atom) {}

    fn visit_collection(&mut self, _form: &Form, _kind: CollKind, _items: &[Form]) -> Descend {
        Descend::Yes
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Nil => write!(f, "nil"),
            Atom::Bool(b) => write!(f, "{}", b),
            Atom::Int(n) => write!(f, "{}", n),
            Atom::Float(n) => write_float(f, *n),
            Atom::Str(s) => write_string_literal(f, s),
            Atom::Char(c) => write_char_literal(f, *c),
            Atom::Keyword(k) => write!(f, ":{}", k),
            Atom::Symbol(s) => write!(f, "{}", s),
        }
    }
}

/// Prints forms back as readable source.
impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            for tag in tags {
                write!(f, "^:{} ", tag)?;
            }
        }
        match &self.kind {
            FormKind::Atom(atom) => write!(f, "{}", atom),
            FormKind::Collection(kind, items) => {
                let (open, close) = kind.delimiters();
                f.write_str(open)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(close)
            }
        }
    }
}

pub(crate) fn write_float(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        write!(f, "##NaN")
    } else if n.is_infinite() {
        write!(f, "{}", if n > 0.0 { "##Inf" } else { "##-Inf" })
    } else if n == n.trunc() && n.abs() < 1e15 {
        write!(f, "{:.1}", n)
    } else if n.abs() >= 1e15 {
        write!(f, "{:e}", n)
    } else {
        write!(f, "{}", n)
    }
}

/// Write a string with escapes the reader understands.
pub fn write_string_literal(f: &mut impl fmt::Write, s: &str) -> fmt::Result {
    f.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    f.write_char('"')
}

/// Write a character literal such as `\a` or `\newline`.
pub fn write_char_literal(f: &mut impl fmt::Write, c: char) -> fmt::Result {
    match c {
        '\n' => f.write_str("\\newline"),
        ' ' => f.write_str("\\space"),
        '\t' => f.write_str("\\tab"),
        '\r' => f.write_str("\\return"),
        c => write!(f, "\\{}", c),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::point(Position::new(1, 1))
    }

    #[test]
    fn test_exact_tag_match() {
        let mut form = Form::list(vec![], span());
        assert!(!form.has_exact_tag("editor"));

        form.tags = Some(BTreeSet::from(["editor".to_string()]));
        assert!(form.has_exact_tag("editor"));

        form.tags = Some(BTreeSet::from(["editor".to_string(), "extra".to_string()]));
        assert!(!form.has_exact_tag("editor"));
    }

    #[test]
    fn test_display_prints_readable_source() {
        let form = Form::list(
            vec![
                Form::symbol("str", span()),
                Form::string("a \"b\"\n", span()),
                Form::atom(Atom::Float(2.0), span()),
                Form::atom(Atom::Char(' '), span()),
                Form::collection(CollKind::Set, vec![Form::keyword("k", span())], span()),
            ],
            span(),
        );
        assert_eq!(form.to_string(), r#"(str "a \"b\"\n" 2.0 \space #{:k})"#);
    }

    #[test]
    fn test_zero_based_conversion() {
        assert_eq!(Position::new(1, 1).to_zero_based(), Position::new(0, 0));
        assert_eq!(Position::new(3, 7).to_zero_based(), Position::new(2, 6));
    }
}
