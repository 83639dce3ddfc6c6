/// The Lumen reader: turns source text into forms, one top-level form at a time.

use std::collections::BTreeSet;
use std::iter::Peekable;
use std::str::Chars;

use crate::error::ReadError;
use crate::form::{Atom, CollKind, Form, FormKind, Position, Span};

/// Maximum nesting of forms before the reader gives up.
pub const MAX_DEPTH: usize = 128;

/// Streaming reader over a source string.
///
/// Iterating yields each top-level form in order. After the first error the
/// iterator is exhausted.
pub struct Reader<'a> {
    chars: Peekable<Chars<'a>>,
    /// Position of the next character.
    line: usize,
    column: usize,
    /// Position of the most recently consumed character.
    last: Position,
    depth: usize,
    failed: bool,
}

impl<'a> Reader<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            last: Position::new(1, 1),
            depth: 0,
            failed: false,
        }
    }

    /// Read the next top-level form, or `None` at end of input.
    pub fn read_form(&mut self) -> Result<Option<Form>, ReadError> {
        loop {
            self.skip_trivia();
            match self.peek() {
                None => return Ok(None),
                Some(c) if is_closing(c) => {
                    let at = self.here();
                    self.bump();
                    return Err(ReadError::UnmatchedDelimiter { delimiter: c, at });
                }
                Some(_) => {
                    if let Some(form) = self.read_element()? {
                        return Ok(Some(form));
                    }
                }
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.last = self.here();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn here(&self) -> Position {
        Position::new(self.line, self.column)
    }

    /// Skip whitespace, commas and line comments.
    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' {
                self.bump();
            } else if c == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    /// Read one element. Returns `None` when the element was a `#_` discard.
    fn read_element(&mut self) -> Result<Option<Form>, ReadError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ReadError::TooDeep {
                max: MAX_DEPTH,
                at: self.here(),
            });
        }
        let result = self.read_element_inner();
        self.depth -= 1;
        result
    }

    fn read_element_inner(&mut self) -> Result<Option<Form>, ReadError> {
        let start = self.here();
        let Some(c) = self.peek() else {
            return Err(ReadError::UnexpectedEof {
                context: "expected a form",
                at: start,
            });
        };

        let form = match c {
            '(' => self.read_collection(CollKind::List, '(', ')')?,
            '[' => self.read_collection(CollKind::Vector, '[', ']')?,
            '{' => self.read_collection(CollKind::Map, '{', '}')?,
            ')' | ']' | '}' => {
                self.bump();
                return Err(ReadError::UnmatchedDelimiter { delimiter: c, at: start });
            }
            '"' => self.read_string()?,
            '\\' => self.read_char()?,
            ':' => self.read_keyword()?,
            '\'' => self.read_wrapped("quote", "expected a form after quote")?,
            '@' => self.read_wrapped("deref", "expected a form after deref")?,
            '^' => self.read_meta()?,
            '#' => return self.read_dispatch(),
            '`' | '~' => {
                self.bump();
                return Err(ReadError::InvalidToken {
                    token: c.to_string(),
                    at: start,
                });
            }
            _ => self.read_token_form()?,
        };
        Ok(Some(form))
    }

    /// Read a form that must be present (skipping discards).
    fn read_required(&mut self, context: &'static str) -> Result<Form, ReadError> {
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(ReadError::UnexpectedEof {
                        context,
                        at: self.here(),
                    })
                }
                Some(_) => {
                    if let Some(form) = self.read_element()? {
                        return Ok(form);
                    }
                }
            }
        }
    }

    fn read_collection(&mut self, kind: CollKind, open: char, close: char) -> Result<Form, ReadError> {
        let opened = self.here();
        self.bump();
        self.read_items(kind, open, close, opened)
    }

    fn read_items(
        &mut self,
        kind: CollKind,
        open: char,
        close: char,
        opened: Position,
    ) -> Result<Form, ReadError> {
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    return Err(ReadError::UnclosedDelimiter {
                        open,
                        opened,
                        at: self.here(),
                    })
                }
                Some(c) if c == close => {
                    self.bump();
                    break;
                }
                Some(c) if is_closing(c) => {
                    let at = self.here();
                    self.bump();
                    return Err(ReadError::UnmatchedDelimiter { delimiter: c, at });
                }
                Some(_) => {
                    if let Some(form) = self.read_element()? {
                        items.push(form);
                    }
                }
            }
        }

        if kind == CollKind::Map && items.len() % 2 != 0 {
            return Err(ReadError::OddMap { at: opened });
        }
        Ok(Form::collection(kind, items, Span::new(opened, self.last)))
    }

    /// `'x` and `@x` expand to `(quote x)` and `(deref x)`.
    fn read_wrapped(&mut self, head: &str, context: &'static str) -> Result<Form, ReadError> {
        let start = self.here();
        self.bump();
        let inner = self.read_required(context)?;
        let span = Span::new(start, inner.span.end);
        Ok(Form::list(vec![Form::symbol(head, Span::point(start)), inner], span))
    }

    fn read_meta(&mut self) -> Result<Form, ReadError> {
        let caret = self.here();
        self.bump();
        let meta = self.read_required("expected metadata after '^'")?;
        let tags = tags_from_meta(&meta).ok_or(ReadError::InvalidMetadata { at: caret })?;
        let mut target = self.read_required("expected a form after metadata")?;

        let merged = target.tags.get_or_insert_with(BTreeSet::new);
        merged.extend(tags);
        target.span.start = caret;
        Ok(target)
    }

    fn read_dispatch(&mut self) -> Result<Option<Form>, ReadError> {
        let start = self.here();
        self.bump();
        match self.peek() {
            Some('{') => {
                self.bump();
                self.read_items(CollKind::Set, '{', '}', start).map(Some)
            }
            Some('_') => {
                self.bump();
                self.read_required("expected a form after '#_'")?;
                Ok(None)
            }
            Some('#') => {
                self.bump();
                let token = self.take_token();
                let value = match token.as_str() {
                    "Inf" => f64::INFINITY,
                    "-Inf" => f64::NEG_INFINITY,
                    "NaN" => f64::NAN,
                    _ => {
                        return Err(ReadError::InvalidToken {
                            token: format!("##{}", token),
                            at: start,
                        })
                    }
                };
                Ok(Some(Form::atom(Atom::Float(value), Span::new(start, self.last))))
            }
            Some(c) => Err(ReadError::UnsupportedDispatch { dispatch: c, at: start }),
            None => Err(ReadError::UnexpectedEof {
                context: "expected a dispatch character after '#'",
                at: self.here(),
            }),
        }
    }

    fn read_string(&mut self) -> Result<Form, ReadError> {
        let opened = self.here();
        self.bump();
        let mut text = String::new();
        loop {
            let at = self.here();
            match self.bump() {
                None => {
                    return Err(ReadError::UnclosedDelimiter {
                        open: '"',
                        opened,
                        at,
                    })
                }
                Some('"') => break,
                Some('\\') => text.push(self.read_escape(at)?),
                Some(c) => text.push(c),
            }
        }
        Ok(Form::atom(Atom::Str(text), Span::new(opened, self.last)))
    }

    fn read_escape(&mut self, at: Position) -> Result<char, ReadError> {
        let Some(c) = self.bump() else {
            return Err(ReadError::UnexpectedEof {
                context: "unterminated string escape",
                at: self.here(),
            });
        };
        Ok(match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            '0' => '\0',
            '"' => '"',
            '\\' => '\\',
            'u' => {
                let mut hex = String::new();
                for _ in 0..4 {
                    match self.bump() {
                        Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                        _ => {
                            return Err(ReadError::InvalidEscape {
                                escape: format!("u{}", hex),
                                at,
                            })
                        }
                    }
                }
                u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| ReadError::InvalidEscape {
                        escape: format!("u{}", hex),
                        at,
                    })?
            }
            other => {
                return Err(ReadError::InvalidEscape {
                    escape: other.to_string(),
                    at,
                })
            }
        })
    }

    fn read_char(&mut self) -> Result<Form, ReadError> {
        let start = self.here();
        self.bump();
        let Some(first) = self.bump() else {
            return Err(ReadError::UnexpectedEof {
                context: "expected a character after '\\'",
                at: self.here(),
            });
        };
        let mut name = first.to_string();
        name.push_str(&self.take_token());

        let c = if name.chars().count() == 1 {
            first
        } else {
            match name.as_str() {
                "newline" => '\n',
                "space" => ' ',
                "tab" => '\t',
                "return" => '\r',
                "backspace" => '\u{8}',
                "formfeed" => '\u{c}',
                _ => name
                    .strip_prefix('u')
                    .filter(|hex| hex.len() == 4)
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .and_then(char::from_u32)
                    .ok_or_else(|| ReadError::InvalidCharacter {
                        name: name.clone(),
                        at: start,
                    })?,
            }
        };
        Ok(Form::atom(Atom::Char(c), Span::new(start, self.last)))
    }

    fn read_keyword(&mut self) -> Result<Form, ReadError> {
        let start = self.here();
        self.bump();
        let name = self.take_token();
        if name.is_empty() || name.starts_with(':') {
            return Err(ReadError::InvalidToken {
                token: format!(":{}", name),
                at: start,
            });
        }
        Ok(Form::atom(Atom::Keyword(name), Span::new(start, self.last)))
    }

    fn read_token_form(&mut self) -> Result<Form, ReadError> {
        let start = self.here();
        let token = self.take_token();
        let atom = parse_atom(&token).map_err(|()| ReadError::InvalidNumber {
            token: token.clone(),
            at: start,
        })?;
        Ok(Form::atom(atom, Span::new(start, self.last)))
    }

    /// Consume characters up to the next delimiter.
    fn take_token(&mut self) -> String {
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if is_delimiter(c) {
                break;
            }
            token.push(c);
            self.bump();
        }
        token
    }
}

impl Iterator for Reader<'_> {
    type Item = Result<Form, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.read_form() {
            Ok(Some(form)) => Some(Ok(form)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Read every top-level form in `source`.
pub fn read_all(source: &str) -> Result<Vec<Form>, ReadError> {
    Reader::new(source).collect()
}

fn is_closing(c: char) -> bool {
    matches!(c, ')' | ']' | '}')
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';' | '^')
}

fn looks_numeric(token: &str) -> bool {
    let digits = token.strip_prefix(['+', '-']).unwrap_or(token);
    digits.starts_with(|c: char| c.is_ascii_digit())
}

fn parse_atom(token: &str) -> Result<Atom, ()> {
    match token {
        "nil" => return Ok(Atom::Nil),
        "true" => return Ok(Atom::Bool(true)),
        "false" => return Ok(Atom::Bool(false)),
        _ => {}
    }
    if !looks_numeric(token) {
        return Ok(Atom::Symbol(token.to_string()));
    }

    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        let n = i64::from_str_radix(hex, 16).map_err(|_| ())?;
        return Ok(Atom::Int(if negative { -n } else { n }));
    }
    if digits.chars().all(|c| c.is_ascii_digit()) {
        return match token.parse::<i64>() {
            Ok(n) => Ok(Atom::Int(n)),
            // Too large for an integer: keep the magnitude as a float.
            Err(_) => token.parse::<f64>().map(Atom::Float).map_err(|_| ()),
        };
    }
    if digits.contains(['.', 'e', 'E']) {
        return token.parse::<f64>().map(Atom::Float).map_err(|_| ());
    }
    Err(())
}

/// Tags contributed by one `^meta` prefix.
fn tags_from_meta(meta: &Form) -> Option<BTreeSet<String>> {
    let mut tags = BTreeSet::new();
    match &meta.kind {
        FormKind::Atom(Atom::Symbol(name) | Atom::Keyword(name) | Atom::Str(name)) => {
            tags.insert(name.clone());
        }
        FormKind::Collection(CollKind::Map, items) => {
            for pair in items.chunks(2) {
                let (key, value) = (&pair[0], &pair[1]);
                match (key.as_keyword(), value.as_atom()) {
                    (Some("tag"), Some(Atom::Symbol(name) | Atom::Str(name))) => {
                        tags.insert(name.clone());
                    }
                    (Some(name), Some(Atom::Bool(true))) => {
                        tags.insert(name.to_string());
                    }
                    _ => {}
                }
            }
        }
        _ => return None,
    }
    Some(tags)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(source: &str) -> Form {
        let forms = read_all(source).expect("read failed");
        assert_eq!(forms.len(), 1, "expected one form in {:?}", source);
        forms.into_iter().next().unwrap()
    }

    #[test]
    fn test_read_atoms() {
        assert_eq!(read_one("42").as_atom(), Some(&Atom::Int(42)));
        assert_eq!(read_one("-7").as_atom(), Some(&Atom::Int(-7)));
        assert_eq!(read_one("1.5").as_atom(), Some(&Atom::Float(1.5)));
        assert_eq!(read_one("2e3").as_atom(), Some(&Atom::Float(2000.0)));
        assert_eq!(read_one("0x1F").as_atom(), Some(&Atom::Int(31)));
        assert_eq!(read_one("nil").as_atom(), Some(&Atom::Nil));
        assert_eq!(read_one("false").as_atom(), Some(&Atom::Bool(false)));
        assert_eq!(read_one(":ns/key").as_keyword(), Some("ns/key"));
        assert_eq!(read_one("swap!").as_symbol(), Some("swap!"));
        assert_eq!(read_one("-").as_symbol(), Some("-"));
        assert_eq!(read_one("\\newline").as_atom(), Some(&Atom::Char('\n')));
        assert_eq!(read_one("\\(").as_atom(), Some(&Atom::Char('(')));
        assert_eq!(
            read_one(r#""a\tbA""#).as_atom(),
            Some(&Atom::Str("a\tbA".to_string()))
        );
    }

    #[test]
    fn test_read_collections_and_spans() {
        let form = read_one("(foo [1 2]\n  {:a #{3}})");
        assert_eq!(form.span, Span::new(Position::new(1, 1), Position::new(2, 12)));
        let items = form.as_list().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_vector().unwrap().len(), 2);
        assert_eq!(items[1].span.start, Position::new(1, 6));
        assert_eq!(items[2].span.start, Position::new(2, 3));
        match &items[2].kind {
            FormKind::Collection(CollKind::Map, entries) => {
                assert!(matches!(entries[1].kind, FormKind::Collection(CollKind::Set, _)));
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_quote_deref_and_discard() {
        assert_eq!(read_one("'x").to_string(), "(quote x)");
        assert_eq!(read_one("@state").to_string(), "(deref state)");
        assert_eq!(read_one("(a #_b c)").to_string(), "(a c)");
        assert!(read_all("; only a comment\n#_(ignored)").unwrap().is_empty());
    }

    #[test]
    fn test_metadata_tags() {
        let form = read_one("^editor (slider 1 10)");
        assert!(form.has_exact_tag("editor"));
        assert_eq!(form.span.start, Position::new(1, 1));

        let form = read_one("^:editor ^:wide [1]");
        let tags = form.tags.clone().unwrap();
        assert_eq!(tags.len(), 2);
        assert!(!form.has_exact_tag("editor"));

        let form = read_one("^{:tag editor :private false} (x)");
        assert!(form.has_exact_tag("editor"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            read_all("(+ 1 2"),
            Err(ReadError::UnclosedDelimiter { open: '(', .. })
        ));
        assert!(matches!(
            read_all("(a))"),
            Err(ReadError::UnmatchedDelimiter { delimiter: ')', .. })
        ));
        assert!(matches!(read_all("{:a}"), Err(ReadError::OddMap { .. })));
        assert!(matches!(read_all("\"abc"), Err(ReadError::UnclosedDelimiter { open: '"', .. })));
        assert!(matches!(read_all("1abc"), Err(ReadError::InvalidNumber { .. })));
        assert!(matches!(read_all("#(inc %)"), Err(ReadError::UnsupportedDispatch { dispatch: '(', .. })));
        assert!(matches!(read_all("^1 x"), Err(ReadError::InvalidMetadata { .. })));

        let deep = "(".repeat(MAX_DEPTH + 1);
        assert!(matches!(read_all(&deep), Err(ReadError::TooDeep { .. })));
    }

    #[test]
    fn test_nesting_up_to_the_limit_reads() {
        let source = format!("{}{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        let form = read_one(&source);
        assert_eq!(form.to_string(), source);

        let too_deep = format!("{}{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        assert!(matches!(read_all(&too_deep), Err(ReadError::TooDeep { max: MAX_DEPTH, .. })));
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut reader = Reader::new("(ok) (broken");
        assert!(matches!(reader.next(), Some(Ok(_))));
        assert!(matches!(reader.next(), Some(Err(_))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_display_round_trip() {
        let source = r#"(defn f [x & more] {:a "s\n" :b \space :c 1.0 :d #{nil}})"#;
        let form = read_one(source);
        let reprinted = read_one(&form.to_string());
        assert_eq!(reprinted.to_string(), form.to_string());
    }
}
