//! The embedded query language.
//!
//! A JSONPath-like expression language, just large enough for recipe
//! lookup: field access, array indexing and slicing, predicate filtering
//! with equality and regex, named `$name` bindings, and a small builtin
//! set (`length`, `keys`, `map`).
//!
//! Grammar sketch:
//!
//! ```text
//! expr     := func | path
//! func     := ident '(' expr (',' ident)* ')'
//! path     := '$' segment*            -- bare '$' is the store root
//!           | '$' ident               -- a named binding
//! segment  := '.' ident | '[' selector ']'
//! selector := int | int? ':' int? | '?' ident ('==' | '~=') rhs
//! rhs      := '$' ident | number | 'str' | "str" | bareword
//! ```

use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

/// Query compilation or evaluation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryError(pub String);

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query error: {}", self.0)
    }
}

impl std::error::Error for QueryError {}

fn err<T>(msg: impl Into<String>) -> Result<T, QueryError> {
    Err(QueryError(msg.into()))
}

/// Evaluate an expression against `root` with named bindings.
pub fn eval(expr: &str, root: &Value, bindings: &Map<String, Value>) -> Result<Value, QueryError> {
    let mut parser = Parser::new(expr);
    let value = parser.expr(root, bindings)?;
    parser.skip_ws();
    if !parser.done() {
        return err(format!("trailing input at byte {}", parser.pos));
    }
    Ok(value)
}

/// Evaluate a reference expression whose final segment is a predicate over
/// a collection array, returning the first match as `(index, record)`.
pub fn locate(
    expr: &str,
    root: &Value,
    bindings: &Map<String, Value>,
) -> Result<Option<(usize, Value)>, QueryError> {
    let mut parser = Parser::new(expr);
    parser.skip_ws();
    if parser.next_char() != Some('$') {
        return err("reference must be a path from the store root");
    }

    let mut current = root.clone();
    loop {
        parser.skip_ws();
        match parser.peek() {
            Some('.') => {
                parser.next_char();
                let field = parser.ident()?;
                current = match current.get(&field) {
                    Some(v) => v.clone(),
                    // An absent collection means nothing to locate.
                    None => return Ok(None),
                };
            }
            Some('[') => {
                parser.next_char();
                parser.skip_ws();
                if parser.peek() == Some('?') {
                    parser.next_char();
                    let pred = parser.predicate(bindings)?;
                    parser.expect(']')?;
                    parser.skip_ws();
                    if !parser.done() {
                        return err("reference predicate must be the final segment");
                    }
                    let Value::Array(items) = &current else {
                        return Ok(None);
                    };
                    for (idx, item) in items.iter().enumerate() {
                        if pred.matches(item) {
                            return Ok(Some((idx, item.clone())));
                        }
                    }
                    return Ok(None);
                }
                let sel = parser.selector(bindings)?;
                parser.expect(']')?;
                current = apply_selector(&current, &sel)?;
            }
            None => return err("reference must end in a predicate"),
            Some(c) => return err(format!("unexpected `{c}` in reference")),
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

enum Selector {
    Index(i64),
    Slice(Option<i64>, Option<i64>),
    Predicate(Predicate),
}

struct Predicate {
    field: String,
    regex: Option<Regex>,
    equals: Option<Value>,
}

impl Predicate {
    fn matches(&self, item: &Value) -> bool {
        let Some(field) = item.get(&self.field) else {
            return false;
        };
        if let Some(re) = &self.regex {
            return match field {
                Value::String(s) => re.is_match(s),
                other => re.is_match(&other.to_string()),
            };
        }
        if let Some(want) = &self.equals {
            if field == want {
                return true;
            }
            // A string binding may name a number; compare textually too.
            return match (field, want) {
                (Value::String(a), b) => a == &value_text(b),
                (a, Value::String(b)) => &value_text(a) == b,
                _ => false,
            };
        }
        false
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.next_char();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), QueryError> {
        self.skip_ws();
        match self.next_char() {
            Some(c) if c == want => Ok(()),
            other => err(format!("expected `{want}`, found {other:?}")),
        }
    }

    fn ident(&mut self) -> Result<String, QueryError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            self.next_char();
        }
        if self.pos == start {
            return err(format!("expected identifier at byte {start}"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn integer(&mut self) -> Result<i64, QueryError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.next_char();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.next_char();
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| QueryError(format!("expected integer at byte {start}")))
    }

    fn expr(&mut self, root: &Value, bindings: &Map<String, Value>) -> Result<Value, QueryError> {
        self.skip_ws();
        match self.peek() {
            Some('$') => self.path(root, bindings),
            Some(c) if c.is_ascii_alphabetic() => self.func(root, bindings),
            other => err(format!("expected expression, found {other:?}")),
        }
    }

    fn path(&mut self, root: &Value, bindings: &Map<String, Value>) -> Result<Value, QueryError> {
        self.next_char(); // consume '$'
        // `$name` resolves a binding; bare `$` is the root.
        let mut current = if matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        {
            let name = self.ident()?;
            match bindings.get(&name) {
                Some(v) => v.clone(),
                None => return err(format!("unbound parameter `${name}`")),
            }
        } else {
            root.clone()
        };

        loop {
            match self.peek() {
                Some('.') => {
                    self.next_char();
                    let field = self.ident()?;
                    current = lookup_field(&current, &field)?;
                }
                Some('[') => {
                    self.next_char();
                    let sel = self.selector(bindings)?;
                    self.expect(']')?;
                    current = apply_selector(&current, &sel)?;
                }
                _ => return Ok(current),
            }
        }
    }

    fn selector(&mut self, bindings: &Map<String, Value>) -> Result<Selector, QueryError> {
        self.skip_ws();
        if self.peek() == Some('?') {
            self.next_char();
            return Ok(Selector::Predicate(self.predicate(bindings)?));
        }
        if self.peek() == Some(':') {
            self.next_char();
            let end = if matches!(self.peek(), Some(c) if c == '-' || c.is_ascii_digit()) {
                Some(self.integer()?)
            } else {
                None
            };
            return Ok(Selector::Slice(None, end));
        }
        let start = self.integer()?;
        self.skip_ws();
        if self.peek() == Some(':') {
            self.next_char();
            let end = if matches!(self.peek(), Some(c) if c == '-' || c.is_ascii_digit()) {
                Some(self.integer()?)
            } else {
                None
            };
            return Ok(Selector::Slice(Some(start), end));
        }
        Ok(Selector::Index(start))
    }

    fn predicate(&mut self, bindings: &Map<String, Value>) -> Result<Predicate, QueryError> {
        self.skip_ws();
        let field = self.ident()?;
        self.skip_ws();
        let op_regex = if self.src[self.pos..].starts_with("==") {
            self.pos += 2;
            false
        } else if self.src[self.pos..].starts_with("~=") {
            self.pos += 2;
            true
        } else {
            return err("expected `==` or `~=` in predicate");
        };
        self.skip_ws();
        let rhs = self.rhs(bindings)?;
        if op_regex {
            let pattern = value_text(&rhs);
            let re = Regex::new(&pattern)
                .map_err(|e| QueryError(format!("bad predicate regex `{pattern}`: {e}")))?;
            Ok(Predicate {
                field,
                regex: Some(re),
                equals: None,
            })
        } else {
            Ok(Predicate {
                field,
                regex: None,
                equals: Some(rhs),
            })
        }
    }

    fn rhs(&mut self, bindings: &Map<String, Value>) -> Result<Value, QueryError> {
        match self.peek() {
            Some('$') => {
                self.next_char();
                let name = self.ident()?;
                bindings
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| QueryError(format!("unbound parameter `${name}`")))
            }
            Some(q @ ('\'' | '"')) => {
                self.next_char();
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == q {
                        let s = self.src[start..self.pos].to_string();
                        self.next_char();
                        return Ok(Value::String(s));
                    }
                    self.next_char();
                }
                err("unterminated string in predicate")
            }
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(Value::from(self.integer()?)),
            Some(_) => Ok(Value::String(self.ident()?)),
            None => err("missing predicate value"),
        }
    }

    fn func(&mut self, root: &Value, bindings: &Map<String, Value>) -> Result<Value, QueryError> {
        let name = self.ident()?;
        self.expect('(')?;
        let arg = self.expr(root, bindings)?;
        let mut fields = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(',') => {
                    self.next_char();
                    self.skip_ws();
                    fields.push(self.ident()?);
                }
                Some(')') => {
                    self.next_char();
                    break;
                }
                other => return err(format!("expected `,` or `)`, found {other:?}")),
            }
        }

        match name.as_str() {
            "length" => Ok(Value::from(match &arg {
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::String(s) => s.chars().count(),
                _ => 0,
            })),
            "keys" => match &arg {
                Value::Object(o) => Ok(Value::Array(
                    o.keys().map(|k| Value::String(k.clone())).collect(),
                )),
                _ => err("keys() needs an object"),
            },
            // map(list, key, field…): object keyed by each record's `key`
            // holding the listed fields.
            "map" => {
                let Value::Array(items) = &arg else {
                    return err("map() needs an array");
                };
                let Some((key_field, value_fields)) = fields.split_first() else {
                    return err("map() needs a key field");
                };
                let mut out = Map::new();
                for item in items {
                    let Some(key) = item.get(key_field) else {
                        continue;
                    };
                    let mut entry = Map::new();
                    for field in value_fields {
                        if let Some(v) = item.get(field) {
                            entry.insert(field.clone(), v.clone());
                        }
                    }
                    out.insert(value_text(key), Value::Object(entry));
                }
                Ok(Value::Object(out))
            }
            // serial(list, field): the next integer primary key, as the
            // `{key, value}` object the `unique` recipe field expects.
            "serial" => {
                let Value::Array(items) = &arg else {
                    return err("serial() needs an array");
                };
                let Some(field) = fields.first() else {
                    return err("serial() needs a key field");
                };
                let next = items
                    .iter()
                    .filter_map(|r| r.get(field))
                    .filter_map(Value::as_i64)
                    .max()
                    .unwrap_or(0)
                    + 1;
                Ok(serde_json::json!({"key": field, "value": next}))
            }
            other => err(format!("unknown function `{other}`")),
        }
    }
}

fn lookup_field(current: &Value, field: &str) -> Result<Value, QueryError> {
    match current {
        Value::Object(map) => map
            .get(field)
            .cloned()
            .ok_or_else(|| QueryError(format!("no field `{field}`"))),
        // Field access distributes over a filtered array.
        Value::Array(items) => Ok(Value::Array(
            items.iter().filter_map(|v| v.get(field).cloned()).collect(),
        )),
        _ => err(format!("cannot take `{field}` of a scalar")),
    }
}

fn apply_selector(current: &Value, sel: &Selector) -> Result<Value, QueryError> {
    let Value::Array(items) = current else {
        return err("selector applied to a non-array");
    };
    let len = items.len() as i64;
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    match sel {
        Selector::Index(i) => {
            let idx = if *i < 0 { len + i } else { *i };
            if idx < 0 || idx >= len {
                return err(format!("index {i} out of bounds"));
            }
            Ok(items[idx as usize].clone())
        }
        Selector::Slice(start, end) => {
            let s = clamp(start.unwrap_or(0));
            let e = clamp(end.unwrap_or(len));
            Ok(Value::Array(items[s..s.max(e)].to_vec()))
        }
        Selector::Predicate(pred) => Ok(Value::Array(
            items.iter().filter(|v| pred.matches(v)).cloned().collect(),
        )),
    }
}
