//! Reader for Lisp printed values
//!
//! Only the printed-representation subset the engine emits is supported:
//! lists, dotted pairs, strings, numbers, symbols, keywords, `#(...)` vectors
//! and unreadable `#<...>` objects (kept as symbols).

use serde_json::{Map, Number, Value};

/// A Lisp datum
#[derive(Debug, Clone, PartialEq)]
pub enum Sexp {
    Nil,
    T,
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Keyword(String),
    List(Vec<Sexp>),
    Dotted(Vec<Sexp>, Box<Sexp>),
}

/// Why a text could not be read as exactly one datum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    Empty,
    UnexpectedEnd,
    UnexpectedClose(usize),
    Trailing(usize),
    MisplacedDot(usize),
}

/// Read exactly one datum from `text`; trailing whitespace and comments are allowed.
///
/// Reading stops at the first datum, so text with trailing content fails
/// after reading only that datum.
pub fn read_one(text: &str) -> Result<Sexp, ReadError> {
    let mut reader = Reader { text, pos: 0 };
    reader.skip_atmosphere();
    if reader.at_end() {
        return Err(ReadError::Empty);
    }
    let datum = reader.read()?;
    reader.skip_atmosphere();
    if !reader.at_end() {
        return Err(ReadError::Trailing(reader.offset()));
    }
    Ok(datum)
}

/// Cursor over the text; `pos` is a byte offset on a char boundary
struct Reader<'a> {
    text: &'a str,
    pos: usize,
}

impl Reader<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.text[self.pos..].chars().nth(1)
    }

    fn offset(&self) -> usize {
        if self.at_end() {
            usize::MAX
        } else {
            self.pos
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_atmosphere(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
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

    fn read(&mut self) -> Result<Sexp, ReadError> {
        self.skip_atmosphere();
        let c = self.peek().ok_or(ReadError::UnexpectedEnd)?;
        match c {
            '(' => {
                self.bump();
                self.read_list(')')
            }
            ')' => Err(ReadError::UnexpectedClose(self.offset())),
            '"' => {
                self.bump();
                self.read_string()
            }
            '\'' | '`' => {
                self.bump();
                self.read()
            }
            '#' => self.read_dispatch(),
            _ => Ok(self.read_atom()),
        }
    }

    fn read_list(&mut self, close: char) -> Result<Sexp, ReadError> {
        let mut items = Vec::new();
        loop {
            self.skip_atmosphere();
            match self.peek() {
                None => return Err(ReadError::UnexpectedEnd),
                Some(c) if c == close => {
                    self.bump();
                    return Ok(if items.is_empty() {
                        Sexp::Nil
                    } else {
                        Sexp::List(items)
                    });
                }
                Some('.') if self.is_lone_dot() => {
                    let at = self.offset();
                    self.bump();
                    if items.is_empty() {
                        return Err(ReadError::MisplacedDot(at));
                    }
                    let tail = self.read()?;
                    self.skip_atmosphere();
                    if self.bump() != Some(close) {
                        return Err(ReadError::MisplacedDot(at));
                    }
                    return Ok(Sexp::Dotted(items, Box::new(tail)));
                }
                Some(_) => items.push(self.read()?),
            }
        }
    }

    fn is_lone_dot(&self) -> bool {
        self.peek_second().map(is_delimiter).unwrap_or(true)
    }

    fn read_string(&mut self) -> Result<Sexp, ReadError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(ReadError::UnexpectedEnd),
                Some('"') => return Ok(Sexp::Str(out)),
                Some('\\') => out.push(self.bump().ok_or(ReadError::UnexpectedEnd)?),
                Some(c) => out.push(c),
            }
        }
    }

    fn read_dispatch(&mut self) -> Result<Sexp, ReadError> {
        match self.peek_second() {
            Some('(') => {
                self.bump();
                self.bump();
                self.read_list(')')
            }
            Some('<') => {
                let start = self.pos;
                let mut depth = 0usize;
                while let Some(c) = self.bump() {
                    match c {
                        '<' => depth += 1,
                        '>' => {
                            depth -= 1;
                            if depth == 0 {
                                return Ok(Sexp::Symbol(self.text[start..self.pos].to_string()));
                            }
                        }
                        _ => {}
                    }
                }
                Err(ReadError::UnexpectedEnd)
            }
            _ => Ok(self.read_atom()),
        }
    }

    fn read_atom(&mut self) -> Sexp {
        let mut token = String::new();
        while let Some(c) = self.peek() {
            if c == '|' {
                self.bump();
                while let Some(c) = self.bump() {
                    if c == '|' {
                        break;
                    }
                    token.push(c);
                }
                continue;
            }
            if is_delimiter(c) {
                break;
            }
            token.push(c);
            self.bump();
        }
        classify_atom(token)
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | '\'')
}

fn classify_atom(token: String) -> Sexp {
    if token.eq_ignore_ascii_case("nil") {
        return Sexp::Nil;
    }
    if token.eq_ignore_ascii_case("t") {
        return Sexp::T;
    }
    if let Some(keyword) = token.strip_prefix(':') {
        return Sexp::Keyword(keyword.to_string());
    }
    if let Ok(n) = token.parse::<i64>() {
        return Sexp::Int(n);
    }
    if token.chars().any(|c| c.is_ascii_digit()) {
        let normalized = token.replace(['d', 'D', 'f', 'F', 's', 'S'], "e");
        if let Ok(f) = normalized.parse::<f64>() {
            return Sexp::Float(f);
        }
    }
    Sexp::Symbol(token)
}

impl Sexp {
    /// Convert to JSON.
    ///
    /// Keyword plists and alists become objects with lowercased keys; other
    /// lists become arrays; `nil` is null and `t` is true.
    pub fn to_json(&self) -> Value {
        match self {
            Sexp::Nil => Value::Null,
            Sexp::T => Value::Bool(true),
            Sexp::Int(n) => Value::Number((*n).into()),
            Sexp::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Sexp::Str(s) => Value::String(s.clone()),
            Sexp::Symbol(s) => Value::String(s.clone()),
            Sexp::Keyword(k) => Value::String(k.to_ascii_lowercase()),
            Sexp::List(items) => {
                if let Some(object) = plist_to_object(items) {
                    return object;
                }
                if let Some(object) = alist_to_object(items) {
                    return object;
                }
                Value::Array(items.iter().map(Sexp::to_json).collect())
            }
            Sexp::Dotted(items, tail) => {
                let mut values: Vec<Value> = items.iter().map(Sexp::to_json).collect();
                values.push(tail.to_json());
                Value::Array(values)
            }
        }
    }

    fn as_key(&self) -> Option<String> {
        match self {
            Sexp::Keyword(k) | Sexp::Symbol(k) => Some(k.to_ascii_lowercase()),
            Sexp::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

fn plist_to_object(items: &[Sexp]) -> Option<Value> {
    if items.len() % 2 != 0 || !items.iter().step_by(2).all(|k| matches!(k, Sexp::Keyword(_))) {
        return None;
    }
    let mut map = Map::new();
    for pair in items.chunks(2) {
        map.insert(pair[0].as_key()?, pair[1].to_json());
    }
    Some(Value::Object(map))
}

fn alist_to_object(items: &[Sexp]) -> Option<Value> {
    let mut map = Map::new();
    for item in items {
        let Sexp::Dotted(head, tail) = item else {
            return None;
        };
        if head.len() != 1 {
            return None;
        }
        map.insert(head[0].as_key()?, tail.to_json());
    }
    Some(Value::Object(map))
}
