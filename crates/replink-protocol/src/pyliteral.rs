//! Python literal parsing and formatting
//!
//! The filesystem layer receives its results as whatever the
//! interpreter `print`s: directory listings as tuples, file contents as
//! `bytes` reprs. This module parses the literal subset actually
//! emitted (integers, strings, bytes with escapes, tuples, lists) and
//! formats byte chunks back into `b'...'` literals for the generated
//! write snippets.
//!
//! Adjacent string/bytes literals concatenate, as in Python source:
//! chunked reads print one `b'...'` per chunk back to back.

use thiserror::Error;

/// Errors from the literal parser
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiteralError {
    /// Input ended inside a literal
    #[error("unexpected end of input")]
    UnexpectedEnd,

    /// A character that cannot start or continue a literal
    #[error("unexpected character {0:?} at byte {1}")]
    Unexpected(char, usize),

    /// A backslash escape the parser does not know
    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    /// Digits that do not form an integer
    #[error("invalid integer at byte {0}")]
    InvalidInt(usize),

    /// Valid literal followed by garbage
    #[error("trailing data at byte {0}")]
    TrailingData(usize),
}

/// A parsed Python literal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer literal
    Int(i64),
    /// String literal
    Str(String),
    /// Bytes literal
    Bytes(Vec<u8>),
    /// Tuple of literals
    Tuple(Vec<Value>),
    /// List of literals
    List(Vec<Value>),
}

impl Value {
    /// The integer value, if this is an integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The string value, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The bytes value, if this is a bytes literal
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The element sequence, if this is a tuple or list
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(items) | Self::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Parse a complete literal; trailing whitespace is allowed, anything
/// else after the literal is an error.
pub fn parse(input: &str) -> Result<Value, LiteralError> {
    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };
    parser.skip_whitespace();
    let value = parser.parse_value()?;
    parser.skip_whitespace();
    if parser.pos < parser.bytes.len() {
        return Err(LiteralError::TrailingData(parser.pos));
    }
    Ok(value)
}

/// Format bytes as a Python `b'...'` literal the interpreter can eval.
pub fn format_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, LiteralError> {
        let b = self.peek().ok_or(LiteralError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(b)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn parse_value(&mut self) -> Result<Value, LiteralError> {
        match self.peek().ok_or(LiteralError::UnexpectedEnd)? {
            b'(' => self.parse_seq(b'(', b')').map(Value::Tuple),
            b'[' => self.parse_seq(b'[', b']').map(Value::List),
            b'\'' | b'"' => self.parse_str().map(Value::Str),
            b'b' => self.parse_bytes().map(Value::Bytes),
            b'-' | b'0'..=b'9' => self.parse_int().map(Value::Int),
            other => Err(LiteralError::Unexpected(other as char, self.pos)),
        }
    }

    fn parse_seq(&mut self, open: u8, close: u8) -> Result<Vec<Value>, LiteralError> {
        debug_assert_eq!(self.peek(), Some(open));
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek().ok_or(LiteralError::UnexpectedEnd)? {
                b if b == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => {
                    items.push(self.parse_value()?);
                    self.skip_whitespace();
                    match self.peek().ok_or(LiteralError::UnexpectedEnd)? {
                        b',' => {
                            self.pos += 1;
                        }
                        b if b == close => {}
                        other => {
                            return Err(LiteralError::Unexpected(other as char, self.pos));
                        }
                    }
                }
            }
        }
    }

    fn parse_int(&mut self) -> Result<i64, LiteralError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(LiteralError::InvalidInt(start))
    }

    /// One quoted string; adjacent string literals concatenate.
    fn parse_str(&mut self) -> Result<String, LiteralError> {
        let mut out = Vec::new();
        loop {
            self.parse_quoted(&mut out)?;
            self.skip_whitespace();
            if !matches!(self.peek(), Some(b'\'' | b'"')) {
                break;
            }
        }
        String::from_utf8(out).map_err(|_| LiteralError::InvalidEscape(self.pos))
    }

    /// One or more adjacent `b'...'` literals.
    fn parse_bytes(&mut self) -> Result<Vec<u8>, LiteralError> {
        let mut out = Vec::new();
        loop {
            let prefix = self.bump()?;
            if prefix != b'b' {
                return Err(LiteralError::Unexpected(prefix as char, self.pos - 1));
            }
            self.parse_quoted(&mut out)?;
            self.skip_whitespace();
            if self.peek() != Some(b'b') {
                break;
            }
        }
        Ok(out)
    }

    /// The quoted body shared by string and bytes literals.
    fn parse_quoted(&mut self, out: &mut Vec<u8>) -> Result<(), LiteralError> {
        let quote = self.bump()?;
        if quote != b'\'' && quote != b'"' {
            return Err(LiteralError::Unexpected(quote as char, self.pos - 1));
        }
        loop {
            match self.bump()? {
                b if b == quote => return Ok(()),
                b'\\' => {
                    let escape_pos = self.pos - 1;
                    match self.bump()? {
                        b'\\' => out.push(b'\\'),
                        b'\'' => out.push(b'\''),
                        b'"' => out.push(b'"'),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'0' => out.push(0),
                        b'x' => {
                            let hi = self.bump()?;
                            let lo = self.bump()?;
                            let hex = [hi, lo];
                            let parsed = std::str::from_utf8(&hex)
                                .ok()
                                .and_then(|s| u8::from_str_radix(s, 16).ok())
                                .ok_or(LiteralError::InvalidEscape(escape_pos))?;
                            out.push(parsed);
                        }
                        _ => return Err(LiteralError::InvalidEscape(escape_pos)),
                    }
                }
                b => out.push(b),
            }
        }
    }
}
