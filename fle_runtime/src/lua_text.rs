//! Decoder for the serialized-table text the simulation prints, its inverse
//! encoder, and classification of raw replies into values or failures.
//!
//! Decoding is a single forward pass over the input bytes. Tables whose keys are
//! all integers forming exactly `1..=n` become sequences, every other table
//! becomes a mapping, and `nil` becomes `null`.
//!
//! Mapping keys keep their Lua type: a numeric key `[5]` is stored as `"[5]"`
//! and a string key `["5"]` as `"5"`. String keys that themselves begin with
//! `[` carry one extra leading `[`. [`to_lua`] reverses the convention, so a
//! decoded table renders back to a table with the same keys. Repeated keys are
//! a decode error.

use std::fmt::Write as _;

use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use thiserror::Error;

const MAX_DEPTH: usize = 128;
const FRAGMENT_LEN: usize = 24;
const ENGINE_FAILURE_PREFIX: &str = "Cannot execute command.";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("invalid number")]
    InvalidNumber,
    #[error("invalid escape sequence")]
    InvalidEscape,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid table key")]
    InvalidKey,
    #[error("trailing input after value")]
    TrailingInput,
    #[error("tables nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("duplicate table key {0}")]
    DuplicateKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at byte {offset} near `{fragment}`")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: usize,
    pub fragment: String,
}

/// Decode one serialized value. Anything other than exactly one well-formed
/// value (surrounded by optional whitespace) is an error.
pub fn decode(input: &str) -> Result<JsonValue, DecodeError> {
    let mut parser = Parser::new(input);
    parser.skip_whitespace();
    let value = parser.value(0)?;
    parser.skip_whitespace();
    if parser.pos < parser.bytes.len() {
        return Err(parser.error(DecodeErrorKind::TrailingInput));
    }
    Ok(value)
}

enum TableKey {
    Int(i64),
    Float(JsonNumber),
    Str(String),
}

impl TableKey {
    /// Mapping key for this table key. Numeric keys are bracketed so they stay
    /// distinct from string keys spelling the same digits.
    fn into_mapping_key(self) -> String {
        match self {
            TableKey::Int(index) => format!("[{index}]"),
            TableKey::Float(number) => format!("[{number}]"),
            TableKey::Str(key) if key.starts_with('[') => format!("[{key}"),
            TableKey::Str(key) => key,
        }
    }
}

/// Table entries in source order, each with the byte offset of its key.
#[derive(Default)]
struct TableBuilder {
    entries: Vec<(TableKey, JsonValue, usize)>,
}

impl TableBuilder {
    fn insert(&mut self, key: TableKey, value: JsonValue, offset: usize) {
        self.entries.push((key, value, offset));
    }

    fn finish(self, parser: &Parser<'_>) -> Result<JsonValue, DecodeError> {
        if self.entries.is_empty() {
            return Ok(JsonValue::Object(JsonMap::new()));
        }
        if let Some(order) = self.sequence_order(parser)? {
            let mut values: Vec<Option<JsonValue>> = self
                .entries
                .into_iter()
                .map(|(_, value, _)| Some(value))
                .collect();
            let items = order
                .into_iter()
                .filter_map(|position| values[position].take())
                .collect();
            return Ok(JsonValue::Array(items));
        }
        let mut map = JsonMap::new();
        for (key, value, offset) in self.entries {
            let key = key.into_mapping_key();
            if map.contains_key(&key) {
                return Err(parser.error_at(offset, DecodeErrorKind::DuplicateKey(key)));
            }
            map.insert(key, value);
        }
        Ok(JsonValue::Object(map))
    }

    /// Entry positions in index order when every key is an integer and the
    /// keys are exactly `1..=n`.
    fn sequence_order(&self, parser: &Parser<'_>) -> Result<Option<Vec<usize>>, DecodeError> {
        let len = self.entries.len();
        let mut order: Vec<Option<usize>> = vec![None; len];
        for (position, (key, _, offset)) in self.entries.iter().enumerate() {
            let TableKey::Int(index) = key else {
                return Ok(None);
            };
            let Some(slot) = usize::try_from(*index)
                .ok()
                .filter(|index| (1..=len).contains(index))
                .map(|index| &mut order[index - 1])
            else {
                return Ok(None);
            };
            if slot.is_some() {
                let key = format!("[{index}]");
                return Err(parser.error_at(*offset, DecodeErrorKind::DuplicateKey(key)));
            }
            *slot = Some(position);
        }
        Ok(order.into_iter().collect())
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, kind: DecodeErrorKind) -> DecodeError {
        self.error_at(self.pos, kind)
    }

    fn error_at(&self, offset: usize, kind: DecodeErrorKind) -> DecodeError {
        let start = offset.min(self.bytes.len());
        let end = (start + FRAGMENT_LEN).min(self.bytes.len());
        DecodeError {
            kind,
            offset: start,
            fragment: String::from_utf8_lossy(&self.bytes[start..end]).into_owned(),
        }
    }

    fn unexpected(&self) -> DecodeError {
        match self.bytes.get(self.pos..).and_then(|rest| {
            String::from_utf8_lossy(&rest[..rest.len().min(4)])
                .chars()
                .next()
        }) {
            Some(ch) => self.error(DecodeErrorKind::UnexpectedChar(ch)),
            None => self.error(DecodeErrorKind::UnexpectedEnd),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), DecodeError> {
        self.skip_whitespace();
        match self.peek() {
            Some(byte) if byte == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(self.unexpected()),
            None => Err(self.error(DecodeErrorKind::UnexpectedEnd)),
        }
    }

    fn value(&mut self, depth: usize) -> Result<JsonValue, DecodeError> {
        match self.peek() {
            None => Err(self.error(DecodeErrorKind::UnexpectedEnd)),
            Some(b'{') => self.table(depth + 1),
            Some(b'"') | Some(b'\'') => self.string().map(JsonValue::String),
            Some(b'-') | Some(b'.') | Some(b'0'..=b'9') => self.number(),
            Some(byte) if is_identifier_start(byte) => {
                let start = self.pos;
                match self.identifier() {
                    "true" => Ok(JsonValue::Bool(true)),
                    "false" => Ok(JsonValue::Bool(false)),
                    "nil" => Ok(JsonValue::Null),
                    _ => {
                        self.pos = start;
                        Err(self.unexpected())
                    }
                }
            }
            Some(_) => Err(self.unexpected()),
        }
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if byte.is_ascii_alphanumeric() || byte == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        // Identifier bytes are ASCII, so the slice is valid UTF-8.
        std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default()
    }

    fn table(&mut self, depth: usize) -> Result<JsonValue, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(self.error(DecodeErrorKind::TooDeep));
        }
        self.pos += 1;
        let mut builder = TableBuilder::default();
        let mut next_positional: i64 = 1;

        loop {
            self.skip_whitespace();
            let key_offset = self.pos;
            let (key, value) = match self.peek() {
                None => return Err(self.error(DecodeErrorKind::UnexpectedEnd)),
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(b'[') => {
                    let key = self.bracket_key()?;
                    self.expect(b'=')?;
                    self.skip_whitespace();
                    (key, self.value(depth)?)
                }
                Some(byte) if is_identifier_start(byte) => {
                    let start = self.pos;
                    let name = self.identifier();
                    self.skip_whitespace();
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.skip_whitespace();
                        (TableKey::Str(name.to_string()), self.value(depth)?)
                    } else {
                        let literal = match name {
                            "true" => JsonValue::Bool(true),
                            "false" => JsonValue::Bool(false),
                            "nil" => JsonValue::Null,
                            _ => {
                                self.pos = start;
                                return Err(self.error(DecodeErrorKind::InvalidKey));
                            }
                        };
                        let key = TableKey::Int(next_positional);
                        next_positional += 1;
                        (key, literal)
                    }
                }
                Some(_) => {
                    let value = self.value(depth)?;
                    let key = TableKey::Int(next_positional);
                    next_positional += 1;
                    (key, value)
                }
            };
            builder.insert(key, value, key_offset);

            self.skip_whitespace();
            match self.peek() {
                Some(b',') | Some(b';') => self.pos += 1,
                Some(b'}') => {}
                Some(_) => return Err(self.unexpected()),
                None => return Err(self.error(DecodeErrorKind::UnexpectedEnd)),
            }
        }

        builder.finish(self)
    }

    fn bracket_key(&mut self) -> Result<TableKey, DecodeError> {
        self.pos += 1;
        self.skip_whitespace();
        let key = match self.peek() {
            Some(b'"') | Some(b'\'') => TableKey::Str(self.string()?),
            Some(b'-') | Some(b'0'..=b'9') => {
                let start = self.pos;
                match self.number()? {
                    JsonValue::Number(number) => match number.as_i64() {
                        Some(index) => TableKey::Int(index),
                        None => integral_key(&number).unwrap_or(TableKey::Float(number)),
                    },
                    _ => {
                        self.pos = start;
                        return Err(self.error(DecodeErrorKind::InvalidKey));
                    }
                }
            }
            Some(_) => return Err(self.error(DecodeErrorKind::InvalidKey)),
            None => return Err(self.error(DecodeErrorKind::UnexpectedEnd)),
        };
        self.expect(b']')?;
        Ok(key)
    }

    fn number(&mut self) -> Result<JsonValue, DecodeError> {
        let start = self.pos;
        let mut is_float = false;
        let mut digits = 0usize;

        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while let Some(byte) = self.peek() {
            match byte {
                b'0'..=b'9' => {
                    digits += 1;
                    self.pos += 1;
                }
                b'.' => {
                    is_float = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        let invalid = |parser: &mut Self| {
            parser.pos = start;
            parser.error(DecodeErrorKind::InvalidNumber)
        };
        if digits == 0 {
            return Err(invalid(self));
        }
        if !is_float {
            if let Ok(int) = text.parse::<i64>() {
                return Ok(JsonValue::Number(int.into()));
            }
        }
        match text.parse::<f64>().ok().and_then(JsonNumber::from_f64) {
            Some(number) => Ok(JsonValue::Number(number)),
            None => Err(invalid(self)),
        }
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let quote = self.bytes[self.pos];
        self.pos += 1;
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let run_start = self.pos;
            while let Some(byte) = self.peek() {
                if byte == quote || byte == b'\\' {
                    break;
                }
                self.pos += 1;
            }
            buffer.extend_from_slice(&self.bytes[run_start..self.pos]);

            match self.peek() {
                None => return Err(self.error(DecodeErrorKind::UnexpectedEnd)),
                Some(byte) if byte == quote => {
                    self.pos += 1;
                    break;
                }
                Some(_) => self.escape(&mut buffer)?,
            }
        }

        String::from_utf8(buffer).map_err(|_| self.error(DecodeErrorKind::InvalidUtf8))
    }

    fn escape(&mut self, buffer: &mut Vec<u8>) -> Result<(), DecodeError> {
        let escape_start = self.pos;
        self.pos += 1;
        let Some(byte) = self.peek() else {
            return Err(self.error(DecodeErrorKind::UnexpectedEnd));
        };
        self.pos += 1;
        let decoded = match byte {
            b'n' | b'\n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'\\' => b'\\',
            b'"' => b'"',
            b'\'' => b'\'',
            b'0'..=b'9' => {
                let mut code = u32::from(byte - b'0');
                for _ in 0..2 {
                    match self.peek() {
                        Some(digit @ b'0'..=b'9') => {
                            code = code * 10 + u32::from(digit - b'0');
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                match u8::try_from(code) {
                    Ok(code) => code,
                    Err(_) => {
                        self.pos = escape_start;
                        return Err(self.error(DecodeErrorKind::InvalidEscape));
                    }
                }
            }
            b'x' => {
                let hex = self
                    .bytes
                    .get(self.pos..self.pos + 2)
                    .and_then(|digits| std::str::from_utf8(digits).ok())
                    .and_then(|digits| u8::from_str_radix(digits, 16).ok());
                match hex {
                    Some(code) => {
                        self.pos += 2;
                        code
                    }
                    None => {
                        self.pos = escape_start;
                        return Err(self.error(DecodeErrorKind::InvalidEscape));
                    }
                }
            }
            _ => {
                self.pos = escape_start;
                return Err(self.error(DecodeErrorKind::InvalidEscape));
            }
        };
        buffer.push(decoded);
        Ok(())
    }
}

/// Float keys with an integral value index the same slot as the integer.
fn integral_key(number: &JsonNumber) -> Option<TableKey> {
    let value = number.as_f64()?;
    let in_range = value.fract() == 0.0 && value.abs() < 9.0e15;
    in_range.then(|| TableKey::Int(value as i64))
}

fn is_identifier_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

/// Render a host value as a table constructor the simulation can evaluate.
pub fn to_lua(value: &JsonValue) -> String {
    let mut out = String::new();
    write_lua(&mut out, value);
    out
}

fn write_lua(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::Null => out.push_str("nil"),
        JsonValue::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        JsonValue::Number(number) => {
            let _ = write!(out, "{number}");
        }
        JsonValue::String(text) => out.push_str(&quote_lua(text)),
        JsonValue::Array(items) => {
            out.push('{');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write_lua(out, item);
            }
            out.push('}');
        }
        JsonValue::Object(map) => {
            out.push('{');
            for (index, (key, item)) in map.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write_key(out, key);
                out.push_str(" = ");
                write_lua(out, item);
            }
            out.push('}');
        }
    }
}

/// Inverse of the mapping-key convention used by the decoder.
fn write_key(out: &mut String, key: &str) {
    out.push('[');
    if let Some(escaped) = key.strip_prefix("[[") {
        out.push_str(&quote_lua(&format!("[{escaped}")));
    } else if let Some(number) = numeric_key(key) {
        out.push_str(number);
    } else {
        out.push_str(&quote_lua(key));
    }
    out.push(']');
}

fn numeric_key(key: &str) -> Option<&str> {
    let inner = key.strip_prefix('[')?.strip_suffix(']')?;
    let leading = inner.starts_with(|ch: char| ch.is_ascii_digit() || ch == '-' || ch == '.');
    let numeric = inner.parse::<i64>().is_ok()
        || inner.parse::<f64>().map_or(false, |value| value.is_finite());
    (leading && numeric).then_some(inner)
}

/// Quote `text` as a Lua string literal.
pub fn quote_lua(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            ch if (ch as u32) < 0x20 || ch as u32 == 0x7f => {
                let _ = write!(quoted, "\\{:03}", ch as u32);
            }
            ch => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The command itself could not run (syntax error, missing global).
    Engine,
    /// A procedure ran and reported an error through the reply envelope.
    Procedure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Classified reply from the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Empty,
    Value(JsonValue),
    /// Printed output that is not a serialized value.
    Text(String),
    Failure(RemoteFailure),
}

/// Classify a raw reply. Procedure calls answer with an envelope
/// `{ ["ok"] = bool, ["result"] = .., ["error"] = .. }` which is unwrapped here;
/// a reply that starts as a table must decode completely.
pub fn decode_reply(text: &str) -> Result<Reply, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Reply::Empty);
    }
    if trimmed.starts_with(ENGINE_FAILURE_PREFIX) {
        return Ok(Reply::Failure(RemoteFailure {
            kind: FailureKind::Engine,
            message: normalize_message(trimmed),
        }));
    }
    if trimmed.starts_with('{') {
        return decode(trimmed).map(unwrap_envelope);
    }
    Ok(match decode(trimmed) {
        Ok(value) => Reply::Value(value),
        Err(_) => Reply::Text(trimmed.to_string()),
    })
}

fn unwrap_envelope(value: JsonValue) -> Reply {
    let JsonValue::Object(mut map) = value else {
        return Reply::Value(value);
    };
    let is_envelope = matches!(map.get("ok"), Some(JsonValue::Bool(_)))
        && map
            .keys()
            .all(|key| matches!(key.as_str(), "ok" | "result" | "error"));
    if !is_envelope {
        return Reply::Value(JsonValue::Object(map));
    }
    if map.get("ok") == Some(&JsonValue::Bool(true)) {
        return Reply::Value(map.remove("result").unwrap_or(JsonValue::Null));
    }
    let message = match map.remove("error") {
        Some(JsonValue::String(text)) => text,
        Some(other) => other.to_string(),
        None => "procedure failed without a message".to_string(),
    };
    Reply::Failure(RemoteFailure {
        kind: FailureKind::Procedure,
        message: normalize_message(&message),
    })
}

/// Strip engine prefixes and chunk locations from an error message and turn
/// escaped newlines and quotes into their display form.
pub fn normalize_message(raw: &str) -> String {
    let mut message = raw.trim();
    if let Some(rest) = message.strip_prefix(ENGINE_FAILURE_PREFIX) {
        message = rest.trim_start();
    }
    if let Some(rest) = message.strip_prefix("Error:") {
        message = rest.trim_start();
    }
    while let Some(rest) = strip_chunk_location(message) {
        message = rest;
    }

    let unescaped = message
        .replace("\\n", "\n")
        .replace("\\'", "'")
        .replace("\\\"", "\"");
    unescaped
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}

/// `[string "..."]:12: rest` -> `rest`
fn strip_chunk_location(message: &str) -> Option<&str> {
    let rest = message.strip_prefix("[string \"")?;
    let close = rest.find("\"]:")?;
    let after = &rest[close + 3..];
    let digits = after.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let after = after[digits..].strip_prefix(':')?;
    Some(after.trim_start())
}
