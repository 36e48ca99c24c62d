//! Lenient parser for JSON documents that are still being streamed.
//!
//! [`assemble`] is handed the whole cumulative buffer on every tick and
//! returns the most complete value the text supports so far:
//!
//! * unterminated strings keep the characters received so far;
//! * numbers cut mid-token keep their longest valid prefix (`"1."` is `1`);
//! * missing closing brackets and braces are implied;
//! * a key whose value has not started, or whose literal (`tru`) is
//!   incomplete, is left out entirely.
//!
//! Text that cannot become valid JSON however it continues (a bad escape, a
//! missing colon, a document not starting with `{` or `[`) is rejected.
//! Callers treat any error as "no update this tick".

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("buffer is empty")]
    Empty,
    #[error("buffer does not start with an object or array")]
    NotStructured,
    #[error("{message} at byte {offset}")]
    Invalid { offset: usize, message: String },
}

/// Parses `buffer` as a possibly truncated JSON document.
pub fn assemble(buffer: &str) -> Result<Value, AssembleError> {
    let trimmed = buffer.trim_start();
    match trimmed.as_bytes().first() {
        None => return Err(AssembleError::Empty),
        Some(b'{') | Some(b'[') => {}
        Some(_) => return Err(AssembleError::NotStructured),
    }

    let mut parser = Parser::new(trimmed);
    let value = match parser.value()? {
        Parsed::Complete(value) => {
            parser.skip_whitespace();
            if !parser.at_end() {
                return Err(parser.error("unexpected trailing characters"));
            }
            value
        }
        Parsed::Truncated(Some(value)) => value,
        // a leading bracket always yields at least an empty container
        Parsed::Truncated(None) => return Err(AssembleError::Empty),
    };
    Ok(value)
}

enum Parsed {
    Complete(Value),
    /// Input ended inside this value; `None` when nothing usable was read.
    Truncated(Option<Value>),
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, bytes: src.as_bytes(), pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, message: &str) -> AssembleError {
        AssembleError::Invalid { offset: self.pos, message: message.to_string() }
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\n' | b'\r' | b'\t') = self.peek() {
            self.pos += 1;
        }
    }

    fn value(&mut self) -> Result<Parsed, AssembleError> {
        self.skip_whitespace();
        match self.peek() {
            None => Ok(Parsed::Truncated(None)),
            Some(b'{') => self.object(),
            Some(b'[') => self.array(),
            Some(b'"') => Ok(match self.string()? {
                (text, true) => Parsed::Complete(Value::String(text)),
                (text, false) => Parsed::Truncated(Some(Value::String(text))),
            }),
            Some(b'-' | b'0'..=b'9') => self.number(),
            Some(b't') => self.literal("true", Value::Bool(true)),
            Some(b'f') => self.literal("false", Value::Bool(false)),
            Some(b'n') => self.literal("null", Value::Null),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn object(&mut self) -> Result<Parsed, AssembleError> {
        self.pos += 1;
        let mut map = Map::new();
        let mut first = true;

        loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
                Some(b'}') if first => {
                    self.pos += 1;
                    return Ok(Parsed::Complete(Value::Object(map)));
                }
                Some(b'"') => {}
                Some(_) => return Err(self.error("expected object key")),
            }

            let (key, key_done) = self.string()?;
            if !key_done {
                return Ok(Parsed::Truncated(Some(Value::Object(map))));
            }

            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
                Some(b':') => self.pos += 1,
                Some(_) => return Err(self.error("expected ':' after object key")),
            }

            match self.value()? {
                Parsed::Complete(value) => {
                    map.insert(key, value);
                }
                Parsed::Truncated(partial) => {
                    if let Some(value) = partial {
                        map.insert(key, value);
                    }
                    return Ok(Parsed::Truncated(Some(Value::Object(map))));
                }
            }

            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Object(map)))),
                Some(b',') => {
                    self.pos += 1;
                    first = false;
                }
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Parsed::Complete(Value::Object(map)));
                }
                Some(_) => return Err(self.error("expected ',' or '}' in object")),
            }
        }
    }

    fn array(&mut self) -> Result<Parsed, AssembleError> {
        self.pos += 1;
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Parsed::Complete(Value::Array(items)));
        }

        loop {
            match self.value()? {
                Parsed::Complete(value) => items.push(value),
                Parsed::Truncated(partial) => {
                    items.extend(partial);
                    return Ok(Parsed::Truncated(Some(Value::Array(items))));
                }
            }

            self.skip_whitespace();
            match self.peek() {
                None => return Ok(Parsed::Truncated(Some(Value::Array(items)))),
                Some(b',') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    if self.peek() == Some(b']') {
                        return Err(self.error("trailing comma in array"));
                    }
                }
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Parsed::Complete(Value::Array(items)));
                }
                Some(_) => return Err(self.error("expected ',' or ']' in array")),
            }
        }
    }

    /// Reads a string starting at the opening quote. The flag is false when
    /// the input ended before the closing quote; a dangling escape is dropped.
    fn string(&mut self) -> Result<(String, bool), AssembleError> {
        self.pos += 1;
        let mut out = String::new();

        loop {
            let start = self.pos;
            while let Some(b) = self.peek() {
                if b == b'"' || b == b'\\' || b < 0x20 {
                    break;
                }
                self.pos += 1;
            }
            // stops only on ASCII bytes, so both ends are char boundaries
            out.push_str(&self.src[start..self.pos]);

            match self.peek() {
                None => return Ok((out, false)),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok((out, true));
                }
                Some(b'\\') => {
                    let escape_start = self.pos;
                    match self.escape()? {
                        Some(c) => out.push(c),
                        None => {
                            self.pos = escape_start;
                            return Ok((out, false));
                        }
                    }
                }
                Some(_) => return Err(self.error("control character in string")),
            }
        }
    }

    /// Decodes one escape sequence. `None` means the input ended inside it.
    fn escape(&mut self) -> Result<Option<char>, AssembleError> {
        self.pos += 1;
        let Some(code) = self.peek() else {
            return Ok(None);
        };
        self.pos += 1;

        let c = match code {
            b'"' => '"',
            b'\\' => '\\',
            b'/' => '/',
            b'b' => '\u{08}',
            b'f' => '\u{0C}',
            b'n' => '\n',
            b'r' => '\r',
            b't' => '\t',
            b'u' => {
                let Some(high) = self.hex4()? else {
                    return Ok(None);
                };
                if !(0xD800..0xDC00).contains(&high) {
                    return char::from_u32(high)
                        .map(Some)
                        .ok_or_else(|| self.error("invalid unicode escape"));
                }
                // high surrogate: a low surrogate escape must follow
                match (self.peek(), self.bytes.get(self.pos + 1)) {
                    (None, _) | (Some(b'\\'), None) => return Ok(None),
                    (Some(b'\\'), Some(b'u')) => self.pos += 2,
                    _ => return Err(self.error("unpaired surrogate in unicode escape")),
                }
                let Some(low) = self.hex4()? else {
                    return Ok(None);
                };
                if !(0xDC00..0xE000).contains(&low) {
                    return Err(self.error("unpaired surrogate in unicode escape"));
                }
                let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                return char::from_u32(combined)
                    .map(Some)
                    .ok_or_else(|| self.error("invalid unicode escape"));
            }
            _ => return Err(self.error("invalid escape sequence")),
        };
        Ok(Some(c))
    }

    fn hex4(&mut self) -> Result<Option<u32>, AssembleError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let Some(b) = self.peek() else {
                return Ok(None);
            };
            let digit = (b as char)
                .to_digit(16)
                .ok_or_else(|| self.error("invalid hex digit in unicode escape"))?;
            value = value * 16 + digit;
            self.pos += 1;
        }
        Ok(Some(value))
    }

    fn number(&mut self) -> Result<Parsed, AssembleError> {
        let start = self.pos;
        while let Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9') = self.peek() {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];

        if !self.at_end() {
            return parse_number(text)
                .map(|n| Parsed::Complete(Value::Number(n)))
                .ok_or_else(|| AssembleError::Invalid {
                    offset: start,
                    message: format!("invalid number '{}'", text),
                });
        }

        // the number may still be growing: keep its longest valid prefix
        let usable = text.trim_end_matches(|c: char| !c.is_ascii_digit());
        let usable = usable
            .strip_suffix(|c: char| c == 'e' || c == 'E')
            .unwrap_or(usable);
        if usable.is_empty() || usable == "-" {
            return Ok(Parsed::Truncated(None));
        }
        match parse_number(usable) {
            Some(n) => Ok(Parsed::Truncated(Some(Value::Number(n)))),
            None => Err(AssembleError::Invalid {
                offset: start,
                message: format!("invalid number '{}'", text),
            }),
        }
    }

    fn literal(&mut self, word: &'static str, value: Value) -> Result<Parsed, AssembleError> {
        let rest = &self.bytes[self.pos..];
        let expected = word.as_bytes();
        if rest.len() >= expected.len() {
            if &rest[..expected.len()] == expected {
                self.pos += expected.len();
                return Ok(Parsed::Complete(value));
            }
        } else if expected.starts_with(rest) {
            self.pos = self.bytes.len();
            return Ok(Parsed::Truncated(None));
        }
        Err(self.error("invalid literal"))
    }
}

/// Strict JSON number grammar, delegated to serde_json.
fn parse_number(text: &str) -> Option<Number> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Number(n)) => Some(n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOCUMENT: &str = r#"{
  "schemas": [
    {
      "tableName": "orders",
      "description": "Customer orders \"as placed\" été 😀",
      "rowEstimate": 1250,
      "ratio": -3.75e2,
      "active": true,
      "archived": false,
      "owner": null,
      "columns": [{"name": "id", "isPrimaryKey": true}, {"name": "amount", "scale": 2.5}]
    }
  ],
  "relationships": [],
  "notes": ["a", "b\nc"]
}"#;

    /// `partial` only contains data present in `full`: strings may be
    /// prefixes, numbers may be textual prefixes, arrays may be shorter.
    fn is_subdocument(partial: &Value, full: &Value) -> bool {
        match (partial, full) {
            (Value::Object(p), Value::Object(f)) => p
                .iter()
                .all(|(k, v)| f.get(k).map_or(false, |fv| is_subdocument(v, fv))),
            (Value::Array(p), Value::Array(f)) => {
                p.len() <= f.len() && p.iter().zip(f).all(|(a, b)| is_subdocument(a, b))
            }
            (Value::String(p), Value::String(f)) => f.starts_with(p.as_str()),
            (Value::Number(p), Value::Number(f)) => {
                let (p, f) = (p.as_f64().unwrap(), f.as_f64().unwrap());
                p == f || p.abs() <= f.abs()
            }
            (p, f) => p == f,
        }
    }

    /// Every (key path, value) whose value is a complete scalar.
    fn resolved_leaves(value: &Value, path: String, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    resolved_leaves(v, format!("{}/{}", path, k), out);
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    resolved_leaves(v, format!("{}/{}", path, i), out);
                }
            }
            Value::Bool(_) | Value::Null => out.push((path, value.clone())),
            _ => {}
        }
    }

    #[test]
    fn complete_document_matches_strict_parse() {
        let strict: Value = serde_json::from_str(DOCUMENT).unwrap();
        assert_eq!(assemble(DOCUMENT).unwrap(), strict);
    }

    #[test]
    fn every_prefix_is_a_subdocument() {
        let full: Value = serde_json::from_str(DOCUMENT).unwrap();
        for (end, _) in DOCUMENT.char_indices().skip(1) {
            let prefix = &DOCUMENT[..end];
            match assemble(prefix) {
                Ok(partial) => assert!(
                    is_subdocument(&partial, &full),
                    "prefix {:?} produced {}",
                    prefix,
                    partial
                ),
                Err(err) => panic!("prefix {:?} rejected: {}", prefix, err),
            }
        }
    }

    #[test]
    fn resolved_values_never_regress() {
        let mut previous: Vec<(String, Value)> = Vec::new();
        for (end, _) in DOCUMENT.char_indices().skip(1) {
            let partial = assemble(&DOCUMENT[..end]).unwrap();
            let mut leaves = Vec::new();
            resolved_leaves(&partial, String::new(), &mut leaves);
            for (path, value) in &previous {
                assert!(
                    leaves.iter().any(|(p, v)| p == path && v == value),
                    "{} regressed at byte {}",
                    path,
                    end
                );
            }
            previous = leaves;
        }
    }

    #[test]
    fn truncated_string_keeps_partial_content() {
        assert_eq!(
            assemble(r#"{"tableName": "ord"#).unwrap(),
            json!({"tableName": "ord"})
        );
    }

    #[test]
    fn keys_without_values_are_absent() {
        assert_eq!(assemble(r#"{"a": 1, "b"#).unwrap(), json!({"a": 1}));
        assert_eq!(assemble(r#"{"a": 1, "b":"#).unwrap(), json!({"a": 1}));
        assert_eq!(assemble(r#"{"a": 1, "b": tr"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn truncated_numbers_keep_valid_prefix() {
        assert_eq!(assemble(r#"{"n": 12"#).unwrap(), json!({"n": 12}));
        assert_eq!(assemble(r#"{"n": 1."#).unwrap(), json!({"n": 1}));
        assert_eq!(assemble(r#"{"n": 2.5e"#).unwrap(), json!({"n": 2.5}));
        assert_eq!(assemble(r#"{"n": -"#).unwrap(), json!({}));
    }

    #[test]
    fn nested_containers_close_implicitly() {
        assert_eq!(
            assemble(r#"[{"a": [1, 2, {"b": "x"#).unwrap(),
            json!([{"a": [1, 2, {"b": "x"}]}])
        );
        assert_eq!(assemble("[1, ").unwrap(), json!([1]));
    }

    #[test]
    fn dangling_escapes_are_dropped() {
        assert_eq!(assemble(r#"{"s": "a\"#).unwrap(), json!({"s": "a"}));
        assert_eq!(assemble(r#"{"s": "a\u00"#).unwrap(), json!({"s": "a"}));
        assert_eq!(assemble(r#"{"s": "a\ud83d"#).unwrap(), json!({"s": "a"}));
    }

    #[test]
    fn rejects_non_structured_text() {
        assert_eq!(assemble(""), Err(AssembleError::Empty));
        assert_eq!(assemble("   "), Err(AssembleError::Empty));
        assert_eq!(assemble("Sure! Here is"), Err(AssembleError::NotStructured));
        assert_eq!(assemble("\"text\""), Err(AssembleError::NotStructured));
    }

    #[test]
    fn rejects_text_that_can_never_be_valid() {
        assert!(matches!(assemble(r#"{"s": "\q"#), Err(AssembleError::Invalid { .. })));
        assert!(matches!(assemble(r#"{"a" 1"#), Err(AssembleError::Invalid { .. })));
        assert!(matches!(assemble(r#"{"a": 1,}"#), Err(AssembleError::Invalid { .. })));
        assert!(matches!(assemble("[1,]"), Err(AssembleError::Invalid { .. })));
        assert!(matches!(assemble(r#"{"a": nope}"#), Err(AssembleError::Invalid { .. })));
        assert!(matches!(assemble(r#"{"a": 1} trailing"#), Err(AssembleError::Invalid { .. })));
        assert!(matches!(assemble(r#"{"a": 01}"#), Err(AssembleError::Invalid { .. })));
    }

    #[test]
    fn leading_whitespace_is_ignored() {
        assert_eq!(assemble("\n  {\"a\": [tr").unwrap(), json!({"a": []}));
    }
}
