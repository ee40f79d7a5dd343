//! Best-effort extraction of a structured payload from free-form model
//! output. Strategies are tried in order and the first conforming value
//! wins; when everything fails the caller-supplied deterministic fallback
//! is returned instead, so downstream renderers never see a half-formed
//! structure.
//!
//! Single-quoted pseudo-JSON (`{'title': 'A'}`) is deliberately not
//! repaired: repairing quotes without a real lexer silently corrupts
//! apostrophes inside values, so such input resolves to the fallback.

use regex::Regex;
use serde_json::{Map, Value};

use crate::features::ExpectedShape;

/// Outcome of one recovery pass. `fallback` marks placeholder payloads so
/// the UI can label them instead of presenting them as genuine.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub value: Value,
    pub fallback: bool,
}

/// Entry point for raw values: anything already structured is validated
/// as-is, strings go through the text recovery path.
pub fn recover_value(raw: &Value, shape: &ExpectedShape, fallback: &Value) -> Recovered {
    if let Value::String(text) = raw {
        return parse_structured(text, shape, fallback);
    }
    match shape.conform(raw) {
        Some(value) => Recovered {
            value,
            fallback: false,
        },
        None => Recovered {
            value: fallback.clone(),
            fallback: true,
        },
    }
}

/// Recovers a structured value from raw model text. Never fails.
pub fn parse_structured(raw: &str, shape: &ExpectedShape, fallback: &Value) -> Recovered {
    let cleaned = strip_code_fences(raw);

    // Strategy 1: the text is already valid JSON.
    if let Ok(parsed) = serde_json::from_str::<Value>(cleaned) {
        if let Some(value) = shape.conform(&parsed) {
            return Recovered {
                value,
                fallback: false,
            };
        }
    }

    // Strategy 2: extract the outermost delimited region and repair the
    // common defects (trailing commas, missing closers).
    if let Some(candidate) = extract_delimited(cleaned, shape) {
        let repaired = repair_json(candidate);
        if let Ok(parsed) = serde_json::from_str::<Value>(&repaired) {
            if let Some(value) = shape.conform(&parsed) {
                return Recovered {
                    value,
                    fallback: false,
                };
            }
        }
    }

    // Strategy 3: last-resort field scraping, only meaningful for flat
    // object lists where every field is a string or a number.
    if let ExpectedShape::ObjectList { required_keys, .. } = shape {
        if let Some(items) = extract_flat_items(cleaned, required_keys) {
            let value = Value::Array(items);
            if let Some(value) = shape.conform(&value) {
                return Recovered {
                    value,
                    fallback: false,
                };
            }
        }
    }

    Recovered {
        value: fallback.clone(),
        fallback: true,
    }
}

/// Removes any number of surrounding markdown code fences, optionally
/// tagged with a language.
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    loop {
        let mut changed = false;
        if let Some(rest) = text.strip_prefix("```") {
            let tag_len = rest
                .chars()
                .take_while(|ch| ch.is_ascii_alphabetic())
                .map(char::len_utf8)
                .sum();
            text = rest[tag_len..].trim();
            changed = true;
        }
        if let Some(rest) = text.strip_suffix("```") {
            text = rest.trim();
            changed = true;
        }
        if !changed {
            return text;
        }
    }
}

/// Slices the region between the first opening delimiter and the last
/// closing one. Text after the closer (trailing prose) is dropped; a
/// missing closer leaves the tail for `repair_json` to balance.
fn extract_delimited<'a>(text: &'a str, shape: &ExpectedShape) -> Option<&'a str> {
    let (open, close) = shape.delimiters();
    let start = text.find(open)?;
    match text.rfind(close).filter(|idx| *idx > start) {
        Some(end) => Some(&text[start..=end]),
        None => Some(&text[start..]),
    }
}

/// String-aware repair pass: drops commas that directly precede a closing
/// delimiter (or the end of truncated text), closes an unterminated string,
/// and appends the minimum closing delimiters needed to balance the value.
fn repair_json(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
                out.push(ch);
            }
            ',' => {
                let next = chars[idx + 1..].iter().find(|ch| !ch.is_whitespace());
                match next {
                    Some('}') | Some(']') | None => {}
                    Some(_) => out.push(ch),
                }
            }
            _ => out.push(ch),
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

/// Scrapes `"key": "value"` / `"key": number` pairs per required key and
/// zips them into objects by position. The item count follows the first
/// key; later keys missing an entry are filled with an empty string.
fn extract_flat_items(text: &str, required_keys: &[&str]) -> Option<Vec<Value>> {
    if required_keys.is_empty() {
        return None;
    }
    let mut columns: Vec<Vec<Value>> = Vec::with_capacity(required_keys.len());
    for key in required_keys {
        columns.push(scrape_field(text, key));
    }
    let count = columns.first().map(Vec::len).unwrap_or(0);
    if count == 0 {
        return None;
    }

    let items = (0..count)
        .map(|idx| {
            let mut item = Map::new();
            for (key, column) in required_keys.iter().zip(&columns) {
                let value = column
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
                item.insert((*key).to_string(), value);
            }
            Value::Object(item)
        })
        .collect();
    Some(items)
}

fn scrape_field(text: &str, key: &str) -> Vec<Value> {
    let pattern = format!(
        r#""{}"\s*:\s*(?:"((?:\\.|[^"\\])*)"|(-?\d+(?:\.\d+)?))"#,
        regex::escape(key)
    );
    let Ok(matcher) = Regex::new(&pattern) else {
        return Vec::new();
    };
    matcher
        .captures_iter(text)
        .map(|caps| {
            if let Some(quoted) = caps.get(1) {
                Value::String(unescape(quoted.as_str()))
            } else {
                let raw = caps.get(2).map(|m| m.as_str()).unwrap_or("0");
                serde_json::from_str::<Value>(raw).unwrap_or(Value::String(raw.to_string()))
            }
        })
        .collect()
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
