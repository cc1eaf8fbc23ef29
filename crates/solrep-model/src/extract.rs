//! Tolerant extraction of a JSON object from free-form model output.
//!
//! Handles prose around the payload, markdown fences, raw newlines inside string
//! literals, and output that was cut off before the object closed.

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Characters of input echoed back in errors.
pub const ERROR_TAIL_CHARS: usize = 240;

/// Comma positions remembered for cut-back repair.
const MAX_REPAIR_CUTS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("no JSON object start found (length {length}, tail {tail:?})")]
    NoJsonStart { length: usize, tail: String },
    #[error("JSON object at byte {start} could not be closed or parsed (length {length}, tail {tail:?}): {reason}")]
    Unterminated {
        start: usize,
        length: usize,
        tail: String,
        reason: String,
    },
    #[error("expected a JSON object but parsed {found} (length {length}, tail {tail:?})")]
    UnexpectedValue {
        found: &'static str,
        length: usize,
        tail: String,
    },
}

/// Returns the JSON object carried by `text`.
pub fn extract_json(text: &str) -> Result<JsonValue, ExtractError> {
    let Some((open, body)) = fenced_body(text) else {
        return scan_object(text, text);
    };
    match serde_json::from_str::<JsonValue>(&escape_raw_controls(body.trim())) {
        Ok(value) if value.is_object() => Ok(value),
        // A fenced non-object only loses to an object written before the fence.
        Ok(value) => scan_object(&text[..open], text).map_err(|_| ExtractError::UnexpectedValue {
            found: value_kind(&value),
            length: text.chars().count(),
            tail: tail_chars(text, ERROR_TAIL_CHARS),
        }),
        Err(_) => scan_object(body, text).or_else(|_| scan_object(text, text)),
    }
}

/// Last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Byte offset of the first fence and the text it encloses.
fn fenced_body(text: &str) -> Option<(usize, &str)> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let line_end = after_fence.find('\n');
    let first_line = &after_fence[..line_end.unwrap_or(after_fence.len())];
    // Only a bare info string (`json`, `JSON`, ...) is skipped; `{...}` on the fence line is the body.
    let body_start = if is_info_string(first_line) {
        line_end.map_or(after_fence.len(), |i| i + 1)
    } else {
        0
    };
    let body = &after_fence[body_start..];
    Some((
        open,
        match body.find("```") {
            Some(close) => &body[..close],
            None => body,
        },
    ))
}

fn is_info_string(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
}

fn scan_object(body: &str, original: &str) -> Result<JsonValue, ExtractError> {
    let Some(start) = body.find('{') else {
        return Err(ExtractError::NoJsonStart {
            length: original.chars().count(),
            tail: tail_chars(original, ERROR_TAIL_CHARS),
        });
    };
    let fragment = &body[start..];

    let mut closers: Vec<char> = Vec::new();
    let mut cuts: Vec<(usize, Vec<char>)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in fragment.char_indices() {
        if in_string {
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
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
                if closers.is_empty() {
                    let span = &fragment[..offset + ch.len_utf8()];
                    return serde_json::from_str(&escape_raw_controls(span))
                        .map_err(|err| unterminated(start, original, err.to_string()));
                }
            }
            ',' => {
                if cuts.len() == MAX_REPAIR_CUTS {
                    cuts.remove(0);
                }
                cuts.push((offset, closers.clone()));
            }
            _ => {}
        }
    }

    repair(fragment, in_string, escaped, &closers, &cuts)
        .ok_or_else(|| unterminated(start, original, "truncated output could not be repaired".into()))
}

/// Closes a truncated fragment; falls back to cutting at earlier commas when the
/// tail itself is a partial key or value.
fn repair(
    fragment: &str,
    in_string: bool,
    escaped: bool,
    closers: &[char],
    cuts: &[(usize, Vec<char>)],
) -> Option<JsonValue> {
    let mut completed = escape_raw_controls(fragment);
    if in_string {
        if escaped {
            completed.pop();
        }
        completed.push('"');
    }
    if let Some(value) = close_and_parse(completed, closers) {
        return Some(value);
    }

    cuts.iter().rev().find_map(|(offset, stack)| {
        close_and_parse(escape_raw_controls(&fragment[..*offset]), stack)
    })
}

fn close_and_parse(mut text: String, closers: &[char]) -> Option<JsonValue> {
    loop {
        let trimmed_len = text.trim_end().len();
        text.truncate(trimmed_len);
        if text.ends_with(',') {
            text.pop();
            continue;
        }
        if text.ends_with(':') {
            text.push_str("null");
        }
        break;
    }
    text.extend(closers.iter().rev());
    serde_json::from_str::<JsonValue>(&text)
        .ok()
        .filter(JsonValue::is_object)
}

/// Escapes literal control characters that appear inside string literals.
fn escape_raw_controls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' => {
                escaped = true;
                out.push(ch);
            }
            '"' => {
                in_string = false;
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn unterminated(start: usize, original: &str, reason: String) -> ExtractError {
    ExtractError::Unterminated {
        start,
        length: original.chars().count(),
        tail: tail_chars(original, ERROR_TAIL_CHARS),
        reason,
    }
}

fn value_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
