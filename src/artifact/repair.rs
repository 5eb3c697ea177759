//! Recovering JSON from chatty model output.
//!
//! Models wrap JSON in prose, fence it in markdown, and leave trailing commas.
//! Recovery tries progressively looser extractions and reports which one
//! worked. Scanning is a small explicit state machine so that brackets and
//! commas inside string literals are never mistaken for structure.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::GeneratedDocument;

/// Which extraction produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    /// The whole response parsed as-is.
    Direct,
    /// First balanced `{…}`/`[…]` span, trailing commas stripped.
    Balanced,
    /// Interior of a fenced code block.
    Fenced,
    /// Widest `{…}` span.
    Widest,
}

impl RepairStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStep::Direct => "direct",
            RepairStep::Balanced => "balanced",
            RepairStep::Fenced => "fenced",
            RepairStep::Widest => "widest",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Repaired<T> {
    pub value: T,
    pub step: RepairStep,
}

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("response is empty")]
    Empty,
    #[error("no recoverable JSON ({last_error}); starts with: {preview}")]
    Unrecoverable { last_error: String, preview: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InString,
    Escaped,
}

impl ScanState {
    /// Advance over one byte. Returns true when the byte is structural.
    fn step(&mut self, b: u8) -> bool {
        match *self {
            ScanState::Normal => {
                if b == b'"' {
                    *self = ScanState::InString;
                    false
                } else {
                    true
                }
            }
            ScanState::InString => {
                match b {
                    b'\\' => *self = ScanState::Escaped,
                    b'"' => *self = ScanState::Normal,
                    _ => {}
                }
                false
            }
            ScanState::Escaped => {
                *self = ScanState::InString;
                false
            }
        }
    }
}

/// Index of the bracket closing the one at `start`, or `None` if the span
/// never balances (or closes with the wrong bracket).
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut state = ScanState::Normal;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if !state.step(b) {
            continue;
        }
        match b {
            b'{' | b'[' => stack.push(b),
            b'}' | b']' => {
                let open = stack.pop()?;
                if (open == b'{') != (b == b'}') {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove commas that directly precede `}` or `]`, ignoring string contents.
pub fn strip_trailing_commas(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut keep = vec![true; bytes.len()];
    let mut state = ScanState::Normal;
    let mut pending_comma: Option<usize> = None;

    for (i, &b) in bytes.iter().enumerate() {
        if !state.step(b) {
            pending_comma = None;
            continue;
        }
        match b {
            b',' => pending_comma = Some(i),
            b'}' | b']' => {
                if let Some(c) = pending_comma.take() {
                    keep[c] = false;
                }
            }
            b if b.is_ascii_whitespace() => {}
            _ => pending_comma = None,
        }
    }

    let kept: Vec<u8> = bytes
        .iter()
        .zip(keep)
        .filter_map(|(&b, k)| k.then_some(b))
        .collect();
    // Only ASCII commas were removed, so the bytes are still valid UTF-8.
    String::from_utf8(kept).unwrap_or_else(|_| text.to_string())
}

/// Step 2: first opening bracket, balanced scan, comma strip.
fn parse_balanced<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let start = text
        .find(['{', '['])
        .ok_or_else(|| "no opening bracket".to_string())?;
    let end = balanced_end(text, start).ok_or_else(|| "unbalanced brackets".to_string())?;
    let span = &text[start..=end];
    serde_json::from_str(&strip_trailing_commas(span)).map_err(|e| e.to_string())
}

fn accepted<T>(parsed: Result<T, String>, accept: &impl Fn(&T) -> bool) -> Result<T, String> {
    let value = parsed?;
    if accept(&value) {
        Ok(value)
    } else {
        Err("parsed value has the wrong shape".to_string())
    }
}

/// Interiors of fenced code blocks carrying a language tag (```json).
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let Some(newline) = after.find('\n') else {
            break;
        };
        let tag = after[..newline].trim();
        let body = &after[newline + 1..];
        let Some(close) = body.find("```") else {
            break;
        };
        if !tag.is_empty() && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            out.push(&body[..close]);
        }
        rest = &body[close + 3..];
    }
    out
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect::<String>().replace('\n', " ")
}

/// Run the recovery chain, stopping at the first step that parses.
pub fn recover<T: DeserializeOwned>(raw: &str) -> Result<Repaired<T>, RepairError> {
    recover_where(raw, |_| true)
}

/// Run the recovery chain, stopping at the first step whose value parses
/// and passes `accept`. A rejected value falls through to the next step.
pub fn recover_where<T: DeserializeOwned>(
    raw: &str,
    accept: impl Fn(&T) -> bool,
) -> Result<Repaired<T>, RepairError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(RepairError::Empty);
    }

    let direct = serde_json::from_str::<T>(text).map_err(|e| e.to_string());
    let mut last_error = match accepted(direct, &accept) {
        Ok(value) => {
            return Ok(Repaired {
                value,
                step: RepairStep::Direct,
            })
        }
        Err(e) => e,
    };

    match accepted(parse_balanced::<T>(text), &accept) {
        Ok(value) => {
            return Ok(Repaired {
                value,
                step: RepairStep::Balanced,
            })
        }
        Err(e) => last_error = e,
    }

    for block in fenced_blocks(text) {
        match accepted(parse_balanced::<T>(block), &accept) {
            Ok(value) => {
                return Ok(Repaired {
                    value,
                    step: RepairStep::Fenced,
                })
            }
            Err(e) => last_error = e,
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            let widest = &text[start..=end];
            let attempt = parse_balanced::<T>(widest).or_else(|_| {
                serde_json::from_str::<T>(&strip_trailing_commas(widest)).map_err(|e| e.to_string())
            });
            match accepted(attempt, &accept) {
                Ok(value) => {
                    return Ok(Repaired {
                        value,
                        step: RepairStep::Widest,
                    })
                }
                Err(e) => last_error = e,
            }
        }
    }

    Err(RepairError::Unrecoverable {
        last_error,
        preview: preview(text),
    })
}

/// Recovery specialised to the generated-document shape. Stray `{ }` or `[]`
/// in prose deserializes into an empty document, so a step only counts when
/// the value carries `files`.
pub fn recover_document(raw: &str) -> Result<Repaired<GeneratedDocument>, RepairError> {
    recover_where(raw, GeneratedDocument::is_structured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn direct_parse_wins_first() {
        let r: Repaired<Value> = recover(r#"{"a": 1}"#).unwrap();
        assert_eq!(r.step, RepairStep::Direct);
        assert_eq!(r.value, json!({"a": 1}));
    }

    #[test]
    fn prose_wrapped_with_trailing_commas() {
        let raw = "Here you go:\n{\"a\": [1, 2,], \"b\": {\"c\": \"x, ]\",},}\nThanks!";
        let r: Repaired<Value> = recover(raw).unwrap();
        assert_eq!(r.step, RepairStep::Balanced);
        assert_eq!(r.value, json!({"a": [1, 2], "b": {"c": "x, ]"}}));
    }

    #[test]
    fn brackets_inside_strings_do_not_close() {
        let text = r#"{"s": "} ] \" }", "n": 1} trailing"#;
        let end = balanced_end(text, 0).unwrap();
        assert_eq!(&text[end..end + 1], "}");
        assert_eq!(text[..=end].len(), text.len() - " trailing".len());
    }

    #[test]
    fn fenced_block_beats_prose_brackets() {
        let raw = "Notes [draft] {bad}\n```json\n{\"ok\": true}\n```\n";
        let r: Repaired<Value> = recover(raw).unwrap();
        assert_eq!(r.step, RepairStep::Fenced);
        assert_eq!(r.value, json!({"ok": true}));
    }

    #[test]
    fn widest_span_as_last_resort() {
        // first bracket opens a prose list that never balances
        let raw = "Sections: [one, two\n{\"k\": \"v\",}";
        let r: Repaired<Value> = recover(raw).unwrap();
        assert_eq!(r.step, RepairStep::Widest);
        assert_eq!(r.value, json!({"k": "v"}));
    }

    #[test]
    fn unrecoverable_and_empty() {
        assert!(matches!(
            recover::<Value>("no json here"),
            Err(RepairError::Unrecoverable { .. })
        ));
        assert!(matches!(recover::<Value>("   "), Err(RepairError::Empty)));
    }

    #[test]
    fn rejected_shape_falls_through_to_the_fence() {
        let raw = "Kept colors in :root { } as asked.\n```json\n{\"files\": {\"a.html\": \"x\"}}\n```";
        let r = recover_document(raw).unwrap();
        assert_eq!(r.step, RepairStep::Fenced);
        assert!(r.value.is_structured());

        let loose: Repaired<Value> = recover(raw).unwrap();
        assert_eq!(loose.step, RepairStep::Balanced);
    }

    #[test]
    fn shapeless_documents_are_unrecoverable() {
        assert!(matches!(
            recover_document("{}"),
            Err(RepairError::Unrecoverable { .. })
        ));
        assert!(matches!(
            recover_document(r#"{"entry": "a.html", "notes": "n"}"#),
            Err(RepairError::Unrecoverable { .. })
        ));
    }

    #[test]
    fn comma_strip_respects_strings() {
        assert_eq!(strip_trailing_commas(r#"["a,]", ]"#), r#"["a,]" ]"#);
        assert_eq!(strip_trailing_commas("{\"a\": 1 ,\n }"), "{\"a\": 1 \n }");
    }
}
