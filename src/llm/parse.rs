//! Reply parsing, schema validation and redaction.
//!
//! The raw provider reply is either a JSON string or an already-decoded
//! object. Strings are unwrapped from fenced code blocks and, when prose
//! surrounds the payload, the first `{…}` fragment is extracted. The decoded
//! object is then validated against the named schema before deserializing
//! into the typed output.

use jsonschema::Validator;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use crate::llm::error::TransportError;

/// Reply schema `story_selection_v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectionOutput {
    pub choice_id: Option<String>,
    pub use_fallback: bool,
    pub confidence: f64,

    #[serde(default)]
    pub intent_id: Option<String>,

    #[serde(default)]
    pub notes: Option<String>,
}

/// Reply schema `story_narrative_v1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NarrativeOutput {
    pub narrative_text: String,
}

pub const SELECTION_SCHEMA_NAME: &str = "story_selection_v1";
pub const NARRATIVE_SCHEMA_NAME: &str = "story_narrative_v1";

const MAX_SNIPPET_CHARS: usize = 200;

/// Redact API-key-like tokens and normalize whitespace/`|` for error details.
/// Never returns more than 200 characters.
pub fn sanitize_raw_snippet(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).ok()?,
    };
    let mut flattened: String = text
        .replace(['\r', '\n', '\t'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    flattened = redact_key_tokens(&flattened).replace('|', "/");
    if flattened.is_empty() {
        return None;
    }
    Some(flattened.chars().take(MAX_SNIPPET_CHARS).collect())
}

/// Replace `sk-…` bearer-key-shaped tokens with `[REDACTED_KEY]`.
fn redact_key_tokens(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        let boundary = i == 0 || !bytes[i - 1].is_ascii_alphanumeric();
        if boundary && text[i..].starts_with("sk-") {
            let tail = &text[i + 3..];
            let run: usize = tail
                .bytes()
                .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
                .count();
            if run >= 8 {
                out.push_str("[REDACTED_KEY]");
                i += 3 + run;
                continue;
            }
        }
        let ch = text[i..].chars().next().unwrap_or('\u{FFFD}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Extract the JSON object fragment from text that wraps it in code fences or
/// surrounding prose.
pub fn extract_json_fragment(raw_text: &str) -> Option<&str> {
    let trimmed = raw_text.trim();
    let body = if let Some(after_fence) = trimmed.strip_prefix("```") {
        let after_lang = after_fence
            .strip_prefix("json")
            .or_else(|| after_fence.strip_prefix("JSON"))
            .unwrap_or(after_fence);
        after_lang.strip_suffix("```").unwrap_or(after_lang)
    } else {
        trimmed
    };
    let left = body.find('{')?;
    let right = body.rfind('}')?;
    if right <= left {
        return None;
    }
    Some(body[left..=right].trim())
}

/// Decode a raw reply into a JSON object, unwrapping strings as needed.
fn decode_payload(raw: &Value) -> Result<Value, TransportError> {
    let snippet = sanitize_raw_snippet(raw);
    match raw {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(TransportError::JsonParse {
                    message: "empty response".to_string(),
                    raw_snippet: snippet,
                });
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => Ok(value),
                Err(first_error) => match extract_json_fragment(trimmed) {
                    Some(fragment) => {
                        serde_json::from_str::<Value>(fragment).map_err(|e| {
                            TransportError::JsonParse {
                                message: e.to_string(),
                                raw_snippet: snippet.clone(),
                            }
                        })
                    }
                    None => Err(TransportError::JsonParse {
                        message: first_error.to_string(),
                        raw_snippet: snippet,
                    }),
                },
            }
        }
        Value::Object(_) => Ok(raw.clone()),
        other => Err(TransportError::JsonParse {
            message: format!("expected JSON object, got {other}"),
            raw_snippet: snippet,
        }),
    }
}

fn selection_validator() -> Option<&'static Validator> {
    static VALIDATOR: OnceLock<Option<Validator>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| {
            let schema = serde_json::to_value(schemars::schema_for!(SelectionOutput)).ok()?;
            jsonschema::validator_for(&schema).ok()
        })
        .as_ref()
}

fn narrative_validator() -> Option<&'static Validator> {
    static VALIDATOR: OnceLock<Option<Validator>> = OnceLock::new();
    VALIDATOR
        .get_or_init(|| {
            let schema = serde_json::to_value(schemars::schema_for!(NarrativeOutput)).ok()?;
            jsonschema::validator_for(&schema).ok()
        })
        .as_ref()
}

fn validate_against(
    validator: Option<&Validator>,
    schema_name: &str,
    payload: &Value,
) -> Result<(), TransportError> {
    let Some(validator) = validator else {
        return Err(TransportError::SchemaValidate {
            message: format!("{schema_name}: validator unavailable"),
            raw_snippet: None,
        });
    };
    if validator.is_valid(payload) {
        return Ok(());
    }
    let detail = validator
        .iter_errors(payload)
        .next()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "schema mismatch".to_string());
    Err(TransportError::SchemaValidate {
        message: format!("{schema_name}: {detail}"),
        raw_snippet: sanitize_raw_snippet(payload),
    })
}

/// Parse and validate a raw reply against `story_selection_v1`.
pub fn parse_selection(raw: &Value) -> Result<SelectionOutput, TransportError> {
    let payload = decode_payload(raw)?;
    validate_against(selection_validator(), SELECTION_SCHEMA_NAME, &payload)?;
    serde_json::from_value(payload.clone()).map_err(|e| TransportError::SchemaValidate {
        message: format!("{SELECTION_SCHEMA_NAME}: {e}"),
        raw_snippet: sanitize_raw_snippet(&payload),
    })
}

/// Parse and validate a raw reply against `story_narrative_v1`.
pub fn parse_narrative(raw: &Value) -> Result<NarrativeOutput, TransportError> {
    let payload = decode_payload(raw)?;
    validate_against(narrative_validator(), NARRATIVE_SCHEMA_NAME, &payload)?;
    serde_json::from_value(payload.clone()).map_err(|e| TransportError::SchemaValidate {
        message: format!("{NARRATIVE_SCHEMA_NAME}: {e}"),
        raw_snippet: sanitize_raw_snippet(&payload),
    })
}
