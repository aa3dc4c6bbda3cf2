//! Transport-internal error taxonomy.
//!
//! These errors stay inside the LLM transport; once all attempts are
//! exhausted the final one is wrapped into the crate-level `LLM_UNAVAILABLE`
//! error with its kind and a redacted raw snippet.

use thiserror::Error;

use crate::types::LlmErrorKind;

/// One failed LLM call attempt.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("call timed out")]
    Timeout,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("network I/O failed: {0}")]
    Network(String),

    #[error("remote protocol error: {0}")]
    Protocol(String),

    #[error("http status {0}")]
    HttpStatus(u16),

    #[error("json parse failed: {message}")]
    JsonParse {
        message: String,
        raw_snippet: Option<String>,
    },

    #[error("schema validation failed: {message}")]
    SchemaValidate {
        message: String,
        raw_snippet: Option<String>,
    },

    #[error("circuit breaker open for provider '{0}'")]
    CircuitOpen(String),

    #[error("total deadline exceeded")]
    DeadlineExceeded,
}

impl TransportError {
    /// Whether another attempt may be spent on this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout
            | TransportError::Connect(_)
            | TransportError::Network(_)
            | TransportError::Protocol(_)
            | TransportError::HttpStatus(_)
            | TransportError::JsonParse { .. }
            | TransportError::SchemaValidate { .. } => true,
            TransportError::CircuitOpen(_) | TransportError::DeadlineExceeded => false,
        }
    }

    /// Whether this failure counts against the provider's circuit breaker.
    pub fn is_network_class(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::Connect(_)
                | TransportError::Network(_)
                | TransportError::Protocol(_)
                | TransportError::HttpStatus(_)
        )
    }

    /// Taxonomy kind surfaced in the `LLM_UNAVAILABLE` wrapper.
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            TransportError::Timeout | TransportError::DeadlineExceeded => LlmErrorKind::Timeout,
            TransportError::Connect(_)
            | TransportError::Network(_)
            | TransportError::Protocol(_)
            | TransportError::CircuitOpen(_) => LlmErrorKind::Network,
            TransportError::HttpStatus(_) => LlmErrorKind::HttpStatus,
            TransportError::JsonParse { .. } => LlmErrorKind::JsonParse,
            TransportError::SchemaValidate { .. } => LlmErrorKind::SchemaValidate,
        }
    }

    pub fn raw_snippet(&self) -> Option<&str> {
        match self {
            TransportError::JsonParse { raw_snippet, .. }
            | TransportError::SchemaValidate { raw_snippet, .. } => raw_snippet.as_deref(),
            _ => None,
        }
    }
}

/// Render the exhausted-chain message carried by `LLM_UNAVAILABLE`.
pub fn format_chain_error(last_error: &TransportError) -> String {
    let mut message = format!("provider chain exhausted: {last_error}");
    message.push_str(&format!(" | kind={}", last_error.kind().as_str()));
    if let Some(snippet) = last_error.raw_snippet() {
        message.push_str(&format!(" | raw={snippet}"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::HttpStatus(500).is_retryable());
        assert!(TransportError::JsonParse {
            message: "bad".into(),
            raw_snippet: None
        }
        .is_retryable());
        assert!(!TransportError::CircuitOpen("p".into()).is_retryable());
        assert!(!TransportError::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn test_network_class_excludes_parse_errors() {
        assert!(TransportError::Connect("refused".into()).is_network_class());
        assert!(!TransportError::SchemaValidate {
            message: "missing".into(),
            raw_snippet: None
        }
        .is_network_class());
    }

    #[test]
    fn test_chain_error_carries_kind_and_snippet() {
        let error = TransportError::SchemaValidate {
            message: "narrative_text missing".into(),
            raw_snippet: Some("{\"narrative\": \"x\"}".into()),
        };
        let message = format_chain_error(&error);
        assert!(message.contains("kind=NARRATIVE_SCHEMA_VALIDATE"));
        assert!(message.contains("raw="));
    }
}
