//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! variant maps to a stable string code and an HTTP status so the transport
//! layer converts mechanically — errors are values here, never control flow
//! smuggled through the transport (step failures return `Err`, they do not
//! throw past the idempotency guard).

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for an exhausted LLM call chain.
///
/// Mirrors the narrative error kinds surfaced in `LLM_UNAVAILABLE` details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Timeout,
    Network,
    HttpStatus,
    JsonParse,
    SchemaValidate,
}

impl LlmErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmErrorKind::Timeout => "NARRATIVE_TIMEOUT",
            LlmErrorKind::Network => "NARRATIVE_NETWORK",
            LlmErrorKind::HttpStatus => "NARRATIVE_HTTP_STATUS",
            LlmErrorKind::JsonParse => "NARRATIVE_JSON_PARSE",
            LlmErrorKind::SchemaValidate => "NARRATIVE_SCHEMA_VALIDATE",
        }
    }
}

/// Main error enum for the story runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Session has no story, or a create request omitted the story id (400).
    #[error("story required")]
    StoryRequired,

    /// Unknown story id or version (404).
    #[error("story not found: {0}")]
    StoryNotFound(String),

    /// Pack failed runtime validation at session creation (400).
    #[error("invalid story start node: {0}")]
    InvalidStoryStartNode(String),

    /// Pack shape predates the v1.0 runtime form (400).
    #[error("runtime pack v1.0 required: {0}")]
    RuntimePackV10Required(String),

    /// Both `choice_id` and `player_input` were provided (422).
    #[error("provide exactly one of choice_id or player_input")]
    InputConflict,

    /// Session already ended (409).
    #[error("session not active")]
    SessionNotActive,

    /// Same idempotency key currently executing (409).
    #[error("request in progress")]
    RequestInProgress,

    /// Same idempotency key, different payload hash (409).
    #[error("idempotency key reused with a different payload")]
    IdempotencyKeyReused,

    /// Narrator/selector chain exhausted (503). Safe to retry with the same
    /// idempotency key: the step transaction rolled back.
    #[error("llm unavailable: {message}")]
    LlmUnavailable {
        kind: LlmErrorKind,
        message: String,
    },

    /// Inspector endpoints are only served in `env=dev` (404).
    #[error("debug views disabled")]
    DebugDisabled,

    /// Replay report not built yet for this session (404).
    #[error("replay report not ready")]
    ReplayNotReady,

    /// Deprecated in the core path; retained for backwards-compat audit (409).
    #[error("token budget exceeded")]
    TokenBudgetExceeded,

    /// Generic missing row: session, snapshot (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Request shape violations outside the enumerated codes (422).
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal errors (500); the idempotency row is marked `failed`.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors (500).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable string code surfaced to clients under `detail.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::StoryRequired => "STORY_REQUIRED",
            Error::StoryNotFound(_) => "STORY_NOT_FOUND",
            Error::InvalidStoryStartNode(_) => "INVALID_STORY_START_NODE",
            Error::RuntimePackV10Required(_) => "RUNTIME_PACK_V10_REQUIRED",
            Error::InputConflict => "INPUT_CONFLICT",
            Error::SessionNotActive => "SESSION_NOT_ACTIVE",
            Error::RequestInProgress => "REQUEST_IN_PROGRESS",
            Error::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            Error::LlmUnavailable { .. } => "LLM_UNAVAILABLE",
            Error::DebugDisabled => "DEBUG_DISABLED",
            Error::ReplayNotReady => "REPLAY_NOT_READY",
            Error::TokenBudgetExceeded => "TOKEN_BUDGET_EXCEEDED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Internal(_) | Error::Serialization(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the transport collaborator should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::StoryRequired
            | Error::InvalidStoryStartNode(_)
            | Error::RuntimePackV10Required(_) => 400,
            Error::StoryNotFound(_)
            | Error::DebugDisabled
            | Error::ReplayNotReady
            | Error::NotFound(_) => 404,
            Error::SessionNotActive
            | Error::RequestInProgress
            | Error::IdempotencyKeyReused
            | Error::TokenBudgetExceeded => 409,
            Error::InputConflict | Error::Validation(_) => 422,
            Error::LlmUnavailable { .. } => 503,
            Error::Internal(_) | Error::Serialization(_) => 500,
        }
    }

    /// `{status, detail: {code, message}}` payload for error transports.
    pub fn detail_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.http_status(),
            "detail": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

// Convenience constructors
impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn pack_invalid(msg: impl Into<String>) -> Self {
        Self::RuntimePackV10Required(msg.into())
    }

    pub fn llm_unavailable(kind: LlmErrorKind, msg: impl Into<String>) -> Self {
        Self::LlmUnavailable {
            kind,
            message: msg.into(),
        }
    }
}
