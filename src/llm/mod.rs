//! LLM transport core.
//!
//! Strict-JSON calls to the model provider: one prompt in, one
//! schema-validated reply out. The transport layers per-call timeouts, a
//! total deadline, bounded retries with fixed backoff, a per-provider
//! circuit breaker and best-effort stage emission on top of a swappable
//! [`ChatProvider`] capability.

pub mod error;
pub mod parse;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod transport;
pub mod types;

pub use error::TransportError;
pub use parse::{
    parse_narrative, parse_selection, NarrativeOutput, SelectionOutput, NARRATIVE_SCHEMA_NAME,
    SELECTION_SCHEMA_NAME,
};
pub use progress::{
    build_stage_event, emit_stage, NoopStageEmitter, StageEmitter, StageEvent,
    STAGE_LLM_RETRY, STAGE_NARRATION_START, STAGE_SELECTION_START,
};
pub use provider::{ChatProvider, HttpProvider, ProviderReply, ProviderRequest, ScriptedProvider};
pub use transport::LlmTransport;
pub use types::LlmTimeoutProfile;
