//! Core shared types: configuration, errors, identifiers.

pub mod config;
pub mod errors;
pub mod ids;

pub use config::{Config, Env, IdempotencyConfig, LlmConfig, ObservabilityConfig, PromptConfig};
pub use errors::{Error, LlmErrorKind, Result};
pub use ids::{ActionLogId, ReportId, SessionId, SnapshotId};
