//! # Fabula Core - Interactive-Story Runtime
//!
//! Rust implementation of the story runtime core providing:
//! - Per-session step pipeline with atomic state transitions
//! - Quest, runtime-event and ending engines over declarative story packs
//! - Selection resolver with intent rules, LLM mapping and a fallback tree
//! - Strict-JSON LLM transport with deadlines, retries and a circuit breaker
//! - Two-phase step idempotency and snapshot/rollback
//! - Streaming step transport (stage events + one terminal result/error)
//!
//! ## Architecture
//!
//! The `StoryRuntime` owns the mutable world behind a transactional store:
//! ```text
//!   step request → idempotency guard → ┌───────────────────────────────┐
//!                                      │        StoryRuntime           │
//!                                      │  ┌──────────┐ ┌───────────┐   │
//!                                      │  │ Resolver │ │ Quest/    │   │
//!                                      │  │ +Fallback│ │ Event/End │   │
//!                                      │  └──────────┘ └───────────┘   │
//!                                      │  ┌──────────┐ ┌───────────┐   │
//!                                      │  │   LLM    │ │  Memory   │   │
//!                                      │  │Transport │ │   Store   │   │
//!                                      │  └──────────┘ └───────────┘   │
//!                                      └───────────────────────────────┘
//! ```
//! HTTP/SSE framing and auth live in the embedding server; errors carry
//! stable codes plus HTTP statuses so that mapping stays mechanical.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod engine;
pub mod hashing;
pub mod llm;
pub mod pack;
pub mod replay;
pub mod session;
pub mod state;
pub mod store;
pub mod types;

// Internal utilities
pub mod observability;

pub use session::{StepResponse, StoryRuntime, StreamEvent};
pub use types::{Config, Env, Error, Result};
