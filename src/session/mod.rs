//! Session subsystem: the step pipeline, idempotency guard, streaming
//! transport, session services and the runtime facade that ties them to the
//! store and the LLM transport.

pub mod debug;
pub mod idempotency;
pub mod pipeline;
pub mod runtime;
pub mod service;
pub mod stream;

pub use pipeline::{CurrentNodeView, StepResponse};
pub use runtime::StoryRuntime;
pub use service::{SessionCreated, SessionEnded, SessionView};
pub use stream::{StepEventStream, StreamEvent};
