//! Streaming step transport.
//!
//! A worker thread runs the guarded step against the shared store while the
//! caller consumes a channel of events: best-effort `stage` markers followed
//! by exactly one terminal `result` or `error`. A consumer that disconnects
//! does not cancel the worker; the step runs to completion and the dropped
//! events go nowhere.

use futures::channel::mpsc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;

use crate::llm::{StageEmitter, StageEvent};
use crate::session::pipeline::StepResponse;
use crate::session::runtime::StoryRuntime;
use crate::types::SessionId;

/// One server-sent event of the step stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum StreamEvent {
    Stage(StageEvent),
    Result(StepResponse),
    Error { status: u16, detail: Value },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Stage(_))
    }

    /// Encode as a `text/event-stream` frame.
    pub fn sse_encode(&self) -> String {
        let (name, data) = match self {
            StreamEvent::Stage(stage) => (
                "stage",
                serde_json::to_string(stage).unwrap_or_else(|_| "{}".to_string()),
            ),
            StreamEvent::Result(response) => (
                "result",
                serde_json::to_string(response).unwrap_or_else(|_| "{}".to_string()),
            ),
            StreamEvent::Error { status, detail } => (
                "error",
                serde_json::to_string(&serde_json::json!({
                    "status": status,
                    "detail": detail,
                }))
                .unwrap_or_else(|_| "{}".to_string()),
            ),
        };
        format!("event: {name}\ndata: {data}\n\n")
    }
}

/// Stage emitter that forwards into the stream channel. Send failures mean
/// the consumer went away; stages are best-effort, so they are ignored.
struct ChannelStageEmitter {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StageEmitter for ChannelStageEmitter {
    fn emit(&self, event: StageEvent) {
        let _ = self.tx.unbounded_send(StreamEvent::Stage(event));
    }
}

/// The consumer half of a streaming step. Implements `futures::Stream`; a
/// blocking pull is provided for synchronous transports.
#[derive(Debug)]
pub struct StepEventStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StepEventStream {
    /// Block for the next event; `None` once the worker is done.
    pub fn next_blocking(&mut self) -> Option<StreamEvent> {
        futures::executor::block_on(self.rx.next())
    }

    /// Drain the whole stream, blocking until the terminal event.
    pub fn collect_blocking(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_blocking() {
            events.push(event);
        }
        events
    }
}

impl futures::Stream for StepEventStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

/// Launch a step on a worker thread and return the event stream.
pub fn step_session_stream(
    runtime: StoryRuntime,
    session_id: SessionId,
    choice_id: Option<String>,
    player_input: Option<String>,
    idempotency_key: Option<String>,
) -> StepEventStream {
    let (tx, rx) = mpsc::unbounded();
    let stage_tx = tx.clone();
    let worker_tx = tx.clone();

    let spawned = std::thread::Builder::new()
        .name("step-stream-worker".to_string())
        .spawn(move || {
            let emitter = ChannelStageEmitter { tx: stage_tx };
            let outcome = runtime.step_session(
                &session_id,
                choice_id.as_deref(),
                player_input.as_deref(),
                idempotency_key.as_deref(),
                &emitter,
            );
            let terminal = match outcome {
                Ok(response) => StreamEvent::Result(response),
                Err(error) => StreamEvent::Error {
                    status: error.http_status(),
                    detail: error.detail_json()["detail"].clone(),
                },
            };
            let _ = worker_tx.unbounded_send(terminal);
        });

    // The terminal-event contract holds even when the worker never starts.
    if let Err(error) = spawned {
        let _ = tx.unbounded_send(StreamEvent::Error {
            status: 500,
            detail: serde_json::json!({
                "code": "INTERNAL_ERROR",
                "message": error.to_string(),
            }),
        });
    }

    StepEventStream { rx }
}
