//! The story runtime facade.
//!
//! Owns the store handle, the injected LLM transport and the configuration;
//! every external operation of the runtime goes through here. The embedding
//! HTTP server holds one `StoryRuntime` and maps its errors to responses via
//! `Error::http_status` / `Error::code`.

use std::sync::Arc;

use serde_json::Value;

use crate::llm::{LlmTransport, NoopStageEmitter, StageEmitter};
use crate::session::pipeline::StepResponse;
use crate::session::stream::{step_session_stream, StepEventStream};
use crate::session::{debug, service};
use crate::store::MemoryStore;
use crate::types::{Config, Result, SessionId, SnapshotId};

/// One runtime instance; cheap to clone, clones share the store and
/// transport.
#[derive(Debug, Clone)]
pub struct StoryRuntime {
    store: MemoryStore,
    transport: Arc<LlmTransport>,
    config: Config,
}

impl StoryRuntime {
    /// Build a runtime with a fresh store and a transport for the config's
    /// environment.
    pub fn init(config: Config) -> Result<Self> {
        let transport = Arc::new(LlmTransport::init(&config)?);
        Ok(Self {
            store: MemoryStore::new(),
            transport,
            config,
        })
    }

    /// Build with an explicit transport (tests, custom providers).
    pub fn with_transport(config: Config, transport: Arc<LlmTransport>) -> Self {
        Self {
            store: MemoryStore::new(),
            transport,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Publish or seed a story version.
    pub fn publish_story(
        &self,
        story_id: &str,
        version: u32,
        pack_json: Value,
        is_published: bool,
    ) -> Result<()> {
        service::publish_story(&self.store, story_id, version, pack_json, is_published)
    }

    pub fn create_session(
        &self,
        story_id: &str,
        version: Option<u32>,
    ) -> Result<service::SessionCreated> {
        service::create_session(&self.store, story_id, version)
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<service::SessionView> {
        service::get_session(&self.store, session_id)
    }

    /// One guarded step. Exactly one of `choice_id` / `player_input` may be
    /// provided; stage events go to `emitter`.
    pub fn step_session(
        &self,
        session_id: &SessionId,
        choice_id: Option<&str>,
        player_input: Option<&str>,
        idempotency_key: Option<&str>,
        emitter: &dyn StageEmitter,
    ) -> Result<StepResponse> {
        service::step_session(
            &self.store,
            &self.transport,
            &self.config,
            session_id,
            choice_id,
            player_input,
            idempotency_key,
            emitter,
        )
    }

    /// One guarded step without stage streaming.
    pub fn step(
        &self,
        session_id: &SessionId,
        choice_id: Option<&str>,
        player_input: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<StepResponse> {
        self.step_session(
            session_id,
            choice_id,
            player_input,
            idempotency_key,
            &NoopStageEmitter,
        )
    }

    /// Run a step on a worker and stream stage/result/error events.
    pub fn step_session_stream(
        &self,
        session_id: &SessionId,
        choice_id: Option<String>,
        player_input: Option<String>,
        idempotency_key: Option<String>,
    ) -> StepEventStream {
        step_session_stream(
            self.clone(),
            session_id.clone(),
            choice_id,
            player_input,
            idempotency_key,
        )
    }

    pub fn create_snapshot(&self, session_id: &SessionId) -> Result<SnapshotId> {
        service::create_snapshot(&self.store, session_id)
    }

    pub fn rollback_to_snapshot(
        &self,
        session_id: &SessionId,
        snapshot_id: &SnapshotId,
    ) -> Result<service::SessionView> {
        service::rollback_to_snapshot(&self.store, session_id, snapshot_id)
    }

    pub fn end_session(&self, session_id: &SessionId) -> Result<service::SessionEnded> {
        service::end_session(&self.store, session_id)
    }

    pub fn get_replay(&self, session_id: &SessionId) -> Result<Value> {
        service::get_replay(&self.store, session_id)
    }

    /// Dev-only inspector over recent steps.
    pub fn layer_inspector(&self, session_id: &SessionId, limit: usize) -> Result<Value> {
        debug::layer_inspector(&self.store, &self.config, session_id, limit)
    }

    /// Maintenance: drop expired idempotency rows.
    pub fn sweep_expired_idempotency(&self) -> Result<usize> {
        service::sweep_expired_idempotency(&self.store)
    }
}
