//! LLM transport — deadlines, bounded retries, circuit breaker, stages.
//!
//! The transport owns its own tokio runtime and exposes *blocking* calls so
//! the step orchestrator stays synchronous and transactional reasoning stays
//! simple. Deadlines are explicit parameters, never ambient state; callers
//! already inside an async runtime should wrap calls in `spawn_blocking`.
//!
//! Retries reuse the same prompt — there is no repair-prompt path. Network
//! failures feed a per-provider circuit breaker; while a breaker is open,
//! calls fail fast without touching the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::llm::error::{format_chain_error, TransportError};
use crate::llm::parse::{parse_narrative, parse_selection, NarrativeOutput, SelectionOutput};
use crate::llm::progress::{
    emit_stage, StageEmitter, STAGE_LLM_RETRY, STAGE_NARRATION_START, STAGE_SELECTION_START,
};
use crate::llm::provider::{ChatProvider, HttpProvider, ProviderRequest, ScriptedProvider};
use crate::llm::types::{CircuitState, LlmTimeoutProfile};
use crate::types::{Config, Env, Error, LlmConfig, Result};

const BACKOFF_SCHEDULE: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(1)];
const MIN_CALL_TIMEOUT: Duration = Duration::from_millis(100);

/// The injected LLM transport value. Lifecycle is `init` → calls → `close`;
/// nothing here relies on process-wide singletons.
pub struct LlmTransport {
    config: LlmConfig,
    default_locale: String,
    provider: Arc<dyn ChatProvider>,
    runtime: tokio::runtime::Runtime,
    circuits: Mutex<HashMap<String, CircuitState>>,
}

impl std::fmt::Debug for LlmTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmTransport")
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl LlmTransport {
    /// Build the transport for the configured environment: `env=test` gets
    /// the deterministic scripted provider, everything else the HTTP one.
    pub fn init(config: &Config) -> Result<Self> {
        let provider: Arc<dyn ChatProvider> = match config.env {
            Env::Test => Arc::new(ScriptedProvider::new()),
            _ => Arc::new(
                HttpProvider::new(&config.llm)
                    .map_err(|e| Error::internal(format!("http provider init: {e}")))?,
            ),
        };
        Self::with_provider(config, provider)
    }

    /// Build with an explicit provider (used by tests and embedders).
    pub fn with_provider(config: &Config, provider: Arc<dyn ChatProvider>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("llm-transport")
            .enable_all()
            .build()
            .map_err(|e| Error::internal(format!("transport runtime init: {e}")))?;
        Ok(Self {
            config: config.llm.clone(),
            default_locale: config.prompt.default_locale.clone(),
            provider,
            runtime,
            circuits: Mutex::new(HashMap::new()),
        })
    }

    /// Graceful shutdown of the transport runtime.
    pub fn close(self) {
        self.runtime.shutdown_timeout(Duration::from_secs(2));
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Selector call: strict `story_selection_v1` reply.
    pub fn select_story_choice(
        &self,
        prompt: &str,
        emitter: &dyn StageEmitter,
        locale: Option<&str>,
    ) -> Result<SelectionOutput> {
        let locale = locale.unwrap_or(&self.default_locale);
        emit_stage(
            emitter,
            STAGE_SELECTION_START,
            locale,
            None,
            Some("free_input"),
        );
        self.call_validated(
            prompt,
            &LlmTimeoutProfile::from_config(&self.config),
            parse_selection,
            emitter,
            locale,
            Some("free_input"),
        )
    }

    /// Narrator call: strict `story_narrative_v1` reply.
    pub fn narrate(
        &self,
        prompt: &str,
        profile: Option<&LlmTimeoutProfile>,
        emitter: &dyn StageEmitter,
        locale: Option<&str>,
        request_kind: &str,
    ) -> Result<NarrativeOutput> {
        let locale = locale.unwrap_or(&self.default_locale);
        emit_stage(
            emitter,
            STAGE_NARRATION_START,
            locale,
            None,
            Some(request_kind),
        );
        let default_profile = LlmTimeoutProfile::from_config(&self.config);
        self.call_validated(
            prompt,
            profile.unwrap_or(&default_profile),
            parse_narrative,
            emitter,
            locale,
            Some(request_kind),
        )
    }

    fn call_validated<T>(
        &self,
        prompt: &str,
        profile: &LlmTimeoutProfile,
        parse: fn(&serde_json::Value) -> std::result::Result<T, TransportError>,
        emitter: &dyn StageEmitter,
        locale: &str,
        request_kind: Option<&str>,
    ) -> Result<T> {
        let deadline = if profile.disable_total_deadline {
            None
        } else {
            Some(Instant::now() + self.config.total_deadline)
        };
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = TransportError::DeadlineExceeded;

        for attempt in 0..attempts {
            if self.is_circuit_open() {
                last_error = TransportError::CircuitOpen(self.provider.name().to_string());
                break;
            }
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if matches!(remaining, Some(r) if r.is_zero()) {
                if attempt == 0 {
                    last_error = TransportError::DeadlineExceeded;
                }
                break;
            }

            let mut call_timeout = profile.call_timeout;
            if let Some(remaining) = remaining {
                call_timeout = call_timeout.min(remaining);
            }
            let request = ProviderRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                prompt: prompt.to_string(),
                model: self.config.model.clone(),
                call_timeout: call_timeout.max(MIN_CALL_TIMEOUT),
            };

            match self.runtime.block_on(self.provider.generate(&request)) {
                Ok(reply) => match parse(&reply.raw) {
                    Ok(output) => {
                        self.record_success();
                        return Ok(output);
                    }
                    Err(parse_error) => {
                        tracing::warn!(
                            provider = self.provider.name(),
                            attempt,
                            error = %parse_error,
                            "llm reply failed validation"
                        );
                        last_error = parse_error;
                    }
                },
                Err(transport_error) => {
                    if transport_error.is_network_class() {
                        self.record_network_failure();
                    }
                    tracing::warn!(
                        provider = self.provider.name(),
                        attempt,
                        error = %transport_error,
                        "llm call failed"
                    );
                    let retryable = transport_error.is_retryable();
                    last_error = transport_error;
                    if !retryable {
                        break;
                    }
                }
            }

            if attempt + 1 < attempts {
                let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
                if matches!(remaining, Some(r) if r.is_zero()) {
                    break;
                }
                emit_stage(emitter, STAGE_LLM_RETRY, locale, None, request_kind);
                let mut backoff = BACKOFF_SCHEDULE
                    .get(attempt as usize)
                    .copied()
                    .unwrap_or(Duration::ZERO);
                if let Some(remaining) = remaining {
                    backoff = backoff.min(remaining);
                }
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
            }
        }

        Err(Error::llm_unavailable(
            last_error.kind(),
            format_chain_error(&last_error),
        ))
    }

    fn is_circuit_open(&self) -> bool {
        let Ok(mut circuits) = self.circuits.lock() else {
            return false;
        };
        let circuit = circuits.entry(self.provider.name().to_string()).or_default();
        circuit.is_open(Instant::now(), self.config.circuit_breaker_window)
    }

    fn record_network_failure(&self) {
        let Ok(mut circuits) = self.circuits.lock() else {
            return;
        };
        let circuit = circuits.entry(self.provider.name().to_string()).or_default();
        circuit.record_failure(
            Instant::now(),
            self.config.circuit_breaker_window,
            self.config.circuit_breaker_fail_threshold,
            self.config.circuit_breaker_open,
        );
    }

    fn record_success(&self) {
        let Ok(mut circuits) = self.circuits.lock() else {
            return;
        };
        let circuit = circuits.entry(self.provider.name().to_string()).or_default();
        circuit.record_success();
    }
}
