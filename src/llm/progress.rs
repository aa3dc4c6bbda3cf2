//! Stage progress events.
//!
//! Stages are human-facing markers ("selecting intent", "generating
//! narration") surfaced mid-step by the streaming transport. Emission is
//! strictly best-effort: a failing emitter must never break the LLM workflow.

use serde::{Deserialize, Serialize};

pub const STAGE_SELECTION_START: &str = "play.selection.start";
pub const STAGE_NARRATION_START: &str = "play.narration.start";
pub const STAGE_LLM_RETRY: &str = "llm.retry";

/// One stage marker with its locale-resolved label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub stage_code: String,
    pub label: String,
    pub locale: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<String>,
}

/// Receiver for stage events. The default implementation drops them.
pub trait StageEmitter: Send + Sync {
    fn emit(&self, event: StageEvent);
}

/// No-op emitter used whenever the caller does not stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStageEmitter;

impl StageEmitter for NoopStageEmitter {
    fn emit(&self, _event: StageEvent) {}
}

/// Collapse a locale tag to the two supported label languages.
pub fn normalize_stage_locale(locale: &str) -> &'static str {
    if locale.trim().to_lowercase().starts_with("zh") {
        "zh"
    } else {
        "en"
    }
}

/// Human label for a stage code, localized.
pub fn stage_label(stage_code: &str, locale: &str, request_kind: Option<&str>) -> String {
    let use_zh = normalize_stage_locale(locale) == "zh";
    let label = match stage_code {
        STAGE_SELECTION_START => {
            if use_zh {
                "正在发送意图映射请求..."
            } else {
                "Sending intent mapping request..."
            }
        }
        STAGE_NARRATION_START => {
            if use_zh {
                "正在发送叙事生成请求..."
            } else {
                "Sending narrative generation request..."
            }
        }
        STAGE_LLM_RETRY => {
            if use_zh {
                "正在尝试重新请求..."
            } else {
                "Retrying request..."
            }
        }
        _ => {
            if request_kind == Some("free_input") {
                if use_zh {
                    "正在发送意图映射请求..."
                } else {
                    "Sending intent mapping request..."
                }
            } else if use_zh {
                "正在发送请求..."
            } else {
                "Sending request..."
            }
        }
    };
    label.to_string()
}

/// Build a stage event with its localized label.
pub fn build_stage_event(
    stage_code: &str,
    locale: &str,
    task: Option<&str>,
    request_kind: Option<&str>,
) -> StageEvent {
    let locale_norm = normalize_stage_locale(locale);
    StageEvent {
        stage_code: stage_code.trim().to_string(),
        label: stage_label(stage_code, locale_norm, request_kind),
        locale: locale_norm.to_string(),
        task: task.map(str::to_string).filter(|t| !t.is_empty()),
        request_kind: request_kind.map(str::to_string).filter(|k| !k.is_empty()),
    }
}

/// Emit a stage event, swallowing emitter panics. The stage signal must
/// never break the primary LLM workflow.
pub fn emit_stage(
    emitter: &dyn StageEmitter,
    stage_code: &str,
    locale: &str,
    task: Option<&str>,
    request_kind: Option<&str>,
) {
    let event = build_stage_event(stage_code, locale, task, request_kind);
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        emitter.emit(event);
    }));
}
