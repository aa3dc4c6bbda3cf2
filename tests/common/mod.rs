//! Shared test fixtures: a three-node story pack and runtime builders.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;

use fabula_core::llm::{LlmTransport, ScriptedProvider};
use fabula_core::session::StoryRuntime;
use fabula_core::types::Config;

/// Three-node pack: n1 (Study/Rest) → n2 (Work/Rest) → n3 (end, loops on
/// Rest/Work). Both non-end nodes carry an explicit-next fallback block.
pub fn make_pack(story_id: &str) -> Value {
    json!({
        "story_id": story_id,
        "version": 1,
        "title": "Tiny Story",
        "start_node_id": "n1",
        "initial_state": {},
        "nodes": [
            {
                "node_id": "n1",
                "scene_brief": "Start",
                "is_end": false,
                "choices": [
                    {
                        "choice_id": "c1",
                        "display_text": "Study",
                        "action": {"action_id": "study", "params": {}},
                        "next_node_id": "n2",
                        "is_key_decision": false
                    },
                    {
                        "choice_id": "c2",
                        "display_text": "Rest",
                        "action": {"action_id": "rest", "params": {}},
                        "next_node_id": "n2",
                        "is_key_decision": false
                    }
                ],
                "intents": [],
                "fallback": {
                    "id": "fb_n1",
                    "action": {"action_id": "rest", "params": {}},
                    "next_node_id_policy": "explicit_next",
                    "next_node_id": "n2",
                    "text_variants": {
                        "NO_INPUT": "You hesitate and lose your timing.",
                        "BLOCKED": "That path is blocked for now, so you steady yourself.",
                        "FALLBACK": "Your aim is unclear, so you hold position.",
                        "DEFAULT": "You pause to reassess."
                    }
                }
            },
            {
                "node_id": "n2",
                "scene_brief": "Middle",
                "is_end": false,
                "choices": [
                    {
                        "choice_id": "c3",
                        "display_text": "Work",
                        "action": {"action_id": "work", "params": {}},
                        "next_node_id": "n3",
                        "is_key_decision": false
                    },
                    {
                        "choice_id": "c4",
                        "display_text": "Rest",
                        "action": {"action_id": "rest", "params": {}},
                        "next_node_id": "n3",
                        "is_key_decision": false
                    }
                ],
                "fallback": {
                    "id": "fb_n2",
                    "action": {"action_id": "rest", "params": {}},
                    "next_node_id_policy": "explicit_next",
                    "next_node_id": "n3",
                    "text_variants": {"DEFAULT": "You pause."}
                }
            },
            {
                "node_id": "n3",
                "scene_brief": "End",
                "is_end": true,
                "choices": [
                    {
                        "choice_id": "c5",
                        "display_text": "Rest",
                        "action": {"action_id": "rest", "params": {}},
                        "next_node_id": "n3",
                        "is_key_decision": false
                    },
                    {
                        "choice_id": "c6",
                        "display_text": "Work",
                        "action": {"action_id": "work", "params": {}},
                        "next_node_id": "n3",
                        "is_key_decision": false
                    }
                ]
            }
        ]
    })
}

/// Runtime against the deterministic scripted provider (`env=test`).
pub fn test_runtime() -> StoryRuntime {
    StoryRuntime::init(Config::for_tests()).expect("runtime init")
}

/// Runtime whose provider handle is kept so tests can flip failure toggles.
pub fn toggled_runtime() -> (StoryRuntime, Arc<ScriptedProvider>) {
    let config = Config::for_tests();
    let provider = Arc::new(ScriptedProvider::new());
    let transport =
        LlmTransport::with_provider(&config, provider.clone()).expect("transport init");
    (
        StoryRuntime::with_transport(config, Arc::new(transport)),
        provider,
    )
}

/// Publish a pack and open a session on it.
pub fn start_session(runtime: &StoryRuntime, pack: Value) -> fabula_core::types::SessionId {
    let story_id = pack["story_id"].as_str().expect("story_id").to_string();
    runtime
        .publish_story(&story_id, 1, pack, true)
        .expect("publish");
    runtime
        .create_session(&story_id, None)
        .expect("create session")
        .session_id
}

/// Internal tokens that must never leak into narration.
pub const FORBIDDEN_NARRATIVE_TOKENS: [&str; 10] = [
    "NO_INPUT",
    "INVALID_CHOICE_ID",
    "NO_MATCH",
    "LLM_PARSE_ERROR",
    "PREREQ_BLOCKED",
    "__fallback__",
    "next_node_id",
    "choice_id",
    "intent_id",
    "confidence",
];

pub fn assert_no_internal_story_tokens(narrative: &str) {
    for token in FORBIDDEN_NARRATIVE_TOKENS {
        assert!(
            !narrative.contains(token),
            "narrative leaked internal token '{token}': {narrative}"
        );
    }
    for phrase in ["invalid choice", "unknown action"] {
        assert!(
            !narrative.to_lowercase().contains(phrase),
            "narrative uses error-system phrasing '{phrase}': {narrative}"
        );
    }
}
