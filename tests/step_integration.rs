//! End-to-end step pipeline scenarios against the deterministic provider.

mod common;

use common::{
    assert_no_internal_story_tokens, make_pack, start_session, test_runtime, toggled_runtime,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::Ordering;

#[test]
fn test_happy_path_button_clicks_advance_and_time_out() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_adv");
    pack["run_config"] = json!({"max_days": 30, "max_steps": 3, "default_timeout_outcome": "neutral"});
    let session_id = start_session(&runtime, pack);

    let first = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    assert_eq!(first.executed_choice_id, "c1");
    assert_eq!(first.resolved_choice_id, "c1");
    assert!(!first.fallback_used);
    assert_eq!(first.fallback_reason, None);
    assert_eq!(first.story_node_id, "n2");
    assert!(!first.run_ended);
    assert_eq!(first.step_index, 1);
    assert_eq!(first.selection_source, "explicit");
    assert!(!first.narrative_text.is_empty());

    let second = runtime.step(&session_id, Some("c3"), None, None).unwrap();
    assert_eq!(second.story_node_id, "n3");
    assert!(!second.run_ended);

    // Step three exhausts max_steps: synthetic timeout ending.
    let third = runtime.step(&session_id, Some("c5"), None, None).unwrap();
    assert!(third.run_ended);
    assert_eq!(third.ending_id.as_deref(), Some("__timeout__"));
    assert_eq!(third.ending_outcome.as_deref(), Some("neutral"));

    let blocked = runtime.step(&session_id, Some("c5"), None, None).unwrap_err();
    assert_eq!(blocked.code(), "SESSION_NOT_ACTIVE");
    assert_eq!(blocked.http_status(), 409);
}

#[test]
fn test_step_response_has_no_legacy_fields() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_fields"));
    let step = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    let value = serde_json::to_value(&step).unwrap();
    let object = value.as_object().unwrap();
    for absent in ["cost", "affection_delta", "route_type", "choices"] {
        assert!(!object.contains_key(absent), "unexpected field '{absent}'");
    }
    for present in [
        "narrative_text",
        "story_node_id",
        "session_status",
        "run_ended",
        "state_excerpt",
        "executed_choice_id",
        "resolved_choice_id",
        "fallback_used",
        "selection_source",
        "step_index",
    ] {
        assert!(object.contains_key(present), "missing field '{present}'");
    }
}

#[test]
fn test_unknown_choice_id_soft_falls_back_with_200() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_invalid"));

    let step = runtime.step(&session_id, Some("bad"), None, None).unwrap();
    assert_eq!(step.attempted_choice_id.as_deref(), Some("bad"));
    assert!(step.fallback_used);
    assert_eq!(step.fallback_reason.as_deref(), Some("FALLBACK"));
    // the node fallback block jumps explicitly to n2
    assert_eq!(step.executed_choice_id, "fb_n1");
    assert_eq!(step.story_node_id, "n2");
    assert_no_internal_story_tokens(&step.narrative_text);
}

#[test]
fn test_no_input_maps_to_fallback_with_200() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_no_input"));

    let step = runtime.step(&session_id, None, None, None).unwrap();
    assert!(step.fallback_used);
    assert_eq!(step.fallback_reason.as_deref(), Some("NO_INPUT"));
    assert_no_internal_story_tokens(&step.narrative_text);
}

#[test]
fn test_both_inputs_conflict_with_422_and_no_log() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_conflict"));

    let error = runtime
        .step(&session_id, Some("c1"), Some("also text"), None)
        .unwrap_err();
    assert_eq!(error.code(), "INPUT_CONFLICT");
    assert_eq!(error.http_status(), 422);

    runtime
        .store()
        .read(|data| {
            assert!(data.session_action_logs(&session_id).is_empty());
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_prereq_blocked_prefers_node_fallback_choice() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_blocked_pref");
    pack["nodes"][0]["choices"][0]["requires"] = json!({"min_money": 999});
    pack["nodes"][0]["node_fallback_choice_id"] = json!("c2");
    let session_id = start_session(&runtime, pack);

    let step = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    assert!(step.fallback_used);
    assert_eq!(step.fallback_reason.as_deref(), Some("BLOCKED"));
    assert_eq!(step.executed_choice_id, "c2");
    assert_eq!(step.selection_source, "fallback");
    assert_eq!(step.story_node_id, "n2");
}

#[test]
fn test_blocked_reroute_target_degrades_without_progress() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_blocked_degraded");
    pack["nodes"][0]["choices"][0]["requires"] = json!({"min_money": 999});
    pack["nodes"][0]["choices"][1]["requires"] = json!({"min_energy": 999});
    pack["nodes"][0]["node_fallback_choice_id"] = json!("c2");
    let session_id = start_session(&runtime, pack);

    let before = runtime.get_session(&session_id).unwrap();
    let step = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    assert!(step.fallback_used);
    assert_eq!(step.fallback_reason.as_deref(), Some("BLOCKED"));
    assert_eq!(step.story_node_id, "n1");

    let after = runtime.get_session(&session_id).unwrap();
    for axis in ["energy", "money", "knowledge", "affection", "day", "slot"] {
        assert_eq!(after.state_json[axis], before.state_json[axis], "{axis}");
    }
    assert_eq!(after.state_json["run_state"]["fallback_count"], 1);

    runtime
        .store()
        .read(|data| {
            let logs = data.session_action_logs(&session_id);
            let reasons = &logs[0].fallback_reasons;
            assert!(reasons.iter().any(|r| r == "REROUTE_LIMIT_REACHED_DEGRADED"));
            assert!(reasons
                .iter()
                .any(|r| r == "REROUTED_TARGET_PREREQ_BLOCKED_DEGRADED"));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_free_input_selector_executes_visible_choice() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_free_input"));

    let step = runtime
        .step(&session_id, None, Some("study hard tonight"), None)
        .unwrap();
    assert!(!step.fallback_used);
    assert_eq!(step.executed_choice_id, "c1");
    assert_eq!(step.selection_source, "llm");
    assert!(step.mapping_confidence.unwrap() > 0.0);
    assert_no_internal_story_tokens(&step.narrative_text);
}

#[test]
fn test_free_input_intent_rule_skips_selector() {
    let (runtime, provider) = toggled_runtime();
    let mut pack = make_pack("s_intent_alias");
    pack["nodes"][0]["intents"] = json!([{
        "intent_id": "INTENT_ASK_INFO",
        "alias_choice_id": "c1",
        "description": "Gather information before committing.",
        "patterns": ["ask around", "gather intel"]
    }]);
    let session_id = start_session(&runtime, pack);
    let calls_before = provider.generate_calls.load(Ordering::SeqCst);

    let step = runtime
        .step(&session_id, None, Some("i want to gather intel first"), None)
        .unwrap();
    assert!(!step.fallback_used);
    assert_eq!(step.executed_choice_id, "c1");
    assert_eq!(step.selection_source, "rule");

    // only the narrator was called; the selector was rule-mapped away
    assert_eq!(
        provider.generate_calls.load(Ordering::SeqCst),
        calls_before + 1
    );
}

#[test]
fn test_free_input_noise_falls_back_with_200() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_noise"));

    let step = runtime
        .step(&session_id, None, Some("nonsense ???"), None)
        .unwrap();
    assert!(step.fallback_used);
    assert_eq!(step.selection_source, "fallback");
    assert_no_internal_story_tokens(&step.narrative_text);
}

#[test]
fn test_quest_progress_applies_rewards_once() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_quest_progress");
    pack["quests"] = json!([{
        "quest_id": "q",
        "title": "First Study",
        "auto_activate": true,
        "stages": [{
            "stage_id": "s1",
            "title": "Opening",
            "milestones": [{
                "milestone_id": "m_c1",
                "title": "Choose Study",
                "when": {"executed_choice_id_is": "c1"},
                "rewards": {"money": 4}
            }],
            "stage_rewards": {"knowledge": 2}
        }],
        "completion_rewards": {"money": 2}
    }]);
    let session_id = start_session(&runtime, pack);

    let before = runtime.get_session(&session_id).unwrap();
    assert_eq!(before.state_json["money"], 50);
    assert_eq!(before.state_json["knowledge"], 0);

    let step = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    assert!(!step.fallback_used);

    let after = runtime.get_session(&session_id).unwrap();
    assert_eq!(after.state_json["money"], 56);
    assert_eq!(after.state_json["knowledge"], 2);
    let quest_state = &after.state_json["quest_state"];
    assert_eq!(quest_state["completed_quests"], json!(["q"]));
    assert_eq!(quest_state["active_quests"], json!([]));

    runtime
        .store()
        .read(|data| {
            let logs = data.session_action_logs(&session_id);
            let has_quest_witness = logs[0]
                .matched_rules
                .iter()
                .any(|rule| rule["type"] == "quest_progress");
            assert!(has_quest_witness);
            Ok(())
        })
        .unwrap();

    // Matching again must not re-apply anything.
    runtime.step(&session_id, Some("c3"), None, None).unwrap();
    let settled = runtime.get_session(&session_id).unwrap();
    assert_eq!(settled.state_json["money"], 56);
    assert_eq!(settled.state_json["knowledge"], 2);
}

#[test]
fn test_fallback_step_advances_fallback_gated_quest() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_quest_fallback");
    pack["quests"] = json!([{
        "quest_id": "q_fallback",
        "title": "Recover Composure",
        "auto_activate": true,
        "stages": [{
            "stage_id": "s1",
            "title": "Fallback Stage",
            "milestones": [{
                "milestone_id": "m_fallback_once",
                "title": "Trigger one fallback",
                "when": {"fallback_used_is": true},
                "rewards": {"affection": 2}
            }]
        }]
    }]);
    let session_id = start_session(&runtime, pack);

    let step = runtime.step(&session_id, None, None, None).unwrap();
    assert!(step.fallback_used);
    assert_eq!(step.fallback_reason.as_deref(), Some("NO_INPUT"));

    let after = runtime.get_session(&session_id).unwrap();
    assert_eq!(after.state_json["affection"], 2);
    assert_eq!(
        after.state_json["quest_state"]["completed_quests"],
        json!(["q_fallback"])
    );
}

#[test]
fn test_event_once_per_run_applies_exactly_once() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_event_once");
    pack["events"] = json!([{
        "event_id": "ev_once",
        "title": "One-time encounter",
        "weight": 1,
        "once_per_run": true,
        "cooldown_steps": 0,
        "trigger": {"node_id_is": "n3"},
        "effects": {"affection": 2}
    }]);
    pack["run_config"] = json!({"max_days": 30, "max_steps": 40, "default_timeout_outcome": "neutral"});
    let session_id = start_session(&runtime, pack);

    runtime.step(&session_id, Some("c1"), None, None).unwrap();
    runtime.step(&session_id, Some("c3"), None, None).unwrap();
    runtime.step(&session_id, Some("c5"), None, None).unwrap();
    runtime.step(&session_id, Some("c5"), None, None).unwrap();

    let state = runtime.get_session(&session_id).unwrap().state_json;
    assert_eq!(state["affection"], 2);
    let triggered = state["run_state"]["triggered_event_ids"].as_array().unwrap();
    assert_eq!(
        triggered.iter().filter(|id| *id == "ev_once").count(),
        1
    );
}

#[test]
fn test_event_cooldown_blocks_within_window() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_event_cooldown");
    pack["events"] = json!([{
        "event_id": "ev_cd",
        "title": "Repeatable encounter",
        "weight": 1,
        "once_per_run": false,
        "cooldown_steps": 2,
        "trigger": {"node_id_is": "n3"},
        "effects": {"money": 3}
    }]);
    pack["run_config"] = json!({"max_days": 30, "max_steps": 40, "default_timeout_outcome": "neutral"});
    let session_id = start_session(&runtime, pack);

    runtime.step(&session_id, Some("c1"), None, None).unwrap(); // step 1, at n1
    runtime.step(&session_id, Some("c3"), None, None).unwrap(); // step 2, at n2
    runtime.step(&session_id, Some("c5"), None, None).unwrap(); // step 3, fires at n3
    let after_first = runtime.get_session(&session_id).unwrap().state_json;
    assert_eq!(after_first["money"], 53);

    runtime.step(&session_id, Some("c5"), None, None).unwrap(); // step 4, 4-3 < 2
    let blocked = runtime.get_session(&session_id).unwrap().state_json;
    assert_eq!(blocked["money"], 53);

    runtime.step(&session_id, Some("c5"), None, None).unwrap(); // step 5, 5-3 >= 2
    let refired = runtime.get_session(&session_id).unwrap().state_json;
    assert_eq!(refired["money"], 56);
}

#[test]
fn test_ending_priority_prefers_lowest_value() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_ending_priority");
    pack["endings"] = json!([
        {
            "ending_id": "ending_neutral",
            "title": "Neutral Close",
            "priority": 20,
            "outcome": "neutral",
            "trigger": {"node_id_is": "n2"},
            "epilogue": "A calm close."
        },
        {
            "ending_id": "ending_success",
            "title": "Success Close",
            "priority": 10,
            "outcome": "success",
            "trigger": {"node_id_is": "n2"},
            "epilogue": "A bright finish."
        }
    ]);
    pack["run_config"] = json!({"max_days": 30, "max_steps": 40, "default_timeout_outcome": "neutral"});
    let session_id = start_session(&runtime, pack);

    let step = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    assert!(step.run_ended);
    assert_eq!(step.ending_id.as_deref(), Some("ending_success"));
    assert_eq!(step.ending_outcome.as_deref(), Some("success"));
    assert_eq!(step.ending_epilogue.as_deref(), Some("A bright finish."));

    let blocked = runtime.step(&session_id, Some("c3"), None, None).unwrap_err();
    assert_eq!(blocked.code(), "SESSION_NOT_ACTIVE");
}

#[test]
fn test_timeout_ending_uses_run_config_outcome() {
    let runtime = test_runtime();
    let mut pack = make_pack("s_timeout_ending");
    pack["run_config"] = json!({"max_days": 30, "max_steps": 1, "default_timeout_outcome": "fail"});
    let session_id = start_session(&runtime, pack);

    let step = runtime.step(&session_id, Some("c1"), None, None).unwrap();
    assert!(step.run_ended);
    assert_eq!(step.ending_id.as_deref(), Some("__timeout__"));
    assert_eq!(step.ending_outcome.as_deref(), Some("fail"));
}

#[test]
fn test_llm_unavailable_leaves_no_progress_and_retries_with_same_key() {
    let (runtime, provider) = toggled_runtime();
    let session_id = start_session(&runtime, make_pack("s_llm_down"));

    let before = runtime.get_session(&session_id).unwrap();
    provider.fail_generate.store(true, Ordering::SeqCst);

    let error = runtime
        .step(&session_id, Some("c1"), None, Some("story-idem-1"))
        .unwrap_err();
    assert_eq!(error.code(), "LLM_UNAVAILABLE");
    assert_eq!(error.http_status(), 503);

    // No state change, no ActionLog row.
    let after = runtime.get_session(&session_id).unwrap();
    assert_eq!(after.state_json, before.state_json);
    assert_eq!(after.current_node_id, before.current_node_id);
    runtime
        .store()
        .read(|data| {
            assert!(data.session_action_logs(&session_id).is_empty());
            Ok(())
        })
        .unwrap();

    // Provider recovers; the same idempotency key succeeds with one log row.
    provider.fail_generate.store(false, Ordering::SeqCst);
    let step = runtime
        .step(&session_id, Some("c1"), None, Some("story-idem-1"))
        .unwrap();
    assert_eq!(step.executed_choice_id, "c1");
    runtime
        .store()
        .read(|data| {
            assert_eq!(data.session_action_logs(&session_id).len(), 1);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_fallback_narration_uses_static_variants_when_llm_disabled() {
    let mut config = fabula_core::types::Config::for_tests();
    config.prompt.fallback_llm_enabled = false;
    let runtime = fabula_core::session::StoryRuntime::init(config).unwrap();
    let session_id = start_session(&runtime, make_pack("s_static_fallback"));

    let step = runtime.step(&session_id, None, None, None).unwrap();
    assert!(step.fallback_used);
    assert_eq!(step.narrative_text, "You hesitate and lose your timing.");
}

#[test]
fn test_narrative_never_leaks_internal_tokens_across_paths() {
    let runtime = test_runtime();
    let session_id = start_session(&runtime, make_pack("s_leak_guard"));

    let paths = [
        runtime.step(&session_id, Some("bad"), None, None).unwrap(),
        runtime.step(&session_id, None, Some("nonsense ???"), None).unwrap(),
        runtime.step(&session_id, Some("c5"), None, None).unwrap(),
    ];
    for step in paths {
        assert_no_internal_story_tokens(&step.narrative_text);
    }
}
