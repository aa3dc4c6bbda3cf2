//! Ending engine — declared ending rules plus the run-config timeout policy.
//!
//! Endings are evaluated after quest and event application against the node
//! the step landed on. The rule with the numerically smallest `priority`
//! wins; ties resolve by declaration order. When no rule matches, exhausted
//! run bounds produce the synthetic `__timeout__` ending.

use crate::engine::{trigger_matches, MatchedRule, StepFacts};
use crate::pack::{StoryPack, TIMEOUT_ENDING_ID};
use crate::state::SessionState;

/// The ending a step resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct EndingResolution {
    pub ending_id: String,
    pub title: String,
    pub outcome: String,
    pub epilogue: String,
    pub priority: i64,
    /// True for the run-config timeout ending.
    pub synthetic: bool,
}

impl EndingResolution {
    pub fn matched_rule(&self) -> MatchedRule {
        MatchedRule::Ending {
            ending_id: self.ending_id.clone(),
            outcome: self.outcome.clone(),
            priority: self.priority,
        }
    }
}

/// Evaluate ending rules for the step; `to_node_id` is the post-transition node.
pub fn evaluate_ending(
    pack: &StoryPack,
    state: &SessionState,
    facts: &StepFacts<'_>,
    step_index: u64,
) -> Option<EndingResolution> {
    // Ending node_id_is means the node the player is on now, so the facts
    // view presents the post-step node in that position.
    let ending_facts = StepFacts {
        from_node_id: facts.to_node_id,
        ..facts.clone()
    };

    let declared = pack
        .endings
        .iter()
        .enumerate()
        .filter(|(_, ending)| trigger_matches(&ending.trigger, &ending_facts, state))
        .min_by_key(|(idx, ending)| (ending.priority, *idx))
        .map(|(_, ending)| EndingResolution {
            ending_id: ending.ending_id.clone(),
            title: ending.title.clone(),
            outcome: if ending.outcome.is_empty() {
                "neutral".to_string()
            } else {
                ending.outcome.clone()
            },
            epilogue: ending.epilogue.clone(),
            priority: ending.priority,
            synthetic: false,
        });
    if declared.is_some() {
        return declared;
    }

    let run_config = &pack.run_config;
    let steps_exhausted = step_index >= run_config.max_steps;
    let days_exhausted = state.day > run_config.max_days as i64;
    if steps_exhausted || days_exhausted {
        return Some(EndingResolution {
            ending_id: TIMEOUT_ENDING_ID.to_string(),
            title: String::new(),
            outcome: run_config.default_timeout_outcome.as_str().to_string(),
            epilogue: String::new(),
            priority: i64::MAX,
            synthetic: true,
        });
    }
    None
}

/// Freeze the ending onto the run state.
pub fn freeze_ending(state: &mut SessionState, ending: &EndingResolution, step_index: u64) {
    let run = &mut state.run_state;
    run.ending_id = Some(ending.ending_id.clone());
    run.ending_outcome = Some(ending.outcome.clone());
    run.ended_at_step = Some(step_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{ActionId, Effects};
    use crate::state::default_initial_state;
    use serde_json::json;

    fn ending_pack(endings: serde_json::Value, run_config: serde_json::Value) -> StoryPack {
        serde_json::from_value(json!({
            "story_id": "s1",
            "version": 1,
            "start_node_id": "n1",
            "nodes": [
                {
                    "node_id": "n1",
                    "is_end": false,
                    "choices": [
                        {"choice_id": "c1", "display_text": "Study",
                         "action": {"action_id": "study", "params": {}}, "next_node_id": "n2"},
                        {"choice_id": "c2", "display_text": "Rest",
                         "action": {"action_id": "rest", "params": {}}, "next_node_id": "n2"}
                    ]
                },
                {"node_id": "n2", "is_end": true, "choices": []}
            ],
            "endings": endings,
            "run_config": run_config,
        }))
        .unwrap()
    }

    fn facts() -> StepFacts<'static> {
        StepFacts {
            from_node_id: "n1",
            to_node_id: "n2",
            executed_choice_id: "c1",
            action_id: Some(ActionId::Study),
            fallback_used: false,
            delta: Effects::default(),
        }
    }

    #[test]
    fn test_lowest_priority_wins_over_declaration_order() {
        let pack = ending_pack(
            json!([
                {"ending_id": "ending_neutral", "title": "Neutral Close", "priority": 20,
                 "outcome": "neutral", "trigger": {"node_id_is": "n2"}, "epilogue": "A calm close."},
                {"ending_id": "ending_success", "title": "Success Close", "priority": 10,
                 "outcome": "success", "trigger": {"node_id_is": "n2"}, "epilogue": "A bright finish."}
            ]),
            json!({"max_days": 30, "max_steps": 40, "default_timeout_outcome": "neutral"}),
        );
        let state = default_initial_state();
        let ending = evaluate_ending(&pack, &state, &facts(), 1).unwrap();
        assert_eq!(ending.ending_id, "ending_success");
        assert_eq!(ending.outcome, "success");
        assert!(!ending.synthetic);
    }

    #[test]
    fn test_priority_tie_resolves_by_declaration_order() {
        let pack = ending_pack(
            json!([
                {"ending_id": "first", "priority": 10, "outcome": "neutral",
                 "trigger": {"node_id_is": "n2"}},
                {"ending_id": "second", "priority": 10, "outcome": "neutral",
                 "trigger": {"node_id_is": "n2"}}
            ]),
            json!({}),
        );
        let state = default_initial_state();
        let ending = evaluate_ending(&pack, &state, &facts(), 1).unwrap();
        assert_eq!(ending.ending_id, "first");
    }

    #[test]
    fn test_ending_node_matches_post_step_node() {
        let pack = ending_pack(
            json!([{"ending_id": "e", "priority": 1, "outcome": "neutral",
                    "trigger": {"node_id_is": "n1"}}]),
            json!({"max_days": 30, "max_steps": 40}),
        );
        // The step lands on n2; an n1-gated ending must not fire.
        let state = default_initial_state();
        assert!(evaluate_ending(&pack, &state, &facts(), 1).is_none());
    }

    #[test]
    fn test_timeout_ending_uses_run_config_outcome() {
        let pack = ending_pack(
            json!([]),
            json!({"max_days": 30, "max_steps": 1, "default_timeout_outcome": "fail"}),
        );
        let state = default_initial_state();
        let ending = evaluate_ending(&pack, &state, &facts(), 1).unwrap();
        assert_eq!(ending.ending_id, TIMEOUT_ENDING_ID);
        assert_eq!(ending.outcome, "fail");
        assert!(ending.synthetic);
        assert!(ending.epilogue.is_empty());
    }

    #[test]
    fn test_no_ending_below_bounds() {
        let pack = ending_pack(json!([]), json!({"max_days": 30, "max_steps": 40}));
        let state = default_initial_state();
        assert!(evaluate_ending(&pack, &state, &facts(), 1).is_none());
    }

    #[test]
    fn test_freeze_ending_records_run_state() {
        let mut state = default_initial_state();
        let ending = EndingResolution {
            ending_id: "e1".to_string(),
            title: "T".to_string(),
            outcome: "success".to_string(),
            epilogue: String::new(),
            priority: 1,
            synthetic: false,
        };
        freeze_ending(&mut state, &ending, 7);
        assert_eq!(state.run_state.ending_id.as_deref(), Some("e1"));
        assert_eq!(state.run_state.ending_outcome.as_deref(), Some("success"));
        assert_eq!(state.run_state.ended_at_step, Some(7));
    }
}
