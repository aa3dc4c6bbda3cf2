//! Event engine — at most one runtime event fires per step.
//!
//! Eligibility combines the trigger predicate with `once_per_run` history and
//! per-event cooldowns. Among eligible events the highest weight wins; ties
//! fall back to declaration order, so selection is fully deterministic.

use crate::engine::{trigger_matches, MatchedRule, StepFacts};
use crate::pack::{Effects, StoryPack};
use crate::state::{apply_effects, SessionState};

/// The event that fired this step, with its applied effects.
#[derive(Debug, Clone)]
pub struct FiredEvent {
    pub event_id: String,
    pub title: String,
    pub narration_hint: Option<String>,
    pub effects: Effects,
}

impl FiredEvent {
    pub fn matched_rule(&self) -> MatchedRule {
        MatchedRule::RuntimeEvent {
            event_id: self.event_id.clone(),
            title: self.title.clone(),
            narration_hint: self.narration_hint.clone(),
            effects: self.effects,
        }
    }
}

/// Select the step's event (if any), apply its effects and record history.
pub fn select_and_apply_event(
    pack: &StoryPack,
    state: &mut SessionState,
    facts: &StepFacts<'_>,
    step_index: u64,
) -> Option<FiredEvent> {
    let chosen = {
        let run = &state.run_state;
        pack.events
            .iter()
            .filter(|event| {
                if event.once_per_run
                    && run.triggered_event_ids.iter().any(|id| id == &event.event_id)
                {
                    return false;
                }
                if let Some(last_fired) = run.event_cooldowns.get(&event.event_id) {
                    if step_index.saturating_sub(*last_fired) < event.cooldown_steps {
                        return false;
                    }
                }
                trigger_matches(&event.trigger, facts, state)
            })
            // max_by_key keeps the *last* max; compare declaration index
            // inverted so earlier declarations win ties.
            .enumerate()
            .max_by_key(|(idx, event)| (event.weight, std::cmp::Reverse(*idx)))
            .map(|(_, event)| event.clone())
    };

    let event = chosen?;
    let effects = event.effects.unwrap_or_default();
    apply_effects(state, &effects);

    let run = &mut state.run_state;
    if !run.triggered_event_ids.iter().any(|id| id == &event.event_id) {
        run.triggered_event_ids.push(event.event_id.clone());
    }
    run.event_cooldowns.insert(event.event_id.clone(), step_index);

    Some(FiredEvent {
        event_id: event.event_id,
        title: event.title,
        narration_hint: event.narration_hint,
        effects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::ActionId;
    use crate::state::default_initial_state;
    use serde_json::json;

    fn event_pack(events: serde_json::Value) -> StoryPack {
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
            "events": events,
        }))
        .unwrap()
    }

    fn facts(from: &'static str) -> StepFacts<'static> {
        StepFacts {
            from_node_id: from,
            to_node_id: "n2",
            executed_choice_id: "c1",
            action_id: Some(ActionId::Study),
            fallback_used: false,
            delta: Effects::default(),
        }
    }

    #[test]
    fn test_once_per_run_fires_exactly_once() {
        let pack = event_pack(json!([{
            "event_id": "ev_once",
            "title": "One-time encounter",
            "weight": 1,
            "once_per_run": true,
            "cooldown_steps": 0,
            "trigger": {"node_id_is": "n1"},
            "effects": {"affection": 2}
        }]));
        let mut state = default_initial_state();

        let first = select_and_apply_event(&pack, &mut state, &facts("n1"), 1);
        assert!(first.is_some());
        assert_eq!(state.affection, 2);

        for step in 2..5 {
            let fired = select_and_apply_event(&pack, &mut state, &facts("n1"), step);
            assert!(fired.is_none());
        }
        assert_eq!(state.affection, 2);
        assert_eq!(
            state
                .run_state
                .triggered_event_ids
                .iter()
                .filter(|id| *id == "ev_once")
                .count(),
            1
        );
    }

    #[test]
    fn test_cooldown_blocks_refire_within_window() {
        let pack = event_pack(json!([{
            "event_id": "ev_cd",
            "title": "Repeatable encounter",
            "weight": 1,
            "once_per_run": false,
            "cooldown_steps": 2,
            "trigger": {"node_id_is": "n1"},
            "effects": {"money": 3}
        }]));
        let mut state = default_initial_state();

        assert!(select_and_apply_event(&pack, &mut state, &facts("n1"), 3).is_some());
        assert_eq!(state.money, 53);
        // step 4: 4 - 3 = 1 < 2 → blocked
        assert!(select_and_apply_event(&pack, &mut state, &facts("n1"), 4).is_none());
        // step 5: 5 - 3 = 2, cooldown satisfied
        assert!(select_and_apply_event(&pack, &mut state, &facts("n1"), 5).is_some());
        assert_eq!(state.money, 56);
    }

    #[test]
    fn test_highest_weight_wins_ties_by_declaration_order() {
        let pack = event_pack(json!([
            {"event_id": "ev_low", "title": "Low", "weight": 1,
             "trigger": {"node_id_is": "n1"}, "effects": {"money": 1}},
            {"event_id": "ev_high", "title": "High", "weight": 5,
             "trigger": {"node_id_is": "n1"}, "effects": {"money": 10}},
            {"event_id": "ev_high_later", "title": "High later", "weight": 5,
             "trigger": {"node_id_is": "n1"}, "effects": {"money": 100}}
        ]));
        let mut state = default_initial_state();
        let fired = select_and_apply_event(&pack, &mut state, &facts("n1"), 1).unwrap();
        assert_eq!(fired.event_id, "ev_high");
        assert_eq!(state.money, 60);
    }

    #[test]
    fn test_no_match_fires_nothing() {
        let pack = event_pack(json!([{
            "event_id": "ev",
            "title": "Elsewhere",
            "trigger": {"node_id_is": "n2"},
            "effects": {"money": 3}
        }]));
        let mut state = default_initial_state();
        assert!(select_and_apply_event(&pack, &mut state, &facts("n1"), 1).is_none());
        assert_eq!(state.money, 50);
        assert!(state.run_state.event_cooldowns.is_empty());
    }
}
