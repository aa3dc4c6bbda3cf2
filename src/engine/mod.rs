//! Deterministic step engines: quest progression, runtime events, endings and
//! the selection resolver.
//!
//! All engines consume a shared [`StepFacts`] view of the executing step and
//! the shared [`Trigger`] predicate vocabulary. They mutate only the session
//! state handed to them; persistence stays with the step orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pack::{ActionId, Effects, Trigger};
use crate::state::SessionState;

pub mod ending;
pub mod event;
pub mod quest;
pub mod resolver;

pub use ending::{evaluate_ending, EndingResolution};
pub use event::{select_and_apply_event, FiredEvent};
pub use quest::{advance_quests, init_quest_state, QuestAdvance};
pub use resolver::{
    ExecutedAction, FallbackReason, Resolution, SelectionContext, SelectionSource, StepRequest,
};

/// Facts about the executing step, fixed after resolution and node transition.
#[derive(Debug, Clone)]
pub struct StepFacts<'a> {
    /// Node before the step.
    pub from_node_id: &'a str,
    /// Node after the step.
    pub to_node_id: &'a str,
    pub executed_choice_id: &'a str,
    pub action_id: Option<ActionId>,
    pub fallback_used: bool,
    /// Numeric delta accumulated so far this step.
    pub delta: Effects,
}

fn axis_value(state: &SessionState, key: &str) -> Option<i64> {
    match key {
        "energy" => Some(state.energy),
        "money" => Some(state.money),
        "knowledge" => Some(state.knowledge),
        "affection" => Some(state.affection),
        "day" => Some(state.day),
        _ => None,
    }
}

fn delta_value(delta: &Effects, key: &str) -> Option<i64> {
    match key {
        "energy" => Some(delta.energy),
        "money" => Some(delta.money),
        "knowledge" => Some(delta.knowledge),
        "affection" => Some(delta.affection),
        _ => None,
    }
}

/// Evaluate the shared trigger vocabulary. An omitted key is a wildcard; all
/// provided keys must match. Unknown state keys in threshold maps fail the
/// trigger rather than silently passing.
pub fn trigger_matches(trigger: &Trigger, facts: &StepFacts<'_>, state: &SessionState) -> bool {
    if let Some(node_id) = &trigger.node_id_is {
        if node_id != facts.from_node_id {
            return false;
        }
    }
    if let Some(node_id) = &trigger.next_node_id_is {
        if node_id != facts.to_node_id {
            return false;
        }
    }
    if let Some(choice_id) = &trigger.executed_choice_id_is {
        if choice_id != facts.executed_choice_id {
            return false;
        }
    }
    if let Some(action_id) = trigger.action_id_is {
        if facts.action_id != Some(action_id) {
            return false;
        }
    }
    if let Some(fallback_used) = trigger.fallback_used_is {
        if facts.fallback_used != fallback_used {
            return false;
        }
    }
    if let Some(thresholds) = &trigger.state_at_least {
        for (key, min) in thresholds {
            match axis_value(state, key) {
                Some(value) if value >= *min => {}
                _ => return false,
            }
        }
    }
    if let Some(thresholds) = &trigger.state_delta_at_least {
        for (key, min) in thresholds {
            match delta_value(&facts.delta, key) {
                Some(value) if value >= *min => {}
                _ => return false,
            }
        }
    }
    if let Some(days) = &trigger.day_in {
        if !days.contains(&state.day) {
            return false;
        }
    }
    if let Some(slots) = &trigger.slot_in {
        if !slots.contains(&state.slot) {
            return false;
        }
    }
    if let Some(required) = &trigger.completed_quests_include {
        for quest_id in required {
            if !state
                .quest_state
                .completed_quests
                .iter()
                .any(|q| q == quest_id)
            {
                return false;
            }
        }
    }
    true
}

/// Kind of quest progression recorded in a matched-rule witness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestRuleKind {
    MilestoneCompleted,
    StageCompleted,
    QuestCompleted,
}

/// Audit witness for rules that matched during a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchedRule {
    QuestProgress {
        quest_id: String,
        kind: QuestRuleKind,

        #[serde(skip_serializing_if = "Option::is_none")]
        stage_id: Option<String>,

        #[serde(skip_serializing_if = "Option::is_none")]
        milestone_id: Option<String>,

        #[serde(skip_serializing_if = "Option::is_none")]
        rewards: Option<Effects>,
    },
    RuntimeEvent {
        event_id: String,
        title: String,

        #[serde(skip_serializing_if = "Option::is_none")]
        narration_hint: Option<String>,

        effects: Effects,
    },
    Ending {
        ending_id: String,
        outcome: String,
        priority: i64,
    },
}

impl MatchedRule {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
