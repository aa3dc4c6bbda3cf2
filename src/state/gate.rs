//! Requirement and effect evaluation.
//!
//! `requires` constraints gate choices and fallback executors; `effects`
//! mutate the numeric axes additively. Failure codes are stable strings that
//! surface both in client-visible `locked_reason` entries and in resolver
//! fallback classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pack::{Effects, Node, Requires};
use crate::state::SessionState;

/// Stable prerequisite failure code plus a human message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedReason {
    pub code: String,
    pub message: String,
}

/// Client-facing choice projection with precomputed gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceView {
    pub id: String,
    pub text: String,
    pub available: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_reason: Option<LockedReason>,
}

/// Evaluate `requires` against the current state. `Ok(())` when every
/// provided constraint holds; otherwise the first failing constraint.
pub fn requires_met(state: &SessionState, requires: &Requires) -> Result<(), LockedReason> {
    if let Some(min_money) = requires.min_money {
        if state.money < min_money {
            return Err(LockedReason {
                code: "MIN_MONEY_NOT_MET".to_string(),
                message: format!("requires money >= {min_money}"),
            });
        }
    }
    if let Some(min_energy) = requires.min_energy {
        if state.energy < min_energy {
            return Err(LockedReason {
                code: "MIN_ENERGY_NOT_MET".to_string(),
                message: format!("requires energy >= {min_energy}"),
            });
        }
    }
    if let Some(min_affection) = requires.min_affection {
        if state.affection < min_affection {
            return Err(LockedReason {
                code: "MIN_AFFECTION_NOT_MET".to_string(),
                message: format!("requires affection >= {min_affection}"),
            });
        }
    }
    if let Some(day_at_least) = requires.day_at_least {
        if state.day < day_at_least {
            return Err(LockedReason {
                code: "DAY_AT_LEAST_NOT_MET".to_string(),
                message: format!("requires day >= {day_at_least}"),
            });
        }
    }
    if let Some(slots) = &requires.slot_in {
        if !slots.contains(&state.slot) {
            return Err(LockedReason {
                code: "SLOT_NOT_ALLOWED".to_string(),
                message: format!("not available during {}", state.slot),
            });
        }
    }
    Ok(())
}

/// Apply additive numeric effects; returns the applied delta (same values).
pub fn apply_effects(state: &mut SessionState, effects: &Effects) -> Effects {
    state.energy += effects.energy;
    state.money += effects.money;
    state.knowledge += effects.knowledge;
    state.affection += effects.affection;
    *effects
}

/// Effects as a JSON object with zero axes dropped, for prompt compaction.
pub fn compact_delta(effects: &Effects) -> Value {
    let mut out = serde_json::Map::new();
    for (key, value) in [
        ("energy", effects.energy),
        ("money", effects.money),
        ("knowledge", effects.knowledge),
        ("affection", effects.affection),
    ] {
        if value != 0 {
            out.insert(key.to_string(), Value::from(value));
        }
    }
    Value::Object(out)
}

/// Visible choices of a node with prerequisite gating precomputed for the
/// client. Gating never hides a choice, it only marks it locked.
pub fn story_choices_for_response(node: &Node, state: &SessionState) -> Vec<ChoiceView> {
    node.choices
        .iter()
        .map(|choice| {
            let gate = choice
                .requires
                .as_ref()
                .map(|requires| requires_met(state, requires))
                .unwrap_or(Ok(()));
            match gate {
                Ok(()) => ChoiceView {
                    id: choice.choice_id.clone(),
                    text: choice.display_text.clone(),
                    available: true,
                    locked_reason: None,
                },
                Err(reason) => ChoiceView {
                    id: choice.choice_id.clone(),
                    text: choice.display_text.clone(),
                    available: false,
                    locked_reason: Some(reason),
                },
            }
        })
        .collect()
}
