//! Session state — the semantic state blob owned by one session.
//!
//! State is a tagged record, not a free-form dict: the numeric axes, the NPC
//! map, quest progress and run bookkeeping all have fixed shapes. The only
//! deliberately loose spots are NPC mood/beliefs, which remain raw JSON.
//!
//! State enters the system through [`normalize_state`], which overlays raw
//! JSON onto canonical defaults so missing sub-objects are always filled and
//! stale sessions keep loading after shape additions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::pack::Slot;

pub mod gate;

pub use gate::{
    apply_effects, compact_delta, requires_met, story_choices_for_response, ChoiceView,
    LockedReason,
};

/// Per-NPC runtime state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NpcState {
    #[serde(default)]
    pub relation: BTreeMap<String, i64>,

    #[serde(default)]
    pub mood: Value,

    #[serde(default)]
    pub beliefs: Value,

    #[serde(default)]
    pub active_goals: Vec<Value>,

    #[serde(default)]
    pub status_effects: Vec<String>,

    #[serde(default)]
    pub short_memory: Vec<String>,

    #[serde(default)]
    pub long_memory_refs: Vec<String>,

    #[serde(default)]
    pub last_seen_step: u64,
}

/// Progress of one milestone; one-shot per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MilestoneProgress {
    #[serde(default)]
    pub done: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_step: Option<u64>,
}

/// Progress of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageProgress {
    #[serde(default)]
    pub done: bool,

    #[serde(default)]
    pub milestones: BTreeMap<String, MilestoneProgress>,
}

/// Progress of one quest: a single current stage plus per-stage maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuestProgress {
    #[serde(default)]
    pub current_stage_id: String,

    #[serde(default)]
    pub stages: BTreeMap<String, StageProgress>,
}

/// Kind of quest progression event recorded in `recent_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestEventType {
    StageActivated,
    MilestoneCompleted,
    StageCompleted,
    QuestCompleted,
}

/// One quest progression event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestEvent {
    #[serde(rename = "type")]
    pub event_type: QuestEventType,
    pub quest_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,

    pub at_step: u64,
}

/// Quest bookkeeping for the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuestState {
    #[serde(default)]
    pub active_quests: Vec<String>,

    #[serde(default)]
    pub completed_quests: Vec<String>,

    #[serde(default)]
    pub quests: BTreeMap<String, QuestProgress>,

    #[serde(default)]
    pub recent_events: Vec<QuestEvent>,
}

/// Run-level bookkeeping: step counter, fallback counter, event history and
/// the frozen ending fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunState {
    #[serde(default)]
    pub step_index: u64,

    #[serde(default)]
    pub fallback_count: u64,

    #[serde(default)]
    pub triggered_event_ids: Vec<String>,

    #[serde(default)]
    pub event_cooldowns: BTreeMap<String, u64>,

    #[serde(default)]
    pub ending_id: Option<String>,

    #[serde(default)]
    pub ending_outcome: Option<String>,

    #[serde(default)]
    pub ended_at_step: Option<u64>,
}

/// The full session state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub day: i64,
    pub slot: Slot,
    pub energy: i64,
    pub money: i64,
    pub knowledge: i64,
    pub affection: i64,

    #[serde(default)]
    pub npc_state: BTreeMap<String, NpcState>,

    #[serde(default)]
    pub quest_state: QuestState,

    #[serde(default)]
    pub run_state: RunState,
}

impl Default for SessionState {
    fn default() -> Self {
        default_initial_state()
    }
}

/// Canonical defaults for a fresh run.
pub fn default_initial_state() -> SessionState {
    SessionState {
        day: 1,
        slot: Slot::Morning,
        energy: 80,
        money: 50,
        knowledge: 0,
        affection: 0,
        npc_state: BTreeMap::new(),
        quest_state: QuestState::default(),
        run_state: RunState::default(),
    }
}

/// Recursively merge `overlay` into `base`. Map-valued keys merge per key;
/// everything else is replaced by the overlay.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let entry = match merged.get(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Overlay a raw state blob onto defaults and coerce into the typed form.
///
/// Missing sub-objects are filled, `day` is clamped to >= 1 and unparseable
/// fragments fall back to their defaults rather than failing the session.
pub fn normalize_state(raw: &Value) -> SessionState {
    let defaults = match serde_json::to_value(default_initial_state()) {
        Ok(v) => v,
        Err(_) => return default_initial_state(),
    };
    let merged = deep_merge(&defaults, raw);
    let mut state: SessionState =
        serde_json::from_value(merged).unwrap_or_else(|_| default_initial_state());
    if state.day < 1 {
        state.day = 1;
    }
    state
}

/// Diff two states into the step delta: non-zero numeric axis changes plus a
/// slot change when present. This is the persisted `state_delta` shape.
pub fn state_delta(before: &SessionState, after: &SessionState) -> Value {
    let mut delta = serde_json::Map::new();
    for (key, before_v, after_v) in [
        ("energy", before.energy, after.energy),
        ("money", before.money, after.money),
        ("knowledge", before.knowledge, after.knowledge),
        ("affection", before.affection, after.affection),
        ("day", before.day, after.day),
    ] {
        let diff = after_v - before_v;
        if diff != 0 {
            delta.insert(key.to_string(), Value::from(diff));
        }
    }
    if before.slot != after.slot {
        delta.insert("slot".to_string(), Value::from(after.slot.as_str()));
    }
    Value::Object(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_initial_state_values() {
        let state = default_initial_state();
        assert_eq!(state.day, 1);
        assert_eq!(state.slot, Slot::Morning);
        assert_eq!(state.energy, 80);
        assert_eq!(state.money, 50);
        assert_eq!(state.knowledge, 0);
        assert_eq!(state.affection, 0);
        assert!(state.quest_state.active_quests.is_empty());
    }

    #[test]
    fn test_deep_merge_merges_nested_maps() {
        let base = json!({"a": {"x": 1, "y": 2}, "b": 1});
        let overlay = json!({"a": {"y": 9, "z": 3}, "c": true});
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 9, "z": 3}, "b": 1, "c": true}));
    }

    #[test]
    fn test_deep_merge_replaces_non_maps() {
        let base = json!({"list": [1, 2, 3]});
        let overlay = json!({"list": [9]});
        assert_eq!(deep_merge(&base, &overlay), json!({"list": [9]}));
    }

    #[test]
    fn test_normalize_fills_missing_sections() {
        let state = normalize_state(&json!({"money": 120}));
        assert_eq!(state.money, 120);
        assert_eq!(state.energy, 80);
        assert_eq!(state.run_state.step_index, 0);
        assert!(state.quest_state.quests.is_empty());
    }

    #[test]
    fn test_normalize_clamps_day() {
        let state = normalize_state(&json!({"day": 0}));
        assert_eq!(state.day, 1);
    }

    #[test]
    fn test_state_delta_drops_zero_axes() {
        let before = default_initial_state();
        let mut after = before.clone();
        after.money += 4;
        after.knowledge += 2;
        let delta = state_delta(&before, &after);
        assert_eq!(delta, json!({"money": 4, "knowledge": 2}));
    }

    #[test]
    fn test_state_delta_records_slot_change() {
        let before = default_initial_state();
        let mut after = before.clone();
        after.slot = Slot::Night;
        assert_eq!(state_delta(&before, &after), json!({"slot": "night"}));
    }

    #[test]
    fn test_quest_event_type_snake_case() {
        let event = QuestEvent {
            event_type: QuestEventType::MilestoneCompleted,
            quest_id: "q".to_string(),
            stage_id: None,
            milestone_id: Some("m".to_string()),
            at_step: 3,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "milestone_completed");
    }
}
