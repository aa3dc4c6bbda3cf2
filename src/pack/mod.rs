//! Story pack — the declarative, versioned definition of a story.
//!
//! A pack declares, statically, all runtime behaviour: nodes and their
//! choices, free-text intents, fallback routing, quests, runtime events,
//! endings and the run bounds. Nodes reference each other by id only; the
//! runtime resolves edges through `StoryPack::node`, never back-references.
//!
//! Packs arrive as raw JSON (`pack_json` on the Story row) and are brought
//! into this typed form by [`normalize_pack_for_runtime`]; any shape that does
//! not fit the v1.0 runtime form is rejected with `RUNTIME_PACK_V10_REQUIRED`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod validate;

pub use validate::normalize_pack_for_runtime;

/// Reserved id prefix; author-authored ids must not use it.
pub const RESERVED_ID_PREFIX: &str = "__";

/// Synthetic choice id recorded when a degraded fallback executes without an
/// author-provided id.
pub const FALLBACK_CHOICE_ID: &str = "__fallback__";

/// Synthetic ending id for run-config timeouts.
pub const TIMEOUT_ENDING_ID: &str = "__timeout__";

/// Time-of-day slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    #[default]
    Morning,
    Afternoon,
    Night,
}

impl Slot {
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Morning => "morning",
            Slot::Afternoon => "afternoon",
            Slot::Night => "night",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed action vocabulary of v1.0 packs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionId {
    Study,
    Work,
    Rest,
    Date,
    Gift,
}

impl ActionId {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionId::Study => "study",
            ActionId::Work => "work",
            ActionId::Rest => "rest",
            ActionId::Date => "date",
            ActionId::Gift => "gift",
        }
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric effects on the enumerated state axes. Additive integers; any other
/// key or a non-integer value is a load-time error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Effects {
    #[serde(default)]
    pub energy: i64,
    #[serde(default)]
    pub money: i64,
    #[serde(default)]
    pub knowledge: i64,
    #[serde(default)]
    pub affection: i64,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        *self == Effects::default()
    }
}

/// Prerequisite constraints gating a choice or executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Requires {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_money: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_energy: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_affection: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_at_least: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_in: Option<Vec<Slot>>,
}

/// A choice's declared action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceAction {
    pub action_id: ActionId,

    #[serde(default)]
    pub params: serde_json::Value,
}

/// One visible player action on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub choice_id: String,
    pub display_text: String,
    pub action: ChoiceAction,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<Requires>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<Effects>,

    pub next_node_id: String,

    #[serde(default)]
    pub is_key_decision: bool,
}

/// Author-provided pattern set mapping free-form text to one visible choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub alias_choice_id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Narration text variant: either plain text or a per-locale map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextVariant {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl TextVariant {
    /// Resolve for a locale; localized variants fall back to `en`, then to
    /// any entry.
    pub fn resolve(&self, locale: &str) -> &str {
        match self {
            TextVariant::Plain(text) => text,
            TextVariant::Localized(map) => map
                .get(locale)
                .or_else(|| map.get("en"))
                .or_else(|| map.values().next())
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

/// Where a node-level fallback leaves the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NextNodePolicy {
    #[default]
    Stay,
    ExplicitNext,
}

/// Per-node fallback block: declared effects, node policy and static
/// narration variants keyed by fallback reason (or `DEFAULT`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFallback {
    pub id: String,
    pub action: ChoiceAction,

    #[serde(default)]
    pub next_node_id_policy: NextNodePolicy,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<Effects>,

    #[serde(default)]
    pub text_variants: BTreeMap<String, TextVariant>,
}

impl NodeFallback {
    /// Static narration for a fallback reason, falling back to `DEFAULT`.
    pub fn text_for_reason(&self, reason: &str, locale: &str) -> Option<&str> {
        self.text_variants
            .get(reason)
            .or_else(|| self.text_variants.get("DEFAULT"))
            .map(|v| v.resolve(locale))
    }
}

/// A scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub scene_brief: String,

    #[serde(default)]
    pub is_end: bool,

    #[serde(default)]
    pub choices: Vec<Choice>,

    #[serde(default)]
    pub intents: Vec<Intent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_fallback_choice_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<NodeFallback>,
}

impl Node {
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.choice_id == choice_id)
    }
}

/// Pack-level fallback executor, addressed by `global_fallback_choice_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackExecutor {
    pub id: String,
    pub action_id: ActionId,

    #[serde(default)]
    pub action_params: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<Effects>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prereq: Option<Requires>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration: Option<ExecutorNarration>,
}

/// Skeleton narration carried by a fallback executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorNarration {
    #[serde(default)]
    pub skeleton: String,
}

/// Shared trigger predicate vocabulary for milestones, events and endings.
///
/// An omitted key is a wildcard; all provided keys must match.
/// `node_id_is` matches the node before the step for milestones/events and
/// the node after the step for endings (endings run post-transition).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Trigger {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id_is: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_node_id_is: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_choice_id_is: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_id_is: Option<ActionId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used_is: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_at_least: Option<BTreeMap<String, i64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_delta_at_least: Option<BTreeMap<String, i64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_in: Option<Vec<i64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_in: Option<Vec<Slot>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_quests_include: Option<Vec<String>>,
}

/// One quest milestone; one-shot within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneDef {
    pub milestone_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub when: Trigger,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewards: Option<Effects>,
}

/// An ordered quest stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub stage_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub milestones: Vec<MilestoneDef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_rewards: Option<Effects>,
}

/// A quest: ordered stages, each a set of milestones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestDef {
    pub quest_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub auto_activate: bool,

    #[serde(default)]
    pub stages: Vec<StageDef>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_rewards: Option<Effects>,
}

impl QuestDef {
    pub fn stage(&self, stage_id: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// Stage following `stage_id` in declaration order.
    pub fn next_stage(&self, stage_id: &str) -> Option<&StageDef> {
        let idx = self.stages.iter().position(|s| s.stage_id == stage_id)?;
        self.stages.get(idx + 1)
    }
}

/// A runtime event; at most one fires per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDef {
    pub event_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default = "default_event_weight")]
    pub weight: i64,

    #[serde(default)]
    pub once_per_run: bool,

    #[serde(default)]
    pub cooldown_steps: u64,

    #[serde(default)]
    pub trigger: Trigger,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<Effects>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub narration_hint: Option<String>,
}

fn default_event_weight() -> i64 {
    1
}

/// Run outcome used when the run ends by exhausting `run_config` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutOutcome {
    #[default]
    Neutral,
    Fail,
}

impl TimeoutOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeoutOutcome::Neutral => "neutral",
            TimeoutOutcome::Fail => "fail",
        }
    }
}

/// A declared ending rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndingDef {
    pub ending_id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default = "default_ending_priority")]
    pub priority: i64,

    #[serde(default)]
    pub outcome: String,

    #[serde(default)]
    pub trigger: Trigger,

    #[serde(default)]
    pub epilogue: String,
}

fn default_ending_priority() -> i64 {
    100
}

/// Run bounds and timeout policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_max_days")]
    pub max_days: u64,

    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    #[serde(default)]
    pub default_timeout_outcome: TimeoutOutcome,
}

fn default_max_days() -> u64 {
    30
}

fn default_max_steps() -> u64 {
    60
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_days: default_max_days(),
            max_steps: default_max_steps(),
            default_timeout_outcome: TimeoutOutcome::default(),
        }
    }
}

/// The v1.0 runtime story pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryPack {
    pub story_id: String,
    pub version: u32,

    #[serde(default)]
    pub title: String,

    pub start_node_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<serde_json::Value>,

    pub nodes: Vec<Node>,

    #[serde(default)]
    pub fallback_executors: Vec<FallbackExecutor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_fallback_choice_id: Option<String>,

    #[serde(default)]
    pub quests: Vec<QuestDef>,

    #[serde(default)]
    pub events: Vec<EventDef>,

    #[serde(default)]
    pub endings: Vec<EndingDef>,

    #[serde(default)]
    pub run_config: RunConfig,
}

impl StoryPack {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Look up a choice anywhere in the pack (choice ids are pack-unique).
    pub fn choice(&self, choice_id: &str) -> Option<&Choice> {
        self.nodes.iter().find_map(|n| n.choice(choice_id))
    }

    pub fn executor(&self, id: &str) -> Option<&FallbackExecutor> {
        self.fallback_executors.iter().find(|e| e.id == id)
    }

    pub fn quest(&self, quest_id: &str) -> Option<&QuestDef> {
        self.quests.iter().find(|q| q.quest_id == quest_id)
    }

    /// The pack-level fallback executor named by `global_fallback_choice_id`.
    pub fn global_fallback(&self) -> Option<&FallbackExecutor> {
        let id = self.global_fallback_choice_id.as_deref()?;
        self.executor(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effects_rejects_unknown_axes() {
        let result: std::result::Result<Effects, _> =
            serde_json::from_str(r#"{"energy": 1, "charisma": 2}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_effects_rejects_float_values() {
        let result: std::result::Result<Effects, _> = serde_json::from_str(r#"{"money": 1.5}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_text_variant_resolves_locale_with_fallback() {
        let variant: TextVariant =
            serde_json::from_str(r#"{"en": "Hold on.", "zh": "稍等。"}"#).unwrap();
        assert_eq!(variant.resolve("zh"), "稍等。");
        assert_eq!(variant.resolve("fr"), "Hold on.");

        let plain: TextVariant = serde_json::from_str(r#""You pause.""#).unwrap();
        assert_eq!(plain.resolve("zh"), "You pause.");
    }

    #[test]
    fn test_slot_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Slot::Night).unwrap(), r#""night""#);
    }

    #[test]
    fn test_next_stage_follows_declaration_order() {
        let quest: QuestDef = serde_json::from_value(serde_json::json!({
            "quest_id": "q",
            "stages": [
                {"stage_id": "s1", "milestones": []},
                {"stage_id": "s2", "milestones": []},
            ],
        }))
        .unwrap();
        assert_eq!(quest.next_stage("s1").unwrap().stage_id, "s2");
        assert!(quest.next_stage("s2").is_none());
    }
}
