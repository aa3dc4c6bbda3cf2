//! Play prompt builders.
//!
//! Both prompts end with `Context: <json>` where the JSON is compacted,
//! key-sorted and trimmed to the configured character budget. The selector
//! sees visible choices, intents and a small state snippet; the narrator gets
//! the full step resolution with strict-separation rules spelled out.

use serde::Serialize;
use serde_json::Value;

use crate::engine::resolver::SelectionContext;
use crate::hashing::to_canonical_json;
use crate::state::SessionState;
use crate::types::PromptConfig;

const SELECTION_MAX_VISIBLE_CHOICES: usize = 8;
const SELECTION_MAX_INTENTS: usize = 6;
const SELECTION_MAX_PATTERNS: usize = 6;
const NARRATION_MAX_IMPACT_ITEMS: usize = 4;

/// Clip to a character budget after collapsing whitespace.
pub fn clip_text(value: &str, limit: usize) -> String {
    let collapsed: String = value.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(limit).collect()
}

fn trim_prompt(text: String, max_chars: usize) -> String {
    let limit = max_chars.max(1500);
    let collapsed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= limit {
        collapsed
    } else {
        collapsed.chars().take(limit).collect()
    }
}

/// Small state snippet shared with the selector.
fn compact_selection_state(state: &SessionState, node_id: &str) -> Value {
    serde_json::json!({
        "story_node_id": clip_text(node_id, 64),
        "day": state.day,
        "slot": state.slot.as_str(),
        "energy": state.energy,
        "money": state.money,
        "knowledge": state.knowledge,
        "affection": state.affection,
        "run_step_index": state.run_state.step_index,
        "fallback_count": state.run_state.fallback_count,
    })
}

/// Build the selector prompt for `story_selection_v1`.
pub fn build_selection_prompt(context: &SelectionContext<'_>, config: &PromptConfig) -> String {
    let mut valid_ids: Vec<String> = context.valid_choice_ids.clone();
    valid_ids.sort();
    valid_ids.dedup();

    let visible: Vec<Value> = context
        .visible_choices
        .iter()
        .take(SELECTION_MAX_VISIBLE_CHOICES)
        .map(|choice| {
            serde_json::json!({
                "choice_id": clip_text(&choice.choice_id, 64),
                "display_text": clip_text(&choice.display_text, 56),
            })
        })
        .collect();

    let intents: Vec<Value> = context
        .intents
        .iter()
        .take(SELECTION_MAX_INTENTS)
        .map(|intent| {
            let patterns: Vec<String> = intent
                .patterns
                .iter()
                .filter(|p| !p.trim().is_empty())
                .take(SELECTION_MAX_PATTERNS)
                .map(|p| clip_text(p, 28))
                .collect();
            serde_json::json!({
                "intent_id": clip_text(&intent.intent_id, 64),
                "alias_choice_id": clip_text(&intent.alias_choice_id, 64),
                "description": clip_text(&intent.description, 56),
                "patterns": patterns,
            })
        })
        .collect();

    let payload = serde_json::json!({
        "player_input": context.player_input,
        "valid_choice_ids": valid_ids,
        "visible_choices": visible,
        "intents": intents,
        "state": compact_selection_state(context.state, context.node_id),
    });

    let prompt = format!(
        "Story selection task. Return JSON only with schema: \
         {{choice_id:string|null,use_fallback:boolean,confidence:number,intent_id:string|null,notes:string|null}}. \
         Map player_input to one visible choice_id from valid_choice_ids. \
         If uncertain, use_fallback=true and choice_id=null. Context: {}",
        to_canonical_json(&payload)
    );
    trim_prompt(prompt, config.play_max_chars)
}

/// How the player provided this step's input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    ChoiceClick,
    FreeInput,
}

/// Intent-vs-executed-action relationship hinted to the narrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentAlignment {
    Aligned,
    Mismatch,
    Unknown,
}

impl IntentAlignment {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentAlignment::Aligned => "aligned",
            IntentAlignment::Mismatch => "mismatch",
            IntentAlignment::Unknown => "unknown",
        }
    }
}

/// Node transition block of the narrator context.
#[derive(Debug, Clone, Serialize, Default)]
pub struct NodeTransitionCtx {
    pub from_node_id: String,
    pub to_node_id: String,
    pub from_scene: String,
    pub to_scene: String,
}

/// Selection resolution block of the narrator context.
#[derive(Debug, Clone, Serialize, Default)]
pub struct SelectionResolutionCtx {
    pub attempted_choice_id: Option<String>,
    pub executed_choice_id: String,
    pub resolved_choice_id: String,
    pub selected_choice_label: String,
    pub selected_action_id: String,
    pub mapping_confidence: Option<f64>,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
}

/// Compact numeric state snapshot.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StateSnapshotCtx {
    pub day: i64,
    pub slot: String,
    pub energy: i64,
    pub money: i64,
    pub knowledge: i64,
    pub affection: i64,
    pub run_step_index: u64,
    pub fallback_count: u64,
}

impl StateSnapshotCtx {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            day: state.day,
            slot: state.slot.as_str().to_string(),
            energy: state.energy,
            money: state.money,
            knowledge: state.knowledge,
            affection: state.affection,
            run_step_index: state.run_state.step_index,
            fallback_count: state.run_state.fallback_count,
        }
    }
}

/// Per-source effect attribution.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ImpactSourcesCtx {
    pub action_effects: Value,
    pub event_effects: Value,
    pub total_effects: Value,
}

/// One active quest in the narrator summary.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveQuestCtx {
    pub quest_id: String,
    pub title: String,
    pub current_stage_title: String,
    pub stage_progress: StageProgressCtx,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct StageProgressCtx {
    pub done: usize,
    pub total: usize,
}

/// One recent quest event in the narrator summary.
#[derive(Debug, Clone, Serialize)]
pub struct RecentQuestEventCtx {
    #[serde(rename = "type")]
    pub event_type: String,
    pub quest_id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct QuestSummaryCtx {
    pub active_quests: Vec<ActiveQuestCtx>,
    pub recent_events: Vec<RecentQuestEventCtx>,
}

/// Quest nudge directive.
#[derive(Debug, Clone, Serialize)]
pub struct QuestNudgeCtx {
    pub enabled: bool,
    pub mode: String,
    pub mainline_hint: Option<String>,
    pub sideline_hint: Option<String>,
}

impl Default for QuestNudgeCtx {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: "off".to_string(),
            mainline_hint: None,
            sideline_hint: None,
        }
    }
}

/// Runtime event block.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEventCtx {
    pub event_id: String,
    pub title: String,
    pub narration_hint: Option<String>,
    pub effects: Value,
}

/// Run ending block.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RunEndingCtx {
    pub run_ended: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_outcome: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_epilogue: Option<String>,
}

/// The full narrator context (spec'd shape, compacted before serialization).
#[derive(Debug, Clone, Serialize)]
pub struct NarrationContext {
    pub input_mode: InputMode,
    pub player_input_raw: String,
    pub node_transition: NodeTransitionCtx,
    pub selection_resolution: SelectionResolutionCtx,
    pub causal_policy: &'static str,
    pub intent_action_alignment: IntentAlignment,
    pub state_snapshot_before: StateSnapshotCtx,
    pub state_snapshot_after: StateSnapshotCtx,
    pub state_delta: Value,
    pub impact_brief: Vec<String>,
    pub impact_sources: ImpactSourcesCtx,
    pub event_present: bool,
    pub quest_summary: QuestSummaryCtx,
    pub quest_nudge: QuestNudgeCtx,
    pub quest_nudge_suppressed_by_event: bool,
    pub runtime_event: Option<RuntimeEventCtx>,
    pub run_ending: RunEndingCtx,
}

impl NarrationContext {
    /// Clip free-text fields to their per-field budgets.
    fn compacted(&self) -> NarrationContext {
        let mut ctx = self.clone();
        ctx.player_input_raw = clip_text(&ctx.player_input_raw, 180);
        ctx.node_transition.from_scene = clip_text(&ctx.node_transition.from_scene, 96);
        ctx.node_transition.to_scene = clip_text(&ctx.node_transition.to_scene, 96);
        ctx.selection_resolution.selected_choice_label =
            clip_text(&ctx.selection_resolution.selected_choice_label, 72);
        ctx.impact_brief = ctx
            .impact_brief
            .iter()
            .filter(|item| !item.trim().is_empty())
            .take(NARRATION_MAX_IMPACT_ITEMS)
            .map(|item| clip_text(item, 80))
            .collect();
        ctx.quest_summary.active_quests.truncate(2);
        for quest in &mut ctx.quest_summary.active_quests {
            quest.title = clip_text(&quest.title, 64);
            quest.current_stage_title = clip_text(&quest.current_stage_title, 64);
        }
        if ctx.quest_summary.recent_events.len() > 2 {
            let skip = ctx.quest_summary.recent_events.len() - 2;
            ctx.quest_summary.recent_events.drain(..skip);
        }
        ctx.quest_nudge.mainline_hint = ctx
            .quest_nudge
            .mainline_hint
            .as_deref()
            .map(|h| clip_text(h, 96))
            .filter(|h| !h.is_empty());
        ctx.quest_nudge.sideline_hint = ctx
            .quest_nudge
            .sideline_hint
            .as_deref()
            .map(|h| clip_text(h, 96))
            .filter(|h| !h.is_empty());
        if let Some(event) = &mut ctx.runtime_event {
            event.title = clip_text(&event.title, 80);
            event.narration_hint = event
                .narration_hint
                .as_deref()
                .map(|h| clip_text(h, 96))
                .filter(|h| !h.is_empty());
        }
        if let Some(epilogue) = &ctx.run_ending.ending_epilogue {
            ctx.run_ending.ending_epilogue = Some(clip_text(epilogue, 160));
        }
        ctx
    }
}

/// Build the narrator prompt for `story_narrative_v1`.
pub fn build_narration_prompt(context: &NarrationContext, config: &PromptConfig) -> String {
    let compact = context.compacted();
    let fallback_used = compact.selection_resolution.fallback_used;
    let free_input = compact.input_mode == InputMode::FreeInput;

    let alignment_rule = if free_input && !fallback_used {
        "Free-input alignment rule: sentence 1 should paraphrase player_input_raw in world language \
         (no quote echo); sentence 2 must describe the executed action and its direct consequence \
         using impact_sources.action_effects. If event_present is true, runtime_event may appear as \
         one additional beat only, never as direct causality from player_input."
    } else if free_input {
        "Free-input fallback rule: exactly two sentences, acknowledge the attempted intent first, \
         then narrate the fallback action and immediate in-world consequence without inventing \
         unsupported actions."
    } else if fallback_used {
        "Fallback rule: exactly two sentences, acknowledge the attempted move first, then redirect \
         into the fallback action and its immediate in-world consequence."
    } else {
        "Button-choice rule: narrate the selected action first, then the immediate in-world \
         consequence in the same grounded tone."
    };

    let mismatch_rule = if free_input && compact.intent_action_alignment == IntentAlignment::Mismatch
    {
        "Mismatch rule: do not frame intent as fully completed in sentence 1; use a bridge turn \
         before landing on the executed action. "
    } else {
        ""
    };

    let event_rule = if free_input && compact.event_present {
        "Event layering rule: keep runtime_event to one short added clause or sentence after the \
         executed action; do not merge the event payoff into the same direct cause as player intent. "
    } else {
        ""
    };

    let nudge_rule = if compact.quest_nudge.enabled {
        "Quest nudge rule: include at most one subtle in-world task-direction nudge using either \
         quest_nudge.mainline_hint or quest_nudge.sideline_hint. Do not narrate a quest log and do \
         not use labels like main quest, side quest, objective, stage, or milestone. "
    } else if compact.quest_nudge_suppressed_by_event {
        "Quest nudge suppression rule: skip quest-direction hints on event-present turns to avoid \
         overloaded narration. "
    } else {
        ""
    };

    let context_json = serde_json::to_value(&compact)
        .map(|v| to_canonical_json(&v))
        .unwrap_or_else(|_| "{}".to_string());

    let prompt = format!(
        "Story narration task. Return JSON only with exact schema {{\"narrative_text\":\"string\"}}. \
         No markdown code fences. No extra keys. Narration only, 2-4 concise sentences, written in {language}. \
         Use grounded cinematic second-person voice. \
         Causal policy is {policy}; keep intent acknowledgment and effect sources strictly separated. \
         Use cause -> consequence ordering: player action first, observable world response next. \
         Keep actions consistent with executed_choice_id and selected_action_id. \
         Do not quote player_input_raw verbatim. \
         Soft-avoid system jargon in narrative_text: map/mapped/mapping, intent, choice_id, \
         selected_action_id, fallback_reason, confidence, and avoid formulaic phrases like for this \
         turn, the scene, story keeps moving. \
         If impact_brief or impact_sources exists, explain one or two key impacts naturally with \
         in-world wording first; use at most one short numeric mention and avoid ledger-style lists. \
         {event_rule}{mismatch_rule}{nudge_rule}{alignment_rule} Context: {context_json}",
        language = config.narration_language,
        policy = compact.causal_policy,
    );
    trim_prompt(prompt, config.play_max_chars)
}
