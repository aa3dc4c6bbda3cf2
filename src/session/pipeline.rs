//! The step pipeline orchestrator.
//!
//! One step = one store transaction wrapping selection, effect application,
//! quest/event/ending evaluation, the narrator call, the ActionLog insert and
//! the Session update. The orchestrator is the only writer of Session and
//! ActionLog rows. Any failure before commit (most importantly an exhausted
//! narrator chain) aborts the transaction and leaves no trace beyond the
//! idempotency row.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::resolver::{self, ExecutedAction, FallbackReason, Resolution, StepRequest};
use crate::engine::{advance_quests, evaluate_ending, select_and_apply_event, StepFacts};
use crate::engine::ending::freeze_ending;
use crate::llm::prompts::{
    self, ImpactSourcesCtx, InputMode, IntentAlignment, NarrationContext, NodeTransitionCtx,
    QuestNudgeCtx, QuestSummaryCtx, RecentQuestEventCtx, RunEndingCtx, RuntimeEventCtx,
    SelectionResolutionCtx, StateSnapshotCtx,
};
use crate::llm::{LlmTransport, StageEmitter};
use crate::pack::{normalize_pack_for_runtime, Effects, NextNodePolicy, Node, StoryPack};
use crate::state::{
    apply_effects, compact_delta, normalize_state, state_delta, story_choices_for_response,
    ChoiceView, SessionState,
};
use crate::store::{ActionLogRow, SessionStatus, StoreData};
use crate::types::{ActionLogId, Config, Error, Result, SessionId};

/// Client-facing view of the node the session sits on after the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentNodeView {
    pub id: String,
    pub title: String,
    pub scene_brief: String,
    pub choices: Vec<ChoiceView>,
}

/// The step response. Field set is fixed; nothing else is ever added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub narrative_text: String,
    pub story_node_id: String,
    pub session_status: SessionStatus,
    pub run_ended: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_outcome: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ending_epilogue: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_node: Option<CurrentNodeView>,

    pub state_excerpt: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_choice_id: Option<String>,

    pub executed_choice_id: String,
    pub resolved_choice_id: String,
    pub fallback_used: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,

    pub selection_source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_confidence: Option<f64>,

    pub step_index: u64,
}

/// Run one step inside the supplied transaction.
pub(crate) fn run_step(
    data: &mut StoreData,
    session_id: &SessionId,
    request: &StepRequest,
    raw_input: Option<&str>,
    transport: &LlmTransport,
    config: &Config,
    emitter: &dyn StageEmitter,
) -> Result<StepResponse> {
    let session = data.session(session_id)?.clone();
    if session.status != SessionStatus::Active {
        return Err(Error::SessionNotActive);
    }
    let Some(story_id) = session.story_id.clone() else {
        return Err(Error::StoryRequired);
    };

    let story = data.story(&story_id, session.story_version)?.clone();
    let pack = normalize_pack_for_runtime(&story.pack_json)?;

    let state_before = normalize_state(&session.state_json);
    let from_node_id = session
        .story_node_id
        .clone()
        .unwrap_or_else(|| pack.start_node_id.clone());
    let node = pack
        .node(&from_node_id)
        .ok_or_else(|| Error::internal(format!("session node '{from_node_id}' not in pack")))?
        .clone();

    // Resolution; the selector LLM call happens in here at most once.
    let locale = config.prompt.default_locale.clone();
    let resolution = resolver::resolve(&pack, &node, &state_before, request, |ctx| {
        let prompt = prompts::build_selection_prompt(ctx, &config.prompt);
        transport.select_story_choice(&prompt, emitter, Some(&locale))
    })?;

    // Mutation budget starts here.
    let mut state_after = state_before.clone();
    let (action_effects, to_node_id) =
        execute_action(&pack, &node, &resolution, &mut state_after)?;
    if resolution.fallback_used {
        state_after.run_state.fallback_count += 1;
    }

    state_after.run_state.step_index += 1;
    let step_index = state_after.run_state.step_index;

    let mut facts = StepFacts {
        from_node_id: &from_node_id,
        to_node_id: &to_node_id,
        executed_choice_id: resolution.executed_choice_id(),
        action_id: resolution.action.action_id(),
        fallback_used: resolution.fallback_used,
        delta: action_effects,
    };

    let quest_advance = advance_quests(&pack, &mut state_after, &facts, step_index);
    facts.delta = sum_effects(&facts.delta, &quest_advance.rewards_delta);

    let fired_event = select_and_apply_event(&pack, &mut state_after, &facts, step_index);
    if let Some(event) = &fired_event {
        facts.delta = sum_effects(&facts.delta, &event.effects);
    }

    let ending = evaluate_ending(&pack, &state_after, &facts, step_index);
    if let Some(ending) = &ending {
        freeze_ending(&mut state_after, ending, step_index);
    }

    let mut matched_rules: Vec<Value> = quest_advance
        .matched_rules
        .iter()
        .map(|rule| rule.to_value())
        .collect();
    if let Some(event) = &fired_event {
        matched_rules.push(event.matched_rule().to_value());
    }
    if let Some(ending) = &ending {
        matched_rules.push(ending.matched_rule().to_value());
    }

    // Narration: static text for fallbacks when the LLM channel is disabled,
    // the narrator otherwise. A narrator failure aborts the whole step.
    let request_kind = match request {
        StepRequest::Choice(_) => "choice_click",
        _ => "free_input",
    };
    let alignment = intent_alignment(request, resolution.fallback_used);
    let narrative_text = if resolution.fallback_used && !config.prompt.fallback_llm_enabled {
        static_fallback_text(&node, &resolution, &config.prompt.default_locale)
    } else {
        let context = build_narration_context(
            &pack,
            &node,
            request,
            raw_input,
            alignment,
            &resolution,
            &state_before,
            &state_after,
            &from_node_id,
            &to_node_id,
            &action_effects,
            quest_advance.progressed,
            fired_event.as_ref().map(|event| RuntimeEventCtx {
                event_id: event.event_id.clone(),
                title: event.title.clone(),
                narration_hint: event.narration_hint.clone(),
                effects: compact_delta(&event.effects),
            }),
            ending.as_ref(),
        );
        let prompt = prompts::build_narration_prompt(&context, &config.prompt);
        transport
            .narrate(&prompt, None, emitter, Some(&config.prompt.default_locale), request_kind)?
            .narrative_text
    };

    // Persist: ActionLog plus Session update, same transaction.
    let now = Utc::now();
    let delta_value = state_delta(&state_before, &state_after);
    let state_after_value = serde_json::to_value(&state_after)?;
    let session_status = if ending.is_some() {
        SessionStatus::Ended
    } else {
        SessionStatus::Active
    };

    let player_input_text = match request {
        StepRequest::PlayerInput(text) => text.clone(),
        _ => String::new(),
    };
    // The layer_debug block is what the dev inspector reads back; it carries
    // the full resolution alongside the per-step guard and ending flags.
    let all_blocked_guard = resolution
        .fallback_markers
        .iter()
        .any(|m| m == resolver::MARKER_REROUTED_TARGET_BLOCKED);
    let stall_guard = matches!(resolution.action, ExecutedAction::DegradedNoop);
    let classification = serde_json::json!({
        "selection_source": resolution.source.as_str(),
        "fallback_reason": resolution.fallback_reason.map(|r| r.as_str()),
        "layer_debug": {
            "input_mode": request_kind,
            "player_input": player_input_text.clone(),
            "attempted_choice_id": resolution.attempted_choice_id.clone(),
            "executed_choice_id": resolution.executed_choice_id(),
            "resolved_choice_id": resolution.resolved_choice_id(),
            "mapping_confidence": resolution.mapping_confidence,
            "fallback_reason": resolution.fallback_reason.map(|r| r.as_str()),
            "fallback_markers": resolution.fallback_markers.clone(),
            "intent_id": resolution.intent_id.clone(),
            "notes": resolution.notes.clone(),
            "prompt_policy": {
                "intent_action_alignment": alignment.as_str(),
            },
            "quest_event_ending_flags": {
                "step_index": step_index,
                "fallback_used": resolution.fallback_used,
                "event_present": fired_event.is_some(),
                "all_blocked_guard_triggered": all_blocked_guard,
                "stall_guard_triggered": stall_guard,
                "run_ended": ending.is_some(),
                "ending_id": ending.as_ref().map(|e| e.ending_id.clone()),
                "ending_outcome": ending.as_ref().map(|e| e.outcome.clone()),
            },
        },
    });
    let proposed_action = match request {
        StepRequest::Choice(choice_id) => serde_json::json!({"choice_id": choice_id}),
        StepRequest::PlayerInput(text) => serde_json::json!({"player_input": text}),
        StepRequest::Empty => serde_json::json!({}),
    };
    let final_action = serde_json::json!({
        "choice_id": resolution.executed_choice_id(),
        "action_id": resolution.action.action_id().map(|a| a.as_str()),
        "next_node_id": to_node_id,
    });

    data.action_logs.push(ActionLogRow {
        id: ActionLogId::new(),
        session_id: session_id.clone(),
        story_node_id: Some(from_node_id.clone()),
        story_choice_id: Some(resolution.executed_choice_id().to_string()),
        player_input: player_input_text,
        user_raw_input: raw_input.map(str::to_string),
        proposed_action,
        final_action,
        fallback_used: resolution.fallback_used,
        fallback_reasons: resolution.fallback_reasons(),
        action_confidence: resolution.mapping_confidence,
        key_decision: resolution.action.is_key_decision(),
        classification,
        state_before: serde_json::to_value(&state_before)?,
        state_after: state_after_value.clone(),
        state_delta: delta_value,
        matched_rules,
        created_at: now,
    });

    let session_row = data.session_mut(session_id)?;
    session_row.state_json = state_after_value;
    session_row.story_node_id = Some(to_node_id.clone());
    session_row.status = session_status;
    session_row.updated_at = now;

    let current_node = build_current_node_view(&pack, &to_node_id, &state_after);
    Ok(StepResponse {
        narrative_text,
        story_node_id: to_node_id,
        session_status,
        run_ended: ending.is_some(),
        ending_id: ending.as_ref().map(|e| e.ending_id.clone()),
        ending_outcome: ending.as_ref().map(|e| e.outcome.clone()),
        ending_epilogue: ending.as_ref().map(|e| e.epilogue.clone()),
        current_node,
        state_excerpt: state_excerpt(&state_after),
        attempted_choice_id: resolution.attempted_choice_id.clone(),
        executed_choice_id: resolution.executed_choice_id().to_string(),
        resolved_choice_id: resolution.resolved_choice_id().to_string(),
        fallback_used: resolution.fallback_used,
        fallback_reason: resolution.fallback_reason.map(|r| r.as_str().to_string()),
        selection_source: resolution.source.as_str().to_string(),
        mapping_confidence: resolution.mapping_confidence,
        step_index,
    })
}

/// Apply the resolved action's effects and compute the landing node.
fn execute_action(
    pack: &StoryPack,
    node: &Node,
    resolution: &Resolution,
    state: &mut SessionState,
) -> Result<(Effects, String)> {
    match &resolution.action {
        ExecutedAction::Choice(choice) => {
            let applied = choice
                .effects
                .as_ref()
                .map(|effects| apply_effects(state, effects))
                .unwrap_or_default();
            Ok((applied, choice.next_node_id.clone()))
        }
        ExecutedAction::NodeFallback(fallback) => {
            let applied = fallback
                .effects
                .as_ref()
                .map(|effects| apply_effects(state, effects))
                .unwrap_or_default();
            let to_node = match fallback.next_node_id_policy {
                NextNodePolicy::Stay => node.node_id.clone(),
                NextNodePolicy::ExplicitNext => fallback
                    .next_node_id
                    .clone()
                    .filter(|target| pack.node(target).is_some())
                    .unwrap_or_else(|| node.node_id.clone()),
            };
            Ok((applied, to_node))
        }
        ExecutedAction::GlobalExecutor(executor) => {
            let applied = executor
                .effects
                .as_ref()
                .map(|effects| apply_effects(state, effects))
                .unwrap_or_default();
            let to_node = executor
                .next_node_id
                .clone()
                .filter(|target| pack.node(target).is_some())
                .unwrap_or_else(|| node.node_id.clone());
            Ok((applied, to_node))
        }
        ExecutedAction::DegradedNoop => Ok((Effects::default(), node.node_id.clone())),
    }
}

fn sum_effects(a: &Effects, b: &Effects) -> Effects {
    Effects {
        energy: a.energy + b.energy,
        money: a.money + b.money,
        knowledge: a.knowledge + b.knowledge,
        affection: a.affection + b.affection,
    }
}

/// Static narration served when the fallback LLM channel is disabled.
fn static_fallback_text(node: &Node, resolution: &Resolution, locale: &str) -> String {
    let reason = resolution
        .fallback_reason
        .map(FallbackReason::as_str)
        .unwrap_or("DEFAULT");
    if let ExecutedAction::GlobalExecutor(executor) = &resolution.action {
        if let Some(narration) = &executor.narration {
            if !narration.skeleton.trim().is_empty() {
                return narration.skeleton.clone();
            }
        }
    }
    node.fallback
        .as_ref()
        .and_then(|fallback| fallback.text_for_reason(reason, locale))
        .filter(|text| !text.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            "You take a moment to steady yourself. The world waits for your next move.".to_string()
        })
}

fn state_excerpt(state: &SessionState) -> Value {
    serde_json::json!({
        "day": state.day,
        "slot": state.slot.as_str(),
        "energy": state.energy,
        "money": state.money,
        "knowledge": state.knowledge,
        "affection": state.affection,
        "run_state": serde_json::to_value(&state.run_state).unwrap_or(Value::Null),
        "quest_state": serde_json::to_value(&state.quest_state).unwrap_or(Value::Null),
    })
}

fn build_current_node_view(
    pack: &StoryPack,
    node_id: &str,
    state: &SessionState,
) -> Option<CurrentNodeView> {
    let node = pack.node(node_id)?;
    Some(CurrentNodeView {
        id: node.node_id.clone(),
        title: node.title.clone(),
        scene_brief: node.scene_brief.clone(),
        choices: story_choices_for_response(node, state),
    })
}

/// Intent-vs-executed-action relationship: any clean resolution is aligned,
/// a free-input fallback is a mismatch, everything else is unknown.
fn intent_alignment(request: &StepRequest, fallback_used: bool) -> IntentAlignment {
    match (request, fallback_used) {
        (_, false) => IntentAlignment::Aligned,
        (StepRequest::PlayerInput(_), true) => IntentAlignment::Mismatch,
        _ => IntentAlignment::Unknown,
    }
}

#[allow(clippy::too_many_arguments)]
fn build_narration_context(
    pack: &StoryPack,
    node: &Node,
    request: &StepRequest,
    raw_input: Option<&str>,
    alignment: IntentAlignment,
    resolution: &Resolution,
    state_before: &SessionState,
    state_after: &SessionState,
    from_node_id: &str,
    to_node_id: &str,
    action_effects: &Effects,
    quest_progressed: bool,
    runtime_event: Option<RuntimeEventCtx>,
    ending: Option<&crate::engine::EndingResolution>,
) -> NarrationContext {
    let input_mode = match request {
        StepRequest::Choice(_) => InputMode::ChoiceClick,
        _ => InputMode::FreeInput,
    };

    let to_scene = pack
        .node(to_node_id)
        .map(|n| n.scene_brief.clone())
        .unwrap_or_default();
    let total_delta = state_delta(state_before, state_after);
    let event_effects = runtime_event
        .as_ref()
        .map(|event| event.effects.clone())
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

    let impact_brief: Vec<String> = total_delta
        .as_object()
        .map(|delta| {
            delta
                .iter()
                .filter_map(|(axis, value)| {
                    value.as_i64().map(|v| {
                        if v >= 0 {
                            format!("{axis} +{v}")
                        } else {
                            format!("{axis} {v}")
                        }
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let quest_summary = build_quest_summary(pack, state_after);
    let event_present = runtime_event.is_some();
    let (quest_nudge, suppressed) =
        build_quest_nudge(pack, state_after, quest_progressed, event_present);

    NarrationContext {
        input_mode,
        player_input_raw: raw_input.unwrap_or("").to_string(),
        node_transition: NodeTransitionCtx {
            from_node_id: from_node_id.to_string(),
            to_node_id: to_node_id.to_string(),
            from_scene: node.scene_brief.clone(),
            to_scene,
        },
        selection_resolution: SelectionResolutionCtx {
            attempted_choice_id: resolution.attempted_choice_id.clone(),
            executed_choice_id: resolution.executed_choice_id().to_string(),
            resolved_choice_id: resolution.resolved_choice_id().to_string(),
            selected_choice_label: resolution.action.display_label().to_string(),
            selected_action_id: resolution
                .action
                .action_id()
                .map(|a| a.as_str().to_string())
                .unwrap_or_default(),
            mapping_confidence: resolution.mapping_confidence,
            fallback_used: resolution.fallback_used,
            fallback_reason: resolution
                .fallback_reason
                .map(|r| r.as_str().to_string()),
        },
        causal_policy: "strict_separation",
        intent_action_alignment: alignment,
        state_snapshot_before: StateSnapshotCtx::from_state(state_before),
        state_snapshot_after: StateSnapshotCtx::from_state(state_after),
        state_delta: total_delta,
        impact_brief,
        impact_sources: ImpactSourcesCtx {
            action_effects: compact_delta(action_effects),
            event_effects,
            total_effects: compact_delta(&Effects {
                energy: state_after.energy - state_before.energy,
                money: state_after.money - state_before.money,
                knowledge: state_after.knowledge - state_before.knowledge,
                affection: state_after.affection - state_before.affection,
            }),
        },
        event_present,
        quest_summary,
        quest_nudge,
        quest_nudge_suppressed_by_event: suppressed,
        runtime_event,
        run_ending: match ending {
            Some(ending) => RunEndingCtx {
                run_ended: true,
                ending_id: Some(ending.ending_id.clone()),
                ending_outcome: Some(ending.outcome.clone()),
                ending_title: Some(ending.title.clone()).filter(|t| !t.is_empty()),
                ending_epilogue: Some(ending.epilogue.clone()).filter(|e| !e.is_empty()),
            },
            None => RunEndingCtx::default(),
        },
    }
}

fn build_quest_summary(pack: &StoryPack, state: &SessionState) -> QuestSummaryCtx {
    let active_quests = state
        .quest_state
        .active_quests
        .iter()
        .filter_map(|quest_id| {
            let quest = pack.quest(quest_id)?;
            let progress = state.quest_state.quests.get(quest_id)?;
            let stage = quest.stage(&progress.current_stage_id);
            let (done, total) = progress
                .stages
                .get(&progress.current_stage_id)
                .map(|stage_progress| {
                    let done = stage_progress.milestones.values().filter(|m| m.done).count();
                    (done, stage_progress.milestones.len())
                })
                .unwrap_or((0, 0));
            Some(prompts::ActiveQuestCtx {
                quest_id: quest_id.clone(),
                title: quest.title.clone(),
                current_stage_title: stage.map(|s| s.title.clone()).unwrap_or_default(),
                stage_progress: prompts::StageProgressCtx { done, total },
            })
        })
        .collect();

    let recent_events = state
        .quest_state
        .recent_events
        .iter()
        .map(|event| RecentQuestEventCtx {
            event_type: serde_json::to_value(event.event_type)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            quest_id: event.quest_id.clone(),
            title: pack
                .quest(&event.quest_id)
                .map(|q| q.title.clone())
                .unwrap_or_default(),
        })
        .collect();

    QuestSummaryCtx {
        active_quests,
        recent_events,
    }
}

/// Nudge policy: quest progress this step arms an event-driven nudge; every
/// third step arms a cadence nudge while a quest is active. A runtime event
/// on the same step suppresses either.
fn build_quest_nudge(
    pack: &StoryPack,
    state: &SessionState,
    quest_progressed: bool,
    event_present: bool,
) -> (QuestNudgeCtx, bool) {
    let hints: Vec<String> = state
        .quest_state
        .active_quests
        .iter()
        .filter_map(|quest_id| {
            let quest = pack.quest(quest_id)?;
            if quest.title.trim().is_empty() {
                return None;
            }
            let progress = state.quest_state.quests.get(quest_id);
            let stage_title = progress
                .and_then(|p| quest.stage(&p.current_stage_id))
                .map(|s| s.title.clone())
                .filter(|t| !t.trim().is_empty());
            Some(match stage_title {
                Some(stage_title) => format!("{}: {}", quest.title, stage_title),
                None => quest.title.clone(),
            })
        })
        .collect();

    let mode = if quest_progressed {
        "event_driven"
    } else if !hints.is_empty() && state.run_state.step_index % 3 == 0 {
        "cadence"
    } else {
        "off"
    };
    let armed = mode != "off" && !hints.is_empty();

    if event_present {
        return (QuestNudgeCtx::default(), armed);
    }
    if !armed {
        return (QuestNudgeCtx::default(), false);
    }
    (
        QuestNudgeCtx {
            enabled: true,
            mode: mode.to_string(),
            mainline_hint: hints.first().cloned(),
            sideline_hint: hints.get(1).cloned(),
        },
        false,
    )
}
