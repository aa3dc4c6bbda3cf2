//! Selection resolver — maps a step request to the action that executes.
//!
//! A request is either an explicit `choice_id` or free player text. Free text
//! goes through author intents first (rule mapping) and only then to the LLM
//! selector; anything that cannot execute walks the ordered fallback tree.
//! The resolver never mutates state — it only decides, the orchestrator
//! executes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::llm::SelectionOutput;
use crate::pack::{
    Choice, FallbackExecutor, Intent, Node, NodeFallback, StoryPack, FALLBACK_CHOICE_ID,
};
use crate::state::{requires_met, SessionState};
use crate::types::Result;

/// Confidence below which a selector reply degrades to `LOW_CONF`.
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.3;

/// Free input longer than this is not sent to the selector at all.
const MAX_PLAYER_INPUT_CHARS: usize = 2000;

/// Degraded-path markers recorded alongside the fallback reason.
pub const MARKER_REROUTE_LIMIT: &str = "REROUTE_LIMIT_REACHED_DEGRADED";
pub const MARKER_REROUTED_TARGET_BLOCKED: &str = "REROUTED_TARGET_PREREQ_BLOCKED_DEGRADED";
pub const MARKER_FALLBACK_CONFIG_INVALID: &str = "FALLBACK_CONFIG_INVALID";

/// Normalized step request: exactly one input, or none at all.
#[derive(Debug, Clone, PartialEq)]
pub enum StepRequest {
    Choice(String),
    PlayerInput(String),
    Empty,
}

impl StepRequest {
    /// Normalize optional raw inputs; whitespace-only text counts as absent.
    /// Returns `None` when both inputs are present (the caller rejects that
    /// with `INPUT_CONFLICT`).
    pub fn from_parts(choice_id: Option<&str>, player_input: Option<&str>) -> Option<Self> {
        let choice = choice_id.map(str::trim).filter(|s| !s.is_empty());
        let input = player_input.map(str::trim).filter(|s| !s.is_empty());
        match (choice, input) {
            (Some(_), Some(_)) => None,
            (Some(c), None) => Some(StepRequest::Choice(c.to_string())),
            (None, Some(i)) => Some(StepRequest::PlayerInput(i.to_string())),
            (None, None) => Some(StepRequest::Empty),
        }
    }

    pub fn is_free_input(&self) -> bool {
        matches!(self, StepRequest::PlayerInput(_))
    }
}

/// Why the resolver took the fallback tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackReason {
    NoInput,
    Blocked,
    Fallback,
    NoMatch,
    LowConf,
    InputPolicy,
    PrereqBlocked,
}

impl FallbackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::NoInput => "NO_INPUT",
            FallbackReason::Blocked => "BLOCKED",
            FallbackReason::Fallback => "FALLBACK",
            FallbackReason::NoMatch => "NO_MATCH",
            FallbackReason::LowConf => "LOW_CONF",
            FallbackReason::InputPolicy => "INPUT_POLICY",
            FallbackReason::PrereqBlocked => "PREREQ_BLOCKED",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the executed choice was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionSource {
    Explicit,
    Rule,
    Llm,
    Fallback,
}

impl SelectionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionSource::Explicit => "explicit",
            SelectionSource::Rule => "rule",
            SelectionSource::Llm => "llm",
            SelectionSource::Fallback => "fallback",
        }
    }
}

/// What the step will execute.
#[derive(Debug, Clone)]
pub enum ExecutedAction {
    Choice(Choice),
    NodeFallback(NodeFallback),
    GlobalExecutor(FallbackExecutor),
    DegradedNoop,
}

impl ExecutedAction {
    pub fn choice_id(&self) -> &str {
        match self {
            ExecutedAction::Choice(choice) => &choice.choice_id,
            ExecutedAction::NodeFallback(fallback) => &fallback.id,
            ExecutedAction::GlobalExecutor(executor) => &executor.id,
            ExecutedAction::DegradedNoop => FALLBACK_CHOICE_ID,
        }
    }

    pub fn action_id(&self) -> Option<crate::pack::ActionId> {
        match self {
            ExecutedAction::Choice(choice) => Some(choice.action.action_id),
            ExecutedAction::NodeFallback(fallback) => Some(fallback.action.action_id),
            ExecutedAction::GlobalExecutor(executor) => Some(executor.action_id),
            ExecutedAction::DegradedNoop => None,
        }
    }

    pub fn display_label(&self) -> &str {
        match self {
            ExecutedAction::Choice(choice) => &choice.display_text,
            _ => "",
        }
    }

    pub fn is_key_decision(&self) -> bool {
        matches!(self, ExecutedAction::Choice(choice) if choice.is_key_decision)
    }
}

/// Resolver output consumed by the step orchestrator and the audit log.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub attempted_choice_id: Option<String>,
    pub action: ExecutedAction,
    pub fallback_used: bool,
    pub fallback_reason: Option<FallbackReason>,
    /// Degraded-path markers beyond the primary reason.
    pub fallback_markers: Vec<String>,
    pub source: SelectionSource,
    pub mapping_confidence: Option<f64>,
    pub intent_id: Option<String>,
    pub notes: Option<String>,
}

impl Resolution {
    pub fn executed_choice_id(&self) -> &str {
        self.action.choice_id()
    }

    pub fn resolved_choice_id(&self) -> &str {
        self.action.choice_id()
    }

    /// All reasons for the audit row: primary reason first, then markers.
    pub fn fallback_reasons(&self) -> Vec<String> {
        let mut reasons: Vec<String> = Vec::new();
        if let Some(reason) = self.fallback_reason {
            reasons.push(reason.as_str().to_string());
        }
        reasons.extend(self.fallback_markers.iter().cloned());
        reasons
    }
}

/// Context handed to the LLM selector call.
#[derive(Debug, Clone)]
pub struct SelectionContext<'a> {
    pub player_input: &'a str,
    pub valid_choice_ids: Vec<String>,
    pub visible_choices: Vec<&'a Choice>,
    pub intents: &'a [Intent],
    pub state: &'a SessionState,
    pub node_id: &'a str,
}

/// Resolve a step request against the current node.
///
/// `selector` performs the LLM selection call and is invoked at most once;
/// its transport errors (503) propagate unchanged.
pub fn resolve<F>(
    pack: &StoryPack,
    node: &Node,
    state: &SessionState,
    request: &StepRequest,
    selector: F,
) -> Result<Resolution>
where
    F: FnOnce(&SelectionContext<'_>) -> Result<SelectionOutput>,
{
    match request {
        StepRequest::Empty => Ok(fallback_tree(
            pack,
            node,
            state,
            None,
            FallbackReason::NoInput,
            None,
        )),
        StepRequest::Choice(choice_id) => resolve_choice_click(pack, node, state, choice_id),
        StepRequest::PlayerInput(input) => {
            resolve_free_input(pack, node, state, input, selector)
        }
    }
}

fn resolve_choice_click(
    pack: &StoryPack,
    node: &Node,
    state: &SessionState,
    choice_id: &str,
) -> Result<Resolution> {
    match node.choice(choice_id) {
        Some(choice) => {
            let gate = choice
                .requires
                .as_ref()
                .map(|requires| requires_met(state, requires))
                .unwrap_or(Ok(()));
            match gate {
                Ok(()) => Ok(Resolution {
                    attempted_choice_id: Some(choice_id.to_string()),
                    action: ExecutedAction::Choice(choice.clone()),
                    fallback_used: false,
                    fallback_reason: None,
                    fallback_markers: Vec::new(),
                    source: SelectionSource::Explicit,
                    mapping_confidence: None,
                    intent_id: None,
                    notes: None,
                }),
                Err(_) => Ok(fallback_tree(
                    pack,
                    node,
                    state,
                    Some(choice_id),
                    FallbackReason::Blocked,
                    None,
                )),
            }
        }
        // Unknown id is a soft miss, not a client error.
        None => Ok(fallback_tree(
            pack,
            node,
            state,
            Some(choice_id),
            FallbackReason::Fallback,
            None,
        )),
    }
}

fn resolve_free_input<F>(
    pack: &StoryPack,
    node: &Node,
    state: &SessionState,
    input: &str,
    selector: F,
) -> Result<Resolution>
where
    F: FnOnce(&SelectionContext<'_>) -> Result<SelectionOutput>,
{
    if input.chars().count() > MAX_PLAYER_INPUT_CHARS {
        return Ok(fallback_tree(
            pack,
            node,
            state,
            None,
            FallbackReason::InputPolicy,
            None,
        ));
    }

    // Rule mapping first: a single unambiguous intent skips the LLM entirely.
    if let Some(intent) = match_single_intent(node, input) {
        if let Some(choice) = node.choice(&intent.alias_choice_id) {
            let gate = choice
                .requires
                .as_ref()
                .map(|requires| requires_met(state, requires))
                .unwrap_or(Ok(()));
            if gate.is_ok() {
                return Ok(Resolution {
                    attempted_choice_id: None,
                    action: ExecutedAction::Choice(choice.clone()),
                    fallback_used: false,
                    fallback_reason: None,
                    fallback_markers: Vec::new(),
                    source: SelectionSource::Rule,
                    mapping_confidence: Some(1.0),
                    intent_id: Some(intent.intent_id.clone()),
                    notes: None,
                });
            }
        }
    }

    let context = SelectionContext {
        player_input: input,
        valid_choice_ids: node.choices.iter().map(|c| c.choice_id.clone()).collect(),
        visible_choices: node.choices.iter().collect(),
        intents: &node.intents,
        state,
        node_id: &node.node_id,
    };
    let selection = selector(&context)?;
    Ok(apply_selection(pack, node, state, input, selection))
}

fn apply_selection(
    pack: &StoryPack,
    node: &Node,
    state: &SessionState,
    _input: &str,
    selection: SelectionOutput,
) -> Resolution {
    let confidence = selection.confidence;
    let intent_id = selection.intent_id.clone();
    let notes = selection.notes.clone();

    if !selection.use_fallback {
        if let Some(choice_id) = selection.choice_id.as_deref() {
            match node.choice(choice_id) {
                Some(choice) => {
                    let gate = choice
                        .requires
                        .as_ref()
                        .map(|requires| requires_met(state, requires))
                        .unwrap_or(Ok(()));
                    match gate {
                        Ok(()) => {
                            return Resolution {
                                attempted_choice_id: None,
                                action: ExecutedAction::Choice(choice.clone()),
                                fallback_used: false,
                                fallback_reason: None,
                                fallback_markers: Vec::new(),
                                source: SelectionSource::Llm,
                                mapping_confidence: Some(confidence),
                                intent_id,
                                notes,
                            };
                        }
                        Err(_) => {
                            return fallback_tree(
                                pack,
                                node,
                                state,
                                Some(choice_id),
                                FallbackReason::PrereqBlocked,
                                Some(confidence),
                            );
                        }
                    }
                }
                None => {
                    return fallback_tree(
                        pack,
                        node,
                        state,
                        Some(choice_id),
                        FallbackReason::NoMatch,
                        Some(confidence),
                    );
                }
            }
        }
    }

    let reason = classify_selector_miss(&selection);
    fallback_tree(pack, node, state, None, reason, Some(confidence))
}

fn classify_selector_miss(selection: &SelectionOutput) -> FallbackReason {
    let notes = selection.notes.as_deref().unwrap_or("").to_ascii_lowercase();
    if notes.contains("no_match") {
        FallbackReason::NoMatch
    } else if selection.confidence > 0.0 && selection.confidence < LOW_CONFIDENCE_THRESHOLD {
        FallbackReason::LowConf
    } else {
        FallbackReason::Fallback
    }
}

/// Exactly-one-winner intent matching: case-insensitive pattern containment.
fn match_single_intent<'a>(node: &'a Node, input: &str) -> Option<&'a Intent> {
    let normalized = input.to_lowercase();
    let mut winner: Option<&Intent> = None;
    for intent in &node.intents {
        let hits = intent.patterns.iter().any(|pattern| {
            let pattern = pattern.trim().to_lowercase();
            !pattern.is_empty() && normalized.contains(&pattern)
        });
        if hits {
            if winner.is_some() {
                return None;
            }
            winner = Some(intent);
        }
    }
    winner
}

/// The ordered fallback tree. Each rung is tried once; a blocked reroute
/// target never recurses into a second reroute.
fn fallback_tree(
    pack: &StoryPack,
    node: &Node,
    state: &SessionState,
    attempted: Option<&str>,
    reason: FallbackReason,
    confidence: Option<f64>,
) -> Resolution {
    let mut markers: Vec<String> = Vec::new();
    let mut had_any_rung = false;

    // (a) node fallback choice: executes a real visible choice.
    if let Some(fallback_choice_id) = &node.node_fallback_choice_id {
        had_any_rung = true;
        if let Some(choice) = node.choice(fallback_choice_id) {
            let gate = choice
                .requires
                .as_ref()
                .map(|requires| requires_met(state, requires))
                .unwrap_or(Ok(()));
            match gate {
                Ok(()) => {
                    return Resolution {
                        attempted_choice_id: attempted.map(str::to_string),
                        action: ExecutedAction::Choice(choice.clone()),
                        fallback_used: true,
                        fallback_reason: Some(reason),
                        fallback_markers: markers,
                        source: SelectionSource::Fallback,
                        mapping_confidence: confidence,
                        intent_id: None,
                        notes: None,
                    };
                }
                Err(_) => {
                    markers.push(MARKER_REROUTE_LIMIT.to_string());
                    markers.push(MARKER_REROUTED_TARGET_BLOCKED.to_string());
                }
            }
        }
    } else if let Some(fallback) = &node.fallback {
        // (b) node fallback block, only when no reroute choice is declared.
        had_any_rung = true;
        return Resolution {
            attempted_choice_id: attempted.map(str::to_string),
            action: ExecutedAction::NodeFallback(fallback.clone()),
            fallback_used: true,
            fallback_reason: Some(reason),
            fallback_markers: markers,
            source: SelectionSource::Fallback,
            mapping_confidence: confidence,
            intent_id: None,
            notes: None,
        };
    }

    // (c) global fallback executor.
    if let Some(executor) = pack.global_fallback() {
        had_any_rung = true;
        let gate = executor
            .prereq
            .as_ref()
            .map(|requires| requires_met(state, requires))
            .unwrap_or(Ok(()));
        match gate {
            Ok(()) => {
                return Resolution {
                    attempted_choice_id: attempted.map(str::to_string),
                    action: ExecutedAction::GlobalExecutor(executor.clone()),
                    fallback_used: true,
                    fallback_reason: Some(reason),
                    fallback_markers: markers,
                    source: SelectionSource::Fallback,
                    mapping_confidence: confidence,
                    intent_id: None,
                    notes: None,
                };
            }
            Err(_) => {
                if !markers.iter().any(|m| m == MARKER_REROUTED_TARGET_BLOCKED) {
                    markers.push(MARKER_REROUTED_TARGET_BLOCKED.to_string());
                }
            }
        }
    }

    // (d) degraded no-op.
    if !had_any_rung {
        markers.push(MARKER_FALLBACK_CONFIG_INVALID.to_string());
    }
    Resolution {
        attempted_choice_id: attempted.map(str::to_string),
        action: ExecutedAction::DegradedNoop,
        fallback_used: true,
        fallback_reason: Some(reason),
        fallback_markers: markers,
        source: SelectionSource::Fallback,
        mapping_confidence: confidence,
        intent_id: None,
        notes: None,
    }
}
