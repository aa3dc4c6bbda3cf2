//! Runtime pack normalization and validation.
//!
//! Brings raw `pack_json` into the typed v1.0 form and enforces the load-time
//! invariants. Any violation fails with `RUNTIME_PACK_V10_REQUIRED` so a
//! session can never start against a pack the step pipeline cannot execute.

use std::collections::{HashSet, VecDeque};

use crate::pack::{NextNodePolicy, StoryPack, RESERVED_ID_PREFIX};
use crate::types::{Error, Result};

/// Parse and validate a raw pack for runtime use.
pub fn normalize_pack_for_runtime(pack_json: &serde_json::Value) -> Result<StoryPack> {
    let pack: StoryPack = serde_json::from_value(pack_json.clone())
        .map_err(|e| Error::pack_invalid(format!("pack shape: {e}")))?;
    validate_runtime_pack(&pack)?;
    Ok(pack)
}

/// Enforce the v1.0 runtime invariants on an already-typed pack.
pub fn validate_runtime_pack(pack: &StoryPack) -> Result<()> {
    if pack.start_node_id.trim().is_empty() || pack.node(&pack.start_node_id).is_none() {
        return Err(Error::pack_invalid(format!(
            "start_node_id '{}' does not resolve",
            pack.start_node_id
        )));
    }

    validate_choice_ids(pack)?;
    validate_node_edges(pack)?;
    validate_executors(pack)?;
    validate_quests(pack)?;
    validate_events(pack)?;
    validate_endings(pack)?;
    validate_reachability(pack)?;
    Ok(())
}

fn validate_choice_ids(pack: &StoryPack) -> Result<()> {
    let mut seen = HashSet::new();
    for node in &pack.nodes {
        for choice in &node.choices {
            if choice.choice_id.starts_with(RESERVED_ID_PREFIX) {
                return Err(Error::pack_invalid(format!(
                    "choice id '{}' uses the reserved prefix",
                    choice.choice_id
                )));
            }
            if !seen.insert(choice.choice_id.as_str()) {
                return Err(Error::pack_invalid(format!(
                    "duplicate choice id '{}'",
                    choice.choice_id
                )));
            }
        }
    }
    Ok(())
}

fn validate_node_edges(pack: &StoryPack) -> Result<()> {
    for node in &pack.nodes {
        for choice in &node.choices {
            if pack.node(&choice.next_node_id).is_none() {
                return Err(Error::pack_invalid(format!(
                    "choice '{}' next_node_id '{}' does not resolve",
                    choice.choice_id, choice.next_node_id
                )));
            }
        }

        for intent in &node.intents {
            if node.choice(&intent.alias_choice_id).is_none() {
                return Err(Error::pack_invalid(format!(
                    "intent '{}' alias_choice_id '{}' is not visible on node '{}'",
                    intent.intent_id, intent.alias_choice_id, node.node_id
                )));
            }
        }

        if let Some(fallback_choice) = &node.node_fallback_choice_id {
            if node.choice(fallback_choice).is_none() {
                return Err(Error::pack_invalid(format!(
                    "node_fallback_choice_id '{}' is not visible on node '{}'",
                    fallback_choice, node.node_id
                )));
            }
        }

        if let Some(fallback) = &node.fallback {
            if fallback.next_node_id_policy == NextNodePolicy::ExplicitNext {
                let target = fallback.next_node_id.as_deref().unwrap_or("");
                if pack.node(target).is_none() {
                    return Err(Error::pack_invalid(format!(
                        "node '{}' fallback explicit_next target '{}' does not resolve",
                        node.node_id, target
                    )));
                }
            }
        }

        if !node.is_end && !(2..=4).contains(&node.choices.len()) {
            return Err(Error::pack_invalid(format!(
                "non-end node '{}' must declare 2-4 choices, has {}",
                node.node_id,
                node.choices.len()
            )));
        }
    }
    Ok(())
}

fn validate_executors(pack: &StoryPack) -> Result<()> {
    let mut seen = HashSet::new();
    for executor in &pack.fallback_executors {
        if executor.id.starts_with(RESERVED_ID_PREFIX) {
            return Err(Error::pack_invalid(format!(
                "fallback executor id '{}' uses the reserved prefix",
                executor.id
            )));
        }
        if !seen.insert(executor.id.as_str()) {
            return Err(Error::pack_invalid(format!(
                "duplicate fallback executor id '{}'",
                executor.id
            )));
        }
        if let Some(next) = &executor.next_node_id {
            if pack.node(next).is_none() {
                return Err(Error::pack_invalid(format!(
                    "fallback executor '{}' next_node_id '{}' does not resolve",
                    executor.id, next
                )));
            }
        }
    }

    if let Some(global_id) = &pack.global_fallback_choice_id {
        if pack.executor(global_id).is_none() {
            return Err(Error::pack_invalid(format!(
                "global_fallback_choice_id '{global_id}' has no executor entry"
            )));
        }
    }
    Ok(())
}

fn validate_trigger_refs(pack: &StoryPack, scope: &str, trigger: &crate::pack::Trigger) -> Result<()> {
    if let Some(node_id) = &trigger.node_id_is {
        if pack.node(node_id).is_none() {
            return Err(Error::pack_invalid(format!(
                "{scope}: node_id_is '{node_id}' does not resolve"
            )));
        }
    }
    if let Some(node_id) = &trigger.next_node_id_is {
        if pack.node(node_id).is_none() {
            return Err(Error::pack_invalid(format!(
                "{scope}: next_node_id_is '{node_id}' does not resolve"
            )));
        }
    }
    if let Some(choice_id) = &trigger.executed_choice_id_is {
        if pack.choice(choice_id).is_none() {
            return Err(Error::pack_invalid(format!(
                "{scope}: executed_choice_id_is '{choice_id}' does not resolve"
            )));
        }
    }
    Ok(())
}

fn validate_quests(pack: &StoryPack) -> Result<()> {
    let mut quest_ids = HashSet::new();
    for quest in &pack.quests {
        if !quest_ids.insert(quest.quest_id.as_str()) {
            return Err(Error::pack_invalid(format!(
                "duplicate quest id '{}'",
                quest.quest_id
            )));
        }
        let mut stage_ids = HashSet::new();
        for stage in &quest.stages {
            if !stage_ids.insert(stage.stage_id.as_str()) {
                return Err(Error::pack_invalid(format!(
                    "quest '{}': duplicate stage id '{}'",
                    quest.quest_id, stage.stage_id
                )));
            }
            let mut milestone_ids = HashSet::new();
            for milestone in &stage.milestones {
                if !milestone_ids.insert(milestone.milestone_id.as_str()) {
                    return Err(Error::pack_invalid(format!(
                        "quest '{}' stage '{}': duplicate milestone id '{}'",
                        quest.quest_id, stage.stage_id, milestone.milestone_id
                    )));
                }
                let scope = format!(
                    "quest '{}' milestone '{}'",
                    quest.quest_id, milestone.milestone_id
                );
                validate_trigger_refs(pack, &scope, &milestone.when)?;
            }
        }
    }
    Ok(())
}

fn validate_events(pack: &StoryPack) -> Result<()> {
    let mut event_ids = HashSet::new();
    for event in &pack.events {
        if !event_ids.insert(event.event_id.as_str()) {
            return Err(Error::pack_invalid(format!(
                "duplicate event id '{}'",
                event.event_id
            )));
        }
        let scope = format!("event '{}'", event.event_id);
        validate_trigger_refs(pack, &scope, &event.trigger)?;
    }
    Ok(())
}

fn validate_endings(pack: &StoryPack) -> Result<()> {
    let mut ending_ids = HashSet::new();
    for ending in &pack.endings {
        if !ending_ids.insert(ending.ending_id.as_str()) {
            return Err(Error::pack_invalid(format!(
                "duplicate ending id '{}'",
                ending.ending_id
            )));
        }
        if let Some(required_quests) = &ending.trigger.completed_quests_include {
            for quest_id in required_quests {
                if pack.quest(quest_id).is_none() {
                    return Err(Error::pack_invalid(format!(
                        "ending '{}': completed_quests_include '{}' does not resolve",
                        ending.ending_id, quest_id
                    )));
                }
            }
        }
        let scope = format!("ending '{}'", ending.ending_id);
        validate_trigger_refs(pack, &scope, &ending.trigger)?;
    }
    Ok(())
}

/// Walk the graph from the start node; any reachable non-end node must keep
/// the player moving (zero-choice dead ends are rejected).
fn validate_reachability(pack: &StoryPack) -> Result<()> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([pack.start_node_id.as_str()]);

    while let Some(node_id) = queue.pop_front() {
        if !visited.insert(node_id) {
            continue;
        }
        let Some(node) = pack.node(node_id) else {
            continue;
        };
        if !node.is_end && node.choices.is_empty() {
            return Err(Error::pack_invalid(format!(
                "reachable non-end node '{}' has no choices",
                node.node_id
            )));
        }
        for choice in &node.choices {
            queue.push_back(choice.next_node_id.as_str());
        }
        if let Some(fallback) = &node.fallback {
            if let Some(next) = &fallback.next_node_id {
                queue.push_back(next.as_str());
            }
        }
    }

    for executor in &pack.fallback_executors {
        if let Some(next) = &executor.next_node_id {
            if visited.insert(next.as_str()) {
                // Executor targets join the walk for the dead-end check.
                if let Some(node) = pack.node(next) {
                    if !node.is_end && node.choices.is_empty() {
                        return Err(Error::pack_invalid(format!(
                            "reachable non-end node '{}' has no choices",
                            node.node_id
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}
