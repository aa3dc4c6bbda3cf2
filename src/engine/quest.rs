//! Quest engine — stage/milestone progression from a step's facts.
//!
//! Only the *current* stage of each active quest is evaluated, which is what
//! keeps later-stage triggers from firing early. Milestones are one-shot;
//! stage and completion rewards apply exactly once and feed the step delta.

use crate::engine::{trigger_matches, MatchedRule, QuestRuleKind, StepFacts};
use crate::pack::{Effects, QuestDef, StoryPack};
use crate::state::{
    apply_effects, MilestoneProgress, QuestEvent, QuestEventType, QuestProgress, QuestState,
    SessionState, StageProgress,
};

/// Outcome of one quest pass over a step.
#[derive(Debug, Clone, Default)]
pub struct QuestAdvance {
    /// Sum of all rewards applied during the pass.
    pub rewards_delta: Effects,
    pub matched_rules: Vec<MatchedRule>,
    /// True when any milestone/stage/quest progressed this step.
    pub progressed: bool,
}

/// Build the initial quest bookkeeping for a fresh session.
///
/// Every declared quest gets a progress record pointing at its first stage;
/// quests with `auto_activate` start in `active_quests`.
pub fn init_quest_state(quests: &[QuestDef]) -> QuestState {
    let mut state = QuestState::default();
    for quest in quests {
        let mut progress = QuestProgress {
            current_stage_id: quest
                .stages
                .first()
                .map(|s| s.stage_id.clone())
                .unwrap_or_default(),
            ..QuestProgress::default()
        };
        for stage in &quest.stages {
            let mut stage_progress = StageProgress::default();
            for milestone in &stage.milestones {
                stage_progress
                    .milestones
                    .insert(milestone.milestone_id.clone(), MilestoneProgress::default());
            }
            progress.stages.insert(stage.stage_id.clone(), stage_progress);
        }
        state.quests.insert(quest.quest_id.clone(), progress);
        if quest.auto_activate {
            state.active_quests.push(quest.quest_id.clone());
        }
    }
    state
}

/// Advance every active quest against the step facts, applying rewards.
///
/// Stage completion activates the next declared stage; completing the last
/// stage moves the quest from `active_quests` to `completed_quests`.
pub fn advance_quests(
    pack: &StoryPack,
    state: &mut SessionState,
    facts: &StepFacts<'_>,
    step_index: u64,
) -> QuestAdvance {
    let mut outcome = QuestAdvance::default();
    let active: Vec<String> = state.quest_state.active_quests.clone();

    for quest_id in active {
        let Some(quest) = pack.quest(&quest_id) else {
            continue;
        };
        advance_one_quest(quest, state, facts, step_index, &mut outcome);
    }
    outcome
}

fn advance_one_quest(
    quest: &QuestDef,
    state: &mut SessionState,
    facts: &StepFacts<'_>,
    step_index: u64,
    outcome: &mut QuestAdvance,
) {
    let current_stage_id = match state.quest_state.quests.get(&quest.quest_id) {
        Some(progress) => progress.current_stage_id.clone(),
        None => return,
    };
    let Some(stage) = quest.stage(&current_stage_id) else {
        return;
    };

    // One-shot milestone pass over the current stage only.
    let mut newly_done: Vec<(String, Option<Effects>)> = Vec::new();
    for milestone in &stage.milestones {
        let already_done = state
            .quest_state
            .quests
            .get(&quest.quest_id)
            .and_then(|q| q.stages.get(&current_stage_id))
            .and_then(|s| s.milestones.get(&milestone.milestone_id))
            .map(|m| m.done)
            .unwrap_or(false);
        if already_done {
            continue;
        }
        if trigger_matches(&milestone.when, facts, state) {
            newly_done.push((milestone.milestone_id.clone(), milestone.rewards));
        }
    }

    for (milestone_id, rewards) in newly_done {
        mark_milestone_done(state, &quest.quest_id, &current_stage_id, &milestone_id, step_index);
        if let Some(rewards) = rewards {
            apply_rewards(state, &rewards, outcome);
        }
        record_quest_event(
            state,
            QuestEventType::MilestoneCompleted,
            &quest.quest_id,
            Some(&current_stage_id),
            Some(&milestone_id),
            step_index,
        );
        outcome.matched_rules.push(MatchedRule::QuestProgress {
            quest_id: quest.quest_id.clone(),
            kind: QuestRuleKind::MilestoneCompleted,
            stage_id: Some(current_stage_id.clone()),
            milestone_id: Some(milestone_id),
            rewards,
        });
        outcome.progressed = true;
    }

    let stage_done = state
        .quest_state
        .quests
        .get(&quest.quest_id)
        .and_then(|q| q.stages.get(&current_stage_id))
        .map(|s| !s.milestones.is_empty() && s.milestones.values().all(|m| m.done))
        .unwrap_or(false);
    if !stage_done {
        return;
    }

    let already_completed = state
        .quest_state
        .quests
        .get(&quest.quest_id)
        .and_then(|q| q.stages.get(&current_stage_id))
        .map(|s| s.done)
        .unwrap_or(false);
    if already_completed {
        return;
    }

    // Stage completes once: rewards, witness, then activate the next stage.
    if let Some(progress) = state.quest_state.quests.get_mut(&quest.quest_id) {
        if let Some(stage_progress) = progress.stages.get_mut(&current_stage_id) {
            stage_progress.done = true;
        }
    }
    if let Some(rewards) = &stage.stage_rewards {
        apply_rewards(state, rewards, outcome);
    }
    record_quest_event(
        state,
        QuestEventType::StageCompleted,
        &quest.quest_id,
        Some(&current_stage_id),
        None,
        step_index,
    );
    outcome.matched_rules.push(MatchedRule::QuestProgress {
        quest_id: quest.quest_id.clone(),
        kind: QuestRuleKind::StageCompleted,
        stage_id: Some(current_stage_id.clone()),
        milestone_id: None,
        rewards: stage.stage_rewards,
    });
    outcome.progressed = true;

    match quest.next_stage(&current_stage_id) {
        Some(next_stage) => {
            if let Some(progress) = state.quest_state.quests.get_mut(&quest.quest_id) {
                progress.current_stage_id = next_stage.stage_id.clone();
            }
            record_quest_event(
                state,
                QuestEventType::StageActivated,
                &quest.quest_id,
                Some(&next_stage.stage_id),
                None,
                step_index,
            );
        }
        None => {
            complete_quest(quest, state, step_index, outcome);
        }
    }
}

fn complete_quest(
    quest: &QuestDef,
    state: &mut SessionState,
    step_index: u64,
    outcome: &mut QuestAdvance,
) {
    let quest_state = &mut state.quest_state;
    quest_state.active_quests.retain(|q| q != &quest.quest_id);
    if !quest_state.completed_quests.iter().any(|q| q == &quest.quest_id) {
        quest_state.completed_quests.push(quest.quest_id.clone());
    }
    if let Some(rewards) = &quest.completion_rewards {
        apply_rewards(state, rewards, outcome);
    }
    record_quest_event(
        state,
        QuestEventType::QuestCompleted,
        &quest.quest_id,
        None,
        None,
        step_index,
    );
    outcome.matched_rules.push(MatchedRule::QuestProgress {
        quest_id: quest.quest_id.clone(),
        kind: QuestRuleKind::QuestCompleted,
        stage_id: None,
        milestone_id: None,
        rewards: quest.completion_rewards,
    });
    outcome.progressed = true;
}

fn mark_milestone_done(
    state: &mut SessionState,
    quest_id: &str,
    stage_id: &str,
    milestone_id: &str,
    step_index: u64,
) {
    if let Some(progress) = state.quest_state.quests.get_mut(quest_id) {
        if let Some(stage_progress) = progress.stages.get_mut(stage_id) {
            let entry = stage_progress
                .milestones
                .entry(milestone_id.to_string())
                .or_default();
            entry.done = true;
            entry.at_step = Some(step_index);
        }
    }
}

fn apply_rewards(state: &mut SessionState, rewards: &Effects, outcome: &mut QuestAdvance) {
    apply_effects(state, rewards);
    outcome.rewards_delta.energy += rewards.energy;
    outcome.rewards_delta.money += rewards.money;
    outcome.rewards_delta.knowledge += rewards.knowledge;
    outcome.rewards_delta.affection += rewards.affection;
}

fn record_quest_event(
    state: &mut SessionState,
    event_type: QuestEventType,
    quest_id: &str,
    stage_id: Option<&str>,
    milestone_id: Option<&str>,
    at_step: u64,
) {
    state.quest_state.recent_events.push(QuestEvent {
        event_type,
        quest_id: quest_id.to_string(),
        stage_id: stage_id.map(str::to_string),
        milestone_id: milestone_id.map(str::to_string),
        at_step,
    });
}
