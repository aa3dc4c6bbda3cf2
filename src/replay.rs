//! Replay report builder.
//!
//! Aggregates a session's ActionLog into the post-run summary: key
//! decisions, fallback counts by reason, the walked story path, a state
//! timeline and the run summary with the frozen ending.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::state::normalize_state;
use crate::store::StoreData;
use crate::types::{Result, SessionId};

/// Build the replay report for one session from its action logs.
pub fn build_report(data: &StoreData, session_id: &SessionId) -> Result<Value> {
    let session = data.session(session_id)?;
    let logs = data.session_action_logs(session_id);

    let mut key_decisions: Vec<Value> = Vec::new();
    let mut fallback_summary: BTreeMap<String, u64> = BTreeMap::new();
    let mut story_path: Vec<Value> = Vec::new();
    let mut state_timeline: Vec<Value> = Vec::new();
    let mut fallback_steps = 0u64;
    let mut triggered_events_count = 0u64;

    for (idx, log) in logs.iter().enumerate() {
        let step = idx as u64 + 1;
        if log.story_node_id.is_some() || log.story_choice_id.is_some() {
            story_path.push(serde_json::json!({
                "step": step,
                "node_id": log.story_node_id,
                "choice_id": log.story_choice_id,
            }));
        }
        if log.key_decision {
            key_decisions.push(serde_json::json!({
                "step_index": step,
                "final_action": log.final_action,
                "user_raw_input": log.user_raw_input,
            }));
        }
        if log.fallback_used {
            fallback_steps += 1;
            for reason in &log.fallback_reasons {
                *fallback_summary.entry(reason.clone()).or_insert(0) += 1;
            }
        }
        for rule in &log.matched_rules {
            if rule.get("type").and_then(Value::as_str) == Some("runtime_event") {
                triggered_events_count += 1;
            }
        }
        state_timeline.push(serde_json::json!({
            "step": step,
            "delta": log.state_delta,
            "state_after": log.state_after,
        }));
    }

    let run_state = normalize_state(&session.state_json).run_state;
    let total_steps = logs.len() as u64;
    let fallback_rate = if total_steps > 0 {
        (fallback_steps as f64 / total_steps as f64 * 10_000.0).round() / 10_000.0
    } else {
        0.0
    };

    Ok(serde_json::json!({
        "session_id": session_id.to_string(),
        "total_steps": total_steps,
        "key_decisions": key_decisions,
        "fallback_summary": fallback_summary,
        "story_path": story_path,
        "state_timeline": state_timeline,
        "run_summary": {
            "ending_id": run_state.ending_id,
            "ending_outcome": run_state.ending_outcome,
            "total_steps": total_steps,
            "triggered_events_count": triggered_events_count,
            "fallback_rate": fallback_rate,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ActionLogRow, SessionRow, SessionStatus};
    use crate::types::ActionLogId;
    use chrono::Utc;

    fn log(session_id: &SessionId, choice: &str, fallback: bool) -> ActionLogRow {
        ActionLogRow {
            id: ActionLogId::new(),
            session_id: session_id.clone(),
            story_node_id: Some("n1".to_string()),
            story_choice_id: Some(choice.to_string()),
            player_input: String::new(),
            user_raw_input: None,
            proposed_action: serde_json::json!({}),
            final_action: serde_json::json!({"choice_id": choice}),
            fallback_used: fallback,
            fallback_reasons: if fallback {
                vec!["NO_INPUT".to_string()]
            } else {
                vec![]
            },
            action_confidence: None,
            key_decision: false,
            classification: serde_json::json!({}),
            state_before: serde_json::json!({}),
            state_after: serde_json::json!({}),
            state_delta: serde_json::json!({"money": 1}),
            matched_rules: vec![serde_json::json!({"type": "runtime_event", "event_id": "ev"})],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_aggregates_logs() {
        let mut data = StoreData::default();
        let session_id = SessionId::new();
        data.sessions.insert(
            session_id.clone(),
            SessionRow {
                id: session_id.clone(),
                status: SessionStatus::Ended,
                story_id: Some("s1".to_string()),
                story_version: Some(1),
                story_node_id: Some("n2".to_string()),
                state_json: serde_json::json!({"run_state": {"ending_id": "e1", "ending_outcome": "success"}}),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        data.action_logs.push(log(&session_id, "c1", false));
        data.action_logs.push(log(&session_id, "__fallback__", true));

        let report = build_report(&data, &session_id).unwrap();
        assert_eq!(report["total_steps"], 2);
        assert_eq!(report["fallback_summary"]["NO_INPUT"], 1);
        assert_eq!(report["run_summary"]["ending_id"], "e1");
        assert_eq!(report["run_summary"]["triggered_events_count"], 2);
        assert_eq!(report["run_summary"]["fallback_rate"], 0.5);
        assert_eq!(report["story_path"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_session_report() {
        let mut data = StoreData::default();
        let session_id = SessionId::new();
        data.sessions.insert(
            session_id.clone(),
            SessionRow {
                id: session_id.clone(),
                status: SessionStatus::Active,
                story_id: None,
                story_version: None,
                story_node_id: None,
                state_json: serde_json::json!({}),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        let report = build_report(&data, &session_id).unwrap();
        assert_eq!(report["total_steps"], 0);
        assert_eq!(report["run_summary"]["fallback_rate"], 0.0);
    }
}
