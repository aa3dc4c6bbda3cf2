//! Step pipeline throughput — deterministic provider, button-click path.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;

use fabula_core::session::StoryRuntime;
use fabula_core::types::Config;

fn bench_pack() -> serde_json::Value {
    json!({
        "story_id": "bench",
        "version": 1,
        "title": "Bench",
        "start_node_id": "n1",
        "nodes": [
            {
                "node_id": "n1",
                "scene_brief": "Loop",
                "is_end": false,
                "choices": [
                    {
                        "choice_id": "c1",
                        "display_text": "Study",
                        "action": {"action_id": "study", "params": {}},
                        "effects": {"knowledge": 1},
                        "next_node_id": "n1"
                    },
                    {
                        "choice_id": "c2",
                        "display_text": "Rest",
                        "action": {"action_id": "rest", "params": {}},
                        "effects": {"energy": 1},
                        "next_node_id": "n1"
                    }
                ]
            }
        ],
        "run_config": {"max_days": 100000, "max_steps": 100000, "default_timeout_outcome": "neutral"}
    })
}

fn step_throughput(c: &mut Criterion) {
    let runtime = StoryRuntime::init(Config::for_tests()).expect("runtime");
    runtime
        .publish_story("bench", 1, bench_pack(), true)
        .expect("publish");

    c.bench_function("step_button_click", |b| {
        b.iter_batched(
            || {
                runtime
                    .create_session("bench", None)
                    .expect("session")
                    .session_id
            },
            |session_id| {
                runtime
                    .step(&session_id, Some("c1"), None, None)
                    .expect("step")
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("step_free_input_rule_mapped", |b| {
        let mut pack = bench_pack();
        pack["story_id"] = json!("bench_rule");
        pack["nodes"][0]["intents"] = json!([{
            "intent_id": "I_STUDY",
            "alias_choice_id": "c1",
            "patterns": ["study"]
        }]);
        runtime
            .publish_story("bench_rule", 1, pack, true)
            .expect("publish");
        b.iter_batched(
            || {
                runtime
                    .create_session("bench_rule", None)
                    .expect("session")
                    .session_id
            },
            |session_id| {
                runtime
                    .step(&session_id, None, Some("study tonight"), None)
                    .expect("step")
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, step_throughput);
criterion_main!(benches);
