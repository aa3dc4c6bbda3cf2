//! Fabula runtime demo driver — main entry point.
//!
//! Seeds a story pack from disk, opens a session and steps it from stdin.
//! Lines are free player input; `/choice <id>` clicks a choice, `/quit`
//! exits. Runs against the deterministic provider with `--env test`.

use std::io::{BufRead, Write};

use clap::Parser;

use fabula_core::session::StoryRuntime;
use fabula_core::types::{Config, Env};

#[derive(Debug, Parser)]
#[command(name = "fabula-runtime", about = "Interactive-story runtime demo driver")]
struct Args {
    /// Path to a v1.0 story pack JSON file.
    #[arg(long)]
    pack: std::path::PathBuf,

    /// Environment: test selects the deterministic provider.
    #[arg(long, default_value = "test")]
    env: String,
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = Config::default();
    config.env = match args.env.as_str() {
        "test" => Env::Test,
        "dev" => Env::Dev,
        _ => Env::Prod,
    };
    fabula_core::observability::init_tracing(&config.observability);

    let pack_text = std::fs::read_to_string(&args.pack)?;
    let pack_json: serde_json::Value = serde_json::from_str(&pack_text)?;
    let story_id = pack_json
        .get("story_id")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("demo")
        .to_string();
    let version = pack_json
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(1) as u32;

    let runtime = StoryRuntime::init(config)?;
    runtime.publish_story(&story_id, version, pack_json, true)?;
    let created = runtime.create_session(&story_id, None)?;
    tracing::info!(session_id = %created.session_id, story_id, "session started");

    print_node(&created.current_node);
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        let (choice_id, player_input) = match line.strip_prefix("/choice ") {
            Some(choice) => (Some(choice.trim()), None),
            None => (None, Some(line)),
        };

        match runtime.step_session(&created.session_id, choice_id, player_input, None, &fabula_core::llm::NoopStageEmitter) {
            Ok(step) => {
                println!("{}", step.narrative_text);
                print_node(&step.current_node);
                if step.run_ended {
                    println!(
                        "[run ended: {} / {}]",
                        step.ending_id.as_deref().unwrap_or("-"),
                        step.ending_outcome.as_deref().unwrap_or("-")
                    );
                    break;
                }
            }
            Err(error) => {
                println!("[{} {}] {}", error.http_status(), error.code(), error);
            }
        }
    }
    Ok(())
}

fn print_node(node: &Option<fabula_core::session::CurrentNodeView>) {
    let Some(node) = node else {
        return;
    };
    if !node.scene_brief.is_empty() {
        println!("-- {}", node.scene_brief);
    }
    for choice in &node.choices {
        let lock = choice
            .locked_reason
            .as_ref()
            .map(|r| format!(" [locked: {}]", r.message))
            .unwrap_or_default();
        println!("   ({}) {}{}", choice.id, choice.text, lock);
    }
}
