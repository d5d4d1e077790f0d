//! Reads a conversation state from stdin and prints the bandit's choice.
//!
//! Run with: echo '{"conversationId":"c1","intent":"billing"}' | cargo run -p dialoglern-bandits --example decide

use std::io::{self, Read};
use std::sync::Arc;

use dialoglern_bandits::{BanditConfig, ContextualBandit};
use dialoglern_core::{Action, ActionAnalysis, ActionSpace, ConversationState, MemoryStorage, Policy};
use serde::Serialize;

#[derive(Serialize)]
struct DecisionRecord {
    policy: String,
    context_key: String,
    exploration_rate: f64,
    decision: Action,
    analysis: ActionAnalysis,
}

fn demo_actions() -> ActionSpace {
    [
        Action::new("ask_question", "ask", "Could you tell me a bit more?"),
        Action::new("offer_help", "help", "Let me look into that for you."),
        Action::new("end_call", "end", "Thanks for calling, goodbye."),
    ]
    .into_iter()
    .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;

    let state = if input.trim().is_empty() {
        ConversationState::new("demo")
    } else {
        serde_json::from_str::<ConversationState>(&input)?
    };

    let bandit = ContextualBandit::new(Arc::new(MemoryStorage::new()), BanditConfig::default())
        .with_actions(demo_actions());

    // A little history so the ranking is not a three-way tie.
    let help = Action::new("offer_help", "help", "");
    bandit.update(&state, &help, 0.8).await?;
    bandit.update(&state, &help, 0.4).await?;

    let exploration_rate = bandit.exploration_rate();
    let decision = bandit.select_action(&state).await?;
    let analysis = bandit.analyze_action(&state).await?;

    let record = DecisionRecord {
        policy: bandit.name().to_string(),
        context_key: state.context_key(),
        exploration_rate,
        decision,
        analysis,
    };

    serde_json::to_writer_pretty(io::stdout(), &record)?;
    println!();

    Ok(())
}
