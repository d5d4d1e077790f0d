use dialoglern_bandits::{BanditConfig, ContextualBandit};
use dialoglern_core::{Action, ActionSpace, ConversationState, MemoryStorage, Policy};
use std::sync::Arc;
use std::time::Instant;

const CONTEXTS: usize = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let actions: ActionSpace = (0..8)
        .map(|i| Action::new(format!("action_{i}"), format!("a{i}"), ""))
        .collect();
    let bandit = ContextualBandit::new(Arc::new(MemoryStorage::new()), BanditConfig::default())
        .with_actions(actions.clone());

    let state = ConversationState::new("bench").with_intent("bench");
    let action = Action::new("action_0", "a0", "");
    let iterations: u32 = 100_000;

    // Warmup
    for _ in 0..1000 {
        bandit.update(&state, &action, 1.0).await?;
    }

    let start = Instant::now();
    for _ in 0..iterations {
        bandit.update(&state, &action, 1.0).await?;
    }
    let duration = start.elapsed();
    println!("Update on EXISTING arm took: {:?}", duration);
    println!("Average per call: {:?}", duration / iterations);

    let start = Instant::now();
    for _ in 0..iterations {
        bandit.select_action(&state).await?;
    }
    let duration = start.elapsed();
    println!("Select over {} actions took: {:?}", actions.len(), duration);
    println!("Average per call: {:?}", duration / iterations);

    // Every context starts cold, so each update creates two storage keys.
    let start = Instant::now();
    for i in 0..CONTEXTS {
        let state = ConversationState::new("bench").with_feature("slot", format!("s{i}"));
        bandit.update(&state, &action, 1.0).await?;
    }
    let duration = start.elapsed();
    println!("Update on NEW contexts (0..{}) took: {:?}", CONTEXTS, duration);
    println!("Average per call: {:?}", duration / u32::try_from(CONTEXTS)?);

    Ok(())
}
