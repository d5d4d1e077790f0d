//! Shows how one conversation outcome is spread over its turns.
//!
//! Run with: cargo run -p dialoglern-feedback --example credit_assignment

use dialoglern_feedback::{
    ConversationOutcome, OutcomeMetrics, RewardCalculator, RewardConfig, RewardSignal,
};

fn main() {
    let calc = RewardCalculator::new(RewardConfig::default());

    let outcome = ConversationOutcome::success().with_metrics(OutcomeMetrics {
        duration: Some(240.0),
        user_satisfaction: Some(0.8),
        goal_achieved: Some(true),
        ..OutcomeMetrics::default()
    });
    let delayed = calc.calculate_delayed(&outcome);
    println!("Delayed reward for the outcome: {delayed:.3}\n");

    let immediate = [("ask_question", 0.1), ("offer_help", 0.2), ("end_call", 0.3)];
    let last = immediate.len() - 1;

    println!("{:<14} {:>9} {:>10} {:>8}", "action", "immediate", "discounted", "total");
    for (index, (action, reward)) in immediate.iter().enumerate() {
        let discounted = calc.discount(delayed, last - index);
        let total = calc.combine(&[
            RewardSignal::immediate(*reward, "turn"),
            RewardSignal::delayed(discounted, "outcome"),
        ]);
        println!("{action:<14} {reward:>9.3} {discounted:>10.4} {total:>8.5}");
    }
}
