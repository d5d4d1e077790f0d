#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Reward calculation for conversation policies.
//!
//! Turns raw user feedback and terminal conversation outcomes into scalar
//! rewards in `[-1, 1]`. Immediate rewards score a single turn; delayed
//! rewards score the whole conversation and are spread back over its turns
//! with [`RewardCalculator::discount`] and [`RewardCalculator::combine`].

use dialoglern_core::{Action, ConversationState, Sentiment};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

// Immediate reward constants
/// Added when the user reacts positively to a turn
const POSITIVE_SENTIMENT_REWARD: f64 = 0.5;
/// Subtracted when the user reacts negatively to a turn
const NEGATIVE_SENTIMENT_PENALTY: f64 = 0.5;
/// Turn count above which every further turn is penalised
const LONG_CONVERSATION_TURNS: u32 = 20;
const LONG_CONVERSATION_PENALTY: f64 = 0.1;

// Delayed reward constants
const SUCCESS_REWARD: f64 = 1.0;
const FAILURE_PENALTY: f64 = 1.0;
/// Neutral point of the user satisfaction score (0.0 to 1.0)
const SATISFACTION_BASELINE: f64 = 0.5;
const SATISFACTION_WEIGHT: f64 = 0.5;
const GOAL_ACHIEVED_BONUS: f64 = 0.5;
/// Call duration in seconds above which the outcome is penalised
const LONG_CALL_SECONDS: f64 = 600.0;
const LONG_CALL_PENALTY: f64 = 0.2;

// Fallback constants
/// Fallback timestamp when formatting fails
const FALLBACK_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

#[derive(Debug, Error)]
pub enum RewardError {
    #[error("No reward function registered under '{0}'")]
    UnknownFunction(String),
}

pub type Result<T> = std::result::Result<T, RewardError>;

/// User reaction to a single agent turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Feedback {
    pub fn with_sentiment(sentiment: Sentiment) -> Self {
        Self {
            sentiment: Some(sentiment),
            ..Self::default()
        }
    }
}

/// Measurements taken at the end of a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeMetrics {
    /// Call duration in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// User satisfaction from 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_satisfaction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_achieved: Option<bool>,
    /// Adapter-specific metrics that the default reward ignores
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Terminal result of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<OutcomeMetrics>,
}

impl ConversationOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            metrics: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: OutcomeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardType {
    Immediate,
    Delayed,
}

/// A reward observation with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewardSignal {
    /// Always within `[-1, 1]`
    pub value: f64,
    pub r#type: RewardType,
    pub source: String,
    /// Timestamp when the signal was created
    pub ts: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl RewardSignal {
    fn new(value: f64, r#type: RewardType, source: impl Into<String>) -> Self {
        Self {
            value: clamp_reward(value),
            r#type,
            source: source.into(),
            ts: iso8601_now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn immediate(value: f64, source: impl Into<String>) -> Self {
        Self::new(value, RewardType::Immediate, source)
    }

    pub fn delayed(value: f64, source: impl Into<String>) -> Self {
        Self::new(value, RewardType::Delayed, source)
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardConfig {
    pub immediate_weight: f64,
    pub delayed_weight: f64,
    /// Per-step discount applied to delayed rewards
    pub discount_factor: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            immediate_weight: 0.3,
            delayed_weight: 0.7,
            discount_factor: 0.99,
        }
    }
}

/// User-supplied reward function, invoked by name.
pub type RewardFn = Arc<dyn Fn(&ConversationState, &Action, &Feedback) -> f64 + Send + Sync>;

/// Computes normalised rewards from feedback and outcomes.
#[derive(Clone, Default)]
pub struct RewardCalculator {
    config: RewardConfig,
    custom: HashMap<String, RewardFn>,
}

impl std::fmt::Debug for RewardCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.custom.keys().collect();
        names.sort();
        f.debug_struct("RewardCalculator")
            .field("config", &self.config)
            .field("custom", &names)
            .finish()
    }
}

impl RewardCalculator {
    pub fn new(config: RewardConfig) -> Self {
        Self {
            config,
            custom: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    /// Scores one turn from the user's reaction to it.
    #[must_use]
    pub fn calculate_immediate(
        &self,
        state: &ConversationState,
        _action: &Action,
        feedback: &Feedback,
    ) -> f64 {
        let mut reward = 0.0;
        match feedback.sentiment {
            Some(Sentiment::Positive) => reward += POSITIVE_SENTIMENT_REWARD,
            Some(Sentiment::Negative) => reward -= NEGATIVE_SENTIMENT_PENALTY,
            Some(Sentiment::Neutral) | None => {}
        }
        if state.turn_number > LONG_CONVERSATION_TURNS {
            reward -= LONG_CONVERSATION_PENALTY;
        }
        clamp_reward(reward)
    }

    /// Scores the whole conversation from its terminal outcome.
    #[must_use]
    pub fn calculate_delayed(&self, outcome: &ConversationOutcome) -> f64 {
        let mut reward = if outcome.success {
            SUCCESS_REWARD
        } else {
            -FAILURE_PENALTY
        };
        if let Some(metrics) = &outcome.metrics {
            if let Some(satisfaction) = metrics.user_satisfaction.filter(|s| s.is_finite()) {
                reward += (satisfaction - SATISFACTION_BASELINE) * SATISFACTION_WEIGHT;
            }
            if metrics.goal_achieved == Some(true) {
                reward += GOAL_ACHIEVED_BONUS;
            }
            if metrics.duration.is_some_and(|d| d > LONG_CALL_SECONDS) {
                reward -= LONG_CALL_PENALTY;
            }
        }
        clamp_reward(reward)
    }

    /// Weighted sum of immediate and delayed signals, clamped to `[-1, 1]`.
    #[must_use]
    pub fn combine(&self, signals: &[RewardSignal]) -> f64 {
        let total: f64 = signals
            .iter()
            .map(|s| match s.r#type {
                RewardType::Immediate => s.value * self.config.immediate_weight,
                RewardType::Delayed => s.value * self.config.delayed_weight,
            })
            .sum();
        clamp_reward(total)
    }

    /// `reward * discount_factor^steps`.
    #[must_use]
    pub fn discount(&self, reward: f64, steps: usize) -> f64 {
        let steps = i32::try_from(steps).unwrap_or(i32::MAX);
        reward * self.config.discount_factor.powi(steps)
    }

    pub fn register<F>(&mut self, name: impl Into<String>, reward_fn: F)
    where
        F: Fn(&ConversationState, &Action, &Feedback) -> f64 + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(reward_fn));
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Invokes a registered reward function; the result is clamped.
    pub fn calculate_custom(
        &self,
        name: &str,
        state: &ConversationState,
        action: &Action,
        feedback: &Feedback,
    ) -> Result<f64> {
        let reward_fn = self
            .custom
            .get(name)
            .ok_or_else(|| RewardError::UnknownFunction(name.to_string()))?;
        Ok(clamp_reward(reward_fn(state, action, feedback)))
    }
}

/// Clamps to `[-1, 1]`; NaN becomes 0.
pub fn clamp_reward(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

/// Success/failure counts aggregated over finished conversations.
#[derive(Debug, Default, Clone, Serialize)]
pub struct OutcomeStatistics {
    /// Total number of outcomes (successes + failures).
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub total_reward: f64,
}

impl OutcomeStatistics {
    pub fn record(&mut self, outcome: &ConversationOutcome, reward: f64) {
        self.total += 1;
        if outcome.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        if reward.is_finite() {
            self.total_reward += reward;
        }
    }

    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.successes as f64 / self.total as f64
        }
    }

    /// Calculate average reward.
    #[must_use]
    pub fn average_reward(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.total_reward / self.total as f64
        }
    }
}

fn iso8601_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| FALLBACK_TIMESTAMP.to_string())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(turn: u32) -> ConversationState {
        let mut s = ConversationState::new("c1");
        s.turn_number = turn;
        s
    }

    fn ask() -> Action {
        Action::new("ask_question", "ask", "")
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn immediate_reward_follows_sentiment_and_length() {
        let calc = RewardCalculator::default();
        let pos = Feedback::with_sentiment(Sentiment::Positive);
        let neg = Feedback::with_sentiment(Sentiment::Negative);

        assert!(close(calc.calculate_immediate(&state(1), &ask(), &pos), 0.5));
        assert!(close(calc.calculate_immediate(&state(1), &ask(), &neg), -0.5));
        assert!(close(calc.calculate_immediate(&state(20), &ask(), &Feedback::default()), 0.0));
        assert!(close(calc.calculate_immediate(&state(21), &ask(), &neg), -0.6));
    }

    #[test]
    fn delayed_reward_combines_metrics() {
        let calc = RewardCalculator::default();
        assert!(close(calc.calculate_delayed(&ConversationOutcome::success()), 1.0));
        assert!(close(calc.calculate_delayed(&ConversationOutcome::failure()), -1.0));

        let slow_failure = ConversationOutcome::failure().with_metrics(OutcomeMetrics {
            duration: Some(900.0),
            user_satisfaction: Some(0.9),
            goal_achieved: Some(true),
            extra: BTreeMap::new(),
        });
        // -1 + 0.2 + 0.5 - 0.2
        assert!(close(calc.calculate_delayed(&slow_failure), -0.5));
    }

    #[test]
    fn rewards_stay_in_bounds() {
        let calc = RewardCalculator::default();
        let best = ConversationOutcome::success().with_metrics(OutcomeMetrics {
            duration: Some(10.0),
            user_satisfaction: Some(1.0),
            goal_achieved: Some(true),
            extra: BTreeMap::new(),
        });
        let worst = ConversationOutcome::failure().with_metrics(OutcomeMetrics {
            duration: Some(10_000.0),
            user_satisfaction: Some(0.0),
            goal_achieved: Some(false),
            extra: BTreeMap::new(),
        });
        assert!(close(calc.calculate_delayed(&best), 1.0));
        assert!(close(calc.calculate_delayed(&worst), -1.0));

        let signals = vec![
            RewardSignal::immediate(5.0, "test"),
            RewardSignal::delayed(5.0, "test"),
            RewardSignal::delayed(5.0, "test"),
        ];
        assert!(signals.iter().all(|s| s.value <= 1.0));
        assert!(close(calc.combine(&signals), 1.0));

        for turn in [0, 21, 500] {
            for sentiment in [Sentiment::Positive, Sentiment::Negative, Sentiment::Neutral] {
                let r = calc.calculate_immediate(
                    &state(turn),
                    &ask(),
                    &Feedback::with_sentiment(sentiment),
                );
                assert!((-1.0..=1.0).contains(&r));
            }
        }
    }

    #[test]
    fn combine_weights_by_signal_type() {
        let calc = RewardCalculator::default();
        let total = calc.combine(&[
            RewardSignal::immediate(0.2, "turn"),
            RewardSignal::delayed(calc.discount(1.0, 1), "outcome"),
        ]);
        assert!(close(total, 0.3 * 0.2 + 0.7 * 0.99));
    }

    #[test]
    fn discount_is_geometric() {
        let calc = RewardCalculator::default();
        assert!(close(calc.discount(1.0, 0), 1.0));
        assert!(close(calc.discount(1.0, 2), 0.9801));
        assert!(close(calc.discount(-0.5, 1), -0.495));
    }

    #[test]
    fn custom_functions_are_invoked_by_name() {
        let mut calc = RewardCalculator::default();
        calc.register("prefers_short", |state, _action, _feedback| {
            -f64::from(state.turn_number)
        });

        assert!(calc.has_function("prefers_short"));
        let r = calc
            .calculate_custom("prefers_short", &state(3), &ask(), &Feedback::default())
            .expect("registered");
        assert!(close(r, -1.0));

        let err = calc
            .calculate_custom("missing", &state(3), &ask(), &Feedback::default())
            .unwrap_err();
        assert!(matches!(err, RewardError::UnknownFunction(ref n) if n == "missing"));
    }

    #[test]
    fn outcome_json_accepts_extra_metrics() {
        let outcome: ConversationOutcome = serde_json::from_value(json!({
            "success": true,
            "metrics": {"duration": 120, "userSatisfaction": 0.8, "goalAchieved": false, "transfers": 1}
        }))
        .expect("outcome should deserialize");
        let metrics = outcome.metrics.expect("metrics");
        assert_eq!(metrics.extra.get("transfers"), Some(&json!(1)));
        assert_eq!(metrics.goal_achieved, Some(false));
    }

    #[test]
    fn outcome_statistics_track_rates() {
        let mut stats = OutcomeStatistics::default();
        stats.record(&ConversationOutcome::success(), 1.0);
        stats.record(&ConversationOutcome::success(), 0.5);
        stats.record(&ConversationOutcome::failure(), -1.0);
        assert_eq!(stats.total, 3);
        assert!(close(stats.success_rate(), 2.0 / 3.0));
        assert!(close(stats.average_reward(), 0.5 / 3.0));
        assert!(close(OutcomeStatistics::default().average_reward(), 0.0));
    }
}
