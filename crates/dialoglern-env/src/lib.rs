#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Single-conversation step loop.
//!
//! - `reset(state)` starts an episode
//! - `step(action, response)` appends turns and scores the exchange
//! - `process_outcome(outcome)` spreads the terminal reward backwards over
//!   every step of the episode and feeds it into the policy
//!
//! An [`Environment`] owns one conversation at a time and is not meant to be
//! shared between conversations.

use dialoglern_core::{
    log_debug, Action, ConversationState, ConversationTurn, FeaturePipeline, Policy, PolicyError,
    Sentiment,
};
use dialoglern_feedback::{
    clamp_reward, ConversationOutcome, Feedback, RewardCalculator, RewardSignal,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Parameter an action may carry to override the spoken agent text.
pub const TEXT_PARAMETER: &str = "text";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("environment has not been reset")]
    NotReset,
    #[error("episode already finished; call reset first")]
    EpisodeFinished,
    #[error("outcome crediting was interrupted; retry process_outcome or reset")]
    CreditPending,
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, EnvError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentConfig {
    /// The episode ends once `turn_number` reaches this value.
    pub max_turns: u32,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self { max_turns: 20 }
    }
}

/// What the user said in reply to an agent turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Externally scored immediate reward; replaces the calculated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl UserResponse {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sentiment(mut self, sentiment: Sentiment) -> Self {
        self.sentiment = Some(sentiment);
        self
    }

    #[must_use]
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    #[must_use]
    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    fn feedback(&self) -> Feedback {
        Feedback {
            sentiment: self.sentiment,
            text: Some(self.text.clone()),
            metadata: self.metadata.clone(),
        }
    }
}

/// Result of a single environment step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub next_state: ConversationState,
    /// Immediate reward of this step, in `[-1, 1]`.
    pub reward: f64,
    pub done: bool,
    pub info: StepInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInfo {
    pub action_type: String,
    pub turn_number: u32,
    /// Termination reason if done.
    pub termination_reason: Option<String>,
    /// Extractors that failed while deriving features for the next state.
    pub extractor_errors: Vec<String>,
}

/// One recorded `(state, action, reward)` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeStep {
    /// State the action was chosen in.
    pub state: ConversationState,
    pub action: Action,
    pub immediate_reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepCredit {
    pub index: usize,
    pub action_type: String,
    pub immediate_reward: f64,
    /// Delayed reward after discounting by the distance to the outcome.
    pub discounted_reward: f64,
    /// Value passed to `Policy::update`.
    pub total_reward: f64,
}

/// Rewards credited by [`Environment::process_outcome`], chronological.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditReport {
    pub delayed_reward: f64,
    pub credits: Vec<StepCredit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub conversation_id: String,
    pub turns: u32,
    pub actions: Vec<String>,
    pub total_reward: f64,
    pub final_state: ConversationState,
}

pub struct Environment {
    policy: Arc<dyn Policy>,
    rewards: RewardCalculator,
    config: EnvironmentConfig,
    extractors: FeaturePipeline,
    current: Option<ConversationState>,
    episode: Vec<EpisodeStep>,
    /// Credits of the current outcome already applied, latest step first.
    credited: Vec<StepCredit>,
    done: bool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("policy", &self.policy.name())
            .field("config", &self.config)
            .field("extractors", &self.extractors)
            .field("steps", &self.episode.len())
            .field("done", &self.done)
            .finish()
    }
}

impl Environment {
    pub fn new(
        policy: Arc<dyn Policy>,
        rewards: RewardCalculator,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            policy,
            rewards,
            config,
            extractors: FeaturePipeline::new(),
            current: None,
            episode: Vec::new(),
            credited: Vec::new(),
            done: false,
        }
    }

    /// Extractors re-run on every state the environment produces.
    #[must_use]
    pub fn with_extractors(mut self, extractors: FeaturePipeline) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn policy(&self) -> &Arc<dyn Policy> {
        &self.policy
    }

    pub fn rewards(&self) -> &RewardCalculator {
        &self.rewards
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Current state, `None` before the first `reset`.
    pub fn state(&self) -> Option<&ConversationState> {
        self.current.as_ref()
    }

    /// Transitions recorded since the last reset whose outcome is not yet fully credited.
    pub fn episode(&self) -> &[EpisodeStep] {
        &self.episode
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Starts a new episode from `initial_state`, discarding any uncredited steps.
    pub fn reset(&mut self, mut initial_state: ConversationState) -> &ConversationState {
        if !self.episode.is_empty() {
            log_debug!(
                "reset drops {} uncredited steps of {}",
                self.episode.len(),
                self.current
                    .as_ref()
                    .map_or("<none>", |s| s.conversation_id.as_str())
            );
        }
        self.extractors.apply(&mut initial_state);
        self.episode.clear();
        self.credited.clear();
        self.done = false;
        self.current.insert(initial_state)
    }

    /// Executes `action` and records the exchange.
    pub fn step(&mut self, action: &Action, response: Option<UserResponse>) -> Result<StepResult> {
        let prior = self.current.as_ref().ok_or(EnvError::NotReset)?;
        if self.done {
            return Err(EnvError::EpisodeFinished);
        }
        if !self.credited.is_empty() {
            return Err(EnvError::CreditPending);
        }

        let mut next = prior.clone();
        next.history
            .push(ConversationTurn::agent(agent_text(action), action.r#type.clone()));
        let feedback = match &response {
            Some(reply) => {
                let mut turn = ConversationTurn::user(reply.text.clone());
                if let Some(sentiment) = reply.sentiment {
                    turn = turn.with_sentiment(sentiment);
                }
                if let Some(intent) = &reply.intent {
                    turn = turn.with_intent(intent.clone());
                    next.intent = Some(intent.clone());
                }
                next.history.push(turn);
                reply.feedback()
            }
            None => Feedback::default(),
        };
        next.turn_number = next.turn_number.saturating_add(1);
        let extractor_errors = self
            .extractors
            .apply(&mut next)
            .into_iter()
            .map(|e| e.to_string())
            .collect();

        let reward = match response.as_ref().and_then(|r| r.reward) {
            Some(scored) => clamp_reward(scored),
            None => self.rewards.calculate_immediate(&next, action, &feedback),
        };

        let termination_reason = if action.is_terminal() {
            Some(format!("action {}", action.r#type))
        } else if next.turn_number >= self.config.max_turns {
            Some(format!("max turns ({}) reached", self.config.max_turns))
        } else {
            None
        };
        let done = termination_reason.is_some();

        self.episode.push(EpisodeStep {
            state: prior.clone(),
            action: action.clone(),
            immediate_reward: reward,
        });
        self.done = done;
        self.current = Some(next.clone());

        log_debug!(
            "step {} in {}: {} -> reward {:.3}{}",
            next.turn_number,
            next.conversation_id,
            action.r#type,
            reward,
            if done { " (done)" } else { "" }
        );

        Ok(StepResult {
            info: StepInfo {
                action_type: action.r#type.clone(),
                turn_number: next.turn_number,
                termination_reason,
                extractor_errors,
            },
            next_state: next,
            reward,
            done,
        })
    }

    /// Credits the terminal `outcome` to every recorded step, latest first.
    ///
    /// The step `k` places before the end receives the delayed reward
    /// discounted by `discount_factor^k`, combined with its own immediate
    /// reward. The episode is consumed once every step is credited; a second
    /// call credits nothing. If a policy update fails the error is returned
    /// and the episode is kept, so a retry resumes at the failed step.
    pub async fn process_outcome(&mut self, outcome: &ConversationOutcome) -> Result<CreditReport> {
        let delayed = self.rewards.calculate_delayed(outcome);
        let len = self.episode.len();
        let pending = len - self.credited.len();

        for index in (0..pending).rev() {
            let step = &self.episode[index];
            let steps_from_end = len - 1 - index;
            let discounted = self.rewards.discount(delayed, steps_from_end);
            let total = self.rewards.combine(&[
                RewardSignal::immediate(step.immediate_reward, "turn"),
                RewardSignal::delayed(discounted, "outcome"),
            ]);
            self.policy.update(&step.state, &step.action, total).await?;
            self.credited.push(StepCredit {
                index,
                action_type: step.action.r#type.clone(),
                immediate_reward: step.immediate_reward,
                discounted_reward: discounted,
                total_reward: total,
            });
        }
        self.episode.clear();
        let mut credits = std::mem::take(&mut self.credited);
        credits.reverse();

        log_debug!(
            "credited outcome {:.3} to {} steps (success: {})",
            delayed,
            len,
            outcome.success
        );
        Ok(CreditReport {
            delayed_reward: delayed,
            credits,
        })
    }

    /// Resets to `initial_state` and alternates policy choices with
    /// `simulator` replies until the episode is done.
    ///
    /// Outcome crediting is left to the caller.
    pub async fn run_episode<F>(
        &mut self,
        initial_state: ConversationState,
        mut simulator: F,
    ) -> Result<EpisodeSummary>
    where
        F: FnMut(&ConversationState, &Action) -> Option<UserResponse>,
    {
        self.reset(initial_state);
        let mut actions = Vec::new();
        let mut total_reward = 0.0;

        loop {
            let state = self.current.clone().ok_or(EnvError::NotReset)?;
            let action = self.policy.select_action(&state).await?;
            let response = simulator(&state, &action);
            let result = self.step(&action, response)?;
            actions.push(action.r#type);
            total_reward += result.reward;
            if result.done {
                return Ok(EpisodeSummary {
                    conversation_id: result.next_state.conversation_id.clone(),
                    turns: result.next_state.turn_number,
                    actions,
                    total_reward,
                    final_state: result.next_state,
                });
            }
        }
    }
}

fn agent_text(action: &Action) -> String {
    action
        .parameters
        .get(TEXT_PARAMETER)
        .and_then(Value::as_str)
        .map_or_else(|| action.description.clone(), str::to_string)
}
