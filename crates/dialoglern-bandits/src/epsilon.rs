//! ε-greedy exploration wrapped around any other [`Policy`].

use async_trait::async_trait;
use dialoglern_core::{
    log_debug, Action, ActionAnalysis, ActionSpace, ConversationState, Policy, PolicyError, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::explore::{sanitize_probability, ExplorationRng};

const POLICY_NAME: &str = "epsilon-greedy";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EpsilonGreedyConfig {
    /// Initial exploration probability.
    pub epsilon: f64,
    pub epsilon_min: f64,
    /// Multiplied into epsilon on every update.
    pub epsilon_decay: f64,
    pub seed: Option<u64>,
}

impl Default for EpsilonGreedyConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            seed: None,
        }
    }
}

impl EpsilonGreedyConfig {
    fn sanitized(mut self) -> Self {
        let defaults = EpsilonGreedyConfig::default();
        self.epsilon = sanitize_probability(self.epsilon, defaults.epsilon);
        self.epsilon_min = sanitize_probability(self.epsilon_min, defaults.epsilon_min);
        self.epsilon_decay = sanitize_probability(self.epsilon_decay, defaults.epsilon_decay);
        self
    }
}

/// Explores uniformly with probability ε and otherwise defers to a base
/// policy. ε decays on every update, whether the step explored or not.
pub struct EpsilonGreedy {
    base: Arc<dyn Policy>,
    config: RwLock<EpsilonGreedyConfig>,
    epsilon: Mutex<f64>,
    actions: RwLock<Option<ActionSpace>>,
    rng: ExplorationRng,
}

impl std::fmt::Debug for EpsilonGreedy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpsilonGreedy")
            .field("base", &self.base.name())
            .field("epsilon", &self.epsilon())
            .finish_non_exhaustive()
    }
}

impl EpsilonGreedy {
    pub fn new(base: Arc<dyn Policy>, config: EpsilonGreedyConfig) -> Self {
        let config = config.sanitized();
        Self {
            base,
            epsilon: Mutex::new(config.epsilon),
            rng: ExplorationRng::new(config.seed),
            config: RwLock::new(config),
            actions: RwLock::new(None),
        }
    }

    /// Explores over `actions` instead of the base policy's space.
    #[must_use]
    pub fn with_actions(self, actions: ActionSpace) -> Self {
        *self.actions.write().unwrap_or_else(PoisonError::into_inner) = Some(actions);
        self
    }

    pub fn base(&self) -> &Arc<dyn Policy> {
        &self.base
    }

    pub fn config(&self) -> EpsilonGreedyConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn epsilon(&self) -> f64 {
        *self.epsilon.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overrides ε, clamped to `[epsilon_min, 1.0]`.
    pub fn set_epsilon(&self, value: f64) {
        let min = self.config().epsilon_min;
        let value = if value.is_finite() { value } else { min };
        *self.epsilon.lock().unwrap_or_else(PoisonError::into_inner) = value.clamp(min, 1.0);
    }

    /// Restores ε to its configured initial value.
    pub fn reset_epsilon(&self) {
        let initial = self.config().epsilon;
        *self.epsilon.lock().unwrap_or_else(PoisonError::into_inner) = initial;
    }

    fn decay_epsilon(&self) -> f64 {
        let cfg = self.config();
        let mut eps = self.epsilon.lock().unwrap_or_else(PoisonError::into_inner);
        *eps = (*eps * cfg.epsilon_decay).max(cfg.epsilon_min);
        *eps
    }
}

#[async_trait]
impl Policy for EpsilonGreedy {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    fn action_space(&self) -> ActionSpace {
        match &*self.actions.read().unwrap_or_else(PoisonError::into_inner) {
            Some(space) => space.clone(),
            None => self.base.action_space(),
        }
    }

    async fn select_action(&self, state: &ConversationState) -> Result<Action> {
        let epsilon = self.epsilon();
        if self.rng.unit() < epsilon {
            let space = self.action_space();
            let action = self
                .rng
                .pick(&space)
                .ok_or(PolicyError::NotConfigured("action space"))?;
            log_debug!("epsilon-greedy explore (ε {:.3}): {}", epsilon, action.r#type);
            return Ok(action);
        }
        self.base.select_action(state).await
    }

    async fn analyze_action(&self, state: &ConversationState) -> Result<ActionAnalysis> {
        let mut analysis = self.base.analyze_action(state).await?;
        analysis.explanation.reason = format!(
            "ε={:.3} exploration, otherwise {}: {}",
            self.epsilon(),
            self.base.name(),
            analysis.explanation.reason
        );
        Ok(analysis)
    }

    async fn update(&self, state: &ConversationState, action: &Action, reward: f64) -> Result<()> {
        self.decay_epsilon();
        self.base.update(state, action, reward).await
    }

    async fn reset(&self) -> Result<()> {
        self.reset_epsilon();
        self.base.reset().await
    }

    async fn snapshot(&self) -> Result<Value> {
        Ok(json!({
            "config": self.config(),
            "epsilon": self.epsilon(),
            "base": self.base.snapshot().await?,
        }))
    }

    async fn load(&self, snapshot: Value) -> Result<()> {
        if let Some(patch) = snapshot.get("config").and_then(Value::as_object) {
            let current = self.config();
            let mut merged = serde_json::to_value(&current)?;
            if let Some(obj) = merged.as_object_mut() {
                for (k, v) in patch {
                    obj.insert(k.clone(), v.clone());
                }
            }
            let merged = serde_json::from_value::<EpsilonGreedyConfig>(merged)?.sanitized();
            if merged.seed != current.seed {
                self.rng.reseed(merged.seed);
            }
            *self.config.write().unwrap_or_else(PoisonError::into_inner) = merged;
        }
        if let Some(eps) = snapshot.get("epsilon").and_then(Value::as_f64) {
            self.set_epsilon(eps);
        }
        if let Some(base) = snapshot.get("base") {
            self.base.load(base.clone()).await?;
        }
        Ok(())
    }
}
