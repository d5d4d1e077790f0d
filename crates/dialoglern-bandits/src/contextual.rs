//! UCB1-style contextual bandit over `(context, action)` arms.
//!
//! The bandit keeps no learned state in-process: every arm's statistics and
//! the per-context pull counter live in the injected [`Storage`]. Contexts are
//! derived with [`ConversationState::context_key`], which is how experience
//! generalises across similar conversations.

use async_trait::async_trait;
use dialoglern_core::{
    log_debug, Action, ActionAnalysis, ActionSpace, Alternative, ConversationState, Explanation,
    Policy, PolicyError, Result, Storage, StorageDump, StorageExt,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::explore::{decayed_rate, sanitize_probability, ExplorationRng};

const POLICY_NAME: &str = "contextual-bandit";

/// Separator inside storage keys; action types must not contain it.
const KEY_SEPARATOR: char = ':';

fn check_action_type(action_type: &str) -> Result<()> {
    if action_type.contains(KEY_SEPARATOR) {
        return Err(PolicyError::InvalidAction(format!(
            "action type '{action_type}' contains '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Outcome of [`ContextualBandit::choose`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Choice {
    pub action: Action,
    /// `true` when the action was drawn at random instead of ranked.
    pub explored: bool,
    /// Exploration rate the draw was made against.
    pub exploration_rate: f64,
}

/// Reward statistics of one arm.
///
/// `average_reward == total_reward / pulls` whenever `pulls > 0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArmStats {
    pub pulls: u64,
    pub total_reward: f64,
    pub average_reward: f64,
}

impl ArmStats {
    fn untried(initial_reward: f64) -> Self {
        Self {
            pulls: 0,
            total_reward: 0.0,
            average_reward: initial_reward,
        }
    }

    fn record(&mut self, reward: f64) {
        self.pulls += 1;
        self.total_reward += reward;
        #[allow(clippy::cast_precision_loss)]
        let pulls = self.pulls as f64;
        self.average_reward = self.total_reward / pulls;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BanditConfig {
    /// Value of an arm that was never pulled.
    pub initial_reward: f64,
    pub confidence_bonus: f64,
    #[serde(rename = "useUCB", alias = "useUcb")]
    pub use_ucb: bool,
    pub exploration_rate: f64,
    pub min_exploration_rate: f64,
    pub exploration_decay: f64,
    /// Subtracted once per recent occurrence of the same action.
    pub repetition_penalty: f64,
    /// Number of most recent agent turns inspected for repetitions.
    pub lookback_window: usize,
    /// Namespace of every storage key the bandit writes.
    pub key_prefix: String,
    pub seed: Option<u64>,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            initial_reward: 1.0,
            confidence_bonus: 2.0,
            use_ucb: true,
            exploration_rate: 0.1,
            min_exploration_rate: 0.01,
            exploration_decay: 0.995,
            repetition_penalty: 0.1,
            lookback_window: 3,
            key_prefix: "bandit".to_string(),
            seed: None,
        }
    }
}

impl BanditConfig {
    fn sanitized(mut self) -> Self {
        let defaults = BanditConfig::default();
        self.exploration_rate =
            sanitize_probability(self.exploration_rate, defaults.exploration_rate);
        self.min_exploration_rate =
            sanitize_probability(self.min_exploration_rate, defaults.min_exploration_rate);
        self.exploration_decay =
            sanitize_probability(self.exploration_decay, defaults.exploration_decay);
        if !self.initial_reward.is_finite() {
            self.initial_reward = defaults.initial_reward;
        }
        if !self.confidence_bonus.is_finite() || self.confidence_bonus < 0.0 {
            self.confidence_bonus = defaults.confidence_bonus;
        }
        if !self.repetition_penalty.is_finite() {
            self.repetition_penalty = defaults.repetition_penalty;
        }
        if self.key_prefix.is_empty() {
            self.key_prefix = defaults.key_prefix;
        }
        self
    }

    fn arm_key(&self, context: &str, action_type: &str) -> String {
        format!("{}:arm:{}:{}", self.key_prefix, context, action_type)
    }

    fn pulls_key(&self, context: &str) -> String {
        format!("{}:pulls:{}", self.key_prefix, context)
    }

    fn owns_key(&self, key: &str) -> bool {
        key.strip_prefix(self.key_prefix.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    /// Exploration bonus of an arm, `None` when UCB does not apply.
    fn ucb_bonus(&self, pulls: u64, context_pulls: u64) -> Option<f64> {
        if !self.use_ucb || pulls == 0 || context_pulls == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let (pulls, total) = (pulls as f64, context_pulls as f64);
        Some(self.confidence_bonus * (total.ln() / pulls).sqrt())
    }

    /// Estimated value of an arm before the repetition penalty.
    pub fn arm_value(&self, stats: &ArmStats, context_pulls: u64) -> f64 {
        if stats.pulls == 0 {
            return self.initial_reward;
        }
        if self.use_ucb {
            return match self.ucb_bonus(stats.pulls, context_pulls) {
                Some(bonus) => stats.average_reward + bonus,
                None => self.initial_reward,
            };
        }
        stats.average_reward
    }

    fn repetition_count(&self, state: &ConversationState, action_type: &str) -> usize {
        state
            .recent_agent_actions(self.lookback_window)
            .into_iter()
            .filter(|t| *t == action_type)
            .count()
    }
}

#[derive(Debug, Clone)]
struct ScoredAction {
    action: Action,
    stats: ArmStats,
    bonus: Option<f64>,
    penalty: f64,
    value: f64,
}

impl ScoredAction {
    fn justification(&self) -> String {
        let mut text = if self.stats.pulls == 0 {
            format!("untried arm, optimistic value {:.3}", self.value + self.penalty)
        } else {
            format!(
                "average reward {:.3} over {} pulls",
                self.stats.average_reward, self.stats.pulls
            )
        };
        if let Some(bonus) = self.bonus {
            text.push_str(&format!(", exploration bonus {bonus:.3}"));
        }
        if self.penalty > 0.0 {
            text.push_str(&format!(", repetition penalty {:.3}", self.penalty));
        }
        text
    }

    fn confidence(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let pulls = self.stats.pulls as f64;
        pulls / (pulls + 1.0)
    }
}

/// Contextual UCB1 bandit with decaying random exploration and a penalty for
/// repeating recent actions.
pub struct ContextualBandit {
    storage: Arc<dyn Storage>,
    config: RwLock<BanditConfig>,
    actions: RwLock<ActionSpace>,
    steps: AtomicU64,
    rng: ExplorationRng,
}

impl std::fmt::Debug for ContextualBandit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextualBandit")
            .field("config", &self.config())
            .field("actions", &self.action_space().len())
            .field("steps", &self.step_count())
            .finish_non_exhaustive()
    }
}

impl ContextualBandit {
    pub fn new(storage: Arc<dyn Storage>, config: BanditConfig) -> Self {
        let config = config.sanitized();
        let rng = ExplorationRng::new(config.seed);
        Self {
            storage,
            config: RwLock::new(config),
            actions: RwLock::new(ActionSpace::new()),
            steps: AtomicU64::new(0),
            rng,
        }
    }

    #[must_use]
    pub fn with_actions(self, actions: ActionSpace) -> Self {
        self.set_action_space(actions);
        self
    }

    pub fn set_action_space(&self, actions: ActionSpace) {
        *self.actions.write().unwrap_or_else(PoisonError::into_inner) = actions;
    }

    pub fn config(&self) -> BanditConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn step_count(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Replaces the random source for this process only; the seed is not
    /// written to snapshots.
    pub fn reseed(&self, seed: Option<u64>) {
        self.rng.reseed(seed);
    }

    /// Exploration rate the next `select_action` call will use.
    pub fn exploration_rate(&self) -> f64 {
        let cfg = self.config();
        decayed_rate(
            cfg.exploration_rate,
            cfg.min_exploration_rate,
            cfg.exploration_decay,
            self.step_count(),
        )
    }

    /// Stored statistics of an arm, `None` if it was never updated.
    pub async fn arm_stats(&self, context: &str, action_type: &str) -> Result<Option<ArmStats>> {
        let key = self.config().arm_key(context, action_type);
        Ok(self.storage.get_as::<ArmStats>(&key).await?)
    }

    pub async fn context_pulls(&self, context: &str) -> Result<u64> {
        let key = self.config().pulls_key(context);
        Ok(self.storage.get_as::<u64>(&key).await?.unwrap_or(0))
    }

    fn require_actions(&self) -> Result<ActionSpace> {
        let space = self.action_space();
        if space.is_empty() {
            return Err(PolicyError::NotConfigured("action space"));
        }
        for action in space.iter() {
            check_action_type(&action.r#type)?;
        }
        Ok(space)
    }

    /// Selects an action and reports whether it came from exploration.
    pub async fn choose(&self, state: &ConversationState) -> Result<Choice> {
        let space = self.require_actions()?;
        let cfg = self.config();
        let step = self.steps.fetch_add(1, Ordering::Relaxed);
        let rate = decayed_rate(
            cfg.exploration_rate,
            cfg.min_exploration_rate,
            cfg.exploration_decay,
            step,
        );

        if self.rng.unit() < rate {
            let action = self
                .rng
                .pick(&space)
                .ok_or(PolicyError::Internal("random pick from non-empty space"))?;
            log_debug!("explore (rate {:.3}): {}", rate, action.r#type);
            return Ok(Choice {
                action,
                explored: true,
                exploration_rate: rate,
            });
        }

        let scored = self.score_actions(&cfg, &space, state).await?;
        let best = best_of(&scored).ok_or(PolicyError::Internal("no scored actions"))?;
        log_debug!("exploit: {} (value {:.3})", best.action.r#type, best.value);
        Ok(Choice {
            action: best.action.clone(),
            explored: false,
            exploration_rate: rate,
        })
    }

    /// Scores every action in insertion order.
    async fn score_actions(
        &self,
        cfg: &BanditConfig,
        space: &ActionSpace,
        state: &ConversationState,
    ) -> Result<Vec<ScoredAction>> {
        let context = state.context_key();
        let context_pulls = self
            .storage
            .get_as::<u64>(&cfg.pulls_key(&context))
            .await?
            .unwrap_or(0);

        let mut scored = Vec::with_capacity(space.len());
        for action in space.iter() {
            let stats = self
                .storage
                .get_as::<ArmStats>(&cfg.arm_key(&context, &action.r#type))
                .await?
                .unwrap_or_else(|| ArmStats::untried(cfg.initial_reward));
            #[allow(clippy::cast_precision_loss)]
            let penalty =
                cfg.repetition_count(state, &action.r#type) as f64 * cfg.repetition_penalty;
            let value = cfg.arm_value(&stats, context_pulls) - penalty;
            scored.push(ScoredAction {
                action: action.clone(),
                stats,
                bonus: cfg.ucb_bonus(stats.pulls, context_pulls),
                penalty,
                value,
            });
        }
        Ok(scored)
    }
}

/// First maximum wins, so ties go to the earlier action.
fn best_of(scored: &[ScoredAction]) -> Option<&ScoredAction> {
    let mut best: Option<&ScoredAction> = None;
    for candidate in scored {
        if best.map_or(true, |b| candidate.value > b.value) {
            best = Some(candidate);
        }
    }
    best
}

#[async_trait]
impl Policy for ContextualBandit {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    fn action_space(&self) -> ActionSpace {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn select_action(&self, state: &ConversationState) -> Result<Action> {
        Ok(self.choose(state).await?.action)
    }

    async fn analyze_action(&self, state: &ConversationState) -> Result<ActionAnalysis> {
        let space = self.require_actions()?;
        let cfg = self.config();
        self.steps.fetch_add(1, Ordering::Relaxed);

        let mut scored = self.score_actions(&cfg, &space, state).await?;
        // stable sort keeps insertion order among equal values
        scored.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(CmpOrdering::Equal));
        let best = scored
            .first()
            .cloned()
            .ok_or(PolicyError::Internal("no scored actions"))?;

        let context = state.context_key();
        let context_label = if context.is_empty() {
            "default".to_string()
        } else {
            context
        };
        let alternatives = scored
            .iter()
            .map(|s| Alternative {
                action_type: s.action.r#type.clone(),
                value: s.value,
                justification: s.justification(),
            })
            .collect();

        Ok(ActionAnalysis {
            explanation: Explanation {
                reason: format!(
                    "highest estimated value {:.3} in context '{}'",
                    best.value, context_label
                ),
                confidence: best.confidence(),
                alternatives,
            },
            action: best.action,
        })
    }

    async fn update(&self, state: &ConversationState, action: &Action, reward: f64) -> Result<()> {
        if !reward.is_finite() {
            return Err(PolicyError::InvalidAction(format!(
                "non-finite reward {reward} for '{}'",
                action.r#type
            )));
        }
        check_action_type(&action.r#type)?;
        let cfg = self.config();
        let context = state.context_key();

        // Read-modify-write without a transaction; concurrent updates of the
        // same arm can lose one another.
        let arm_key = cfg.arm_key(&context, &action.r#type);
        let mut stats = self
            .storage
            .get_as::<ArmStats>(&arm_key)
            .await?
            .unwrap_or_else(|| ArmStats::untried(cfg.initial_reward));
        stats.record(reward);
        self.storage.set_as(&arm_key, &stats, None).await?;

        let pulls_key = cfg.pulls_key(&context);
        let total = self.storage.get_as::<u64>(&pulls_key).await?.unwrap_or(0);
        self.storage.set_as(&pulls_key, &(total + 1), None).await?;

        log_debug!(
            "update {}@'{}': reward {:.3}, avg {:.3} over {}",
            action.r#type,
            context,
            reward,
            stats.average_reward,
            stats.pulls
        );
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let cfg = self.config();
        match self.storage.export().await? {
            Some(dump) => {
                for key in dump.keys().filter(|k| cfg.owns_key(k)) {
                    self.storage.delete(key).await?;
                }
            }
            None => self.storage.clear().await?,
        }
        self.steps.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn snapshot(&self) -> Result<Value> {
        let cfg = self.config();
        let mut snapshot = json!({ "config": &cfg, "stepCount": self.step_count() });
        if let Some(dump) = self.storage.export().await? {
            let arm_stats: StorageDump = dump
                .into_iter()
                .filter(|(k, _)| cfg.owns_key(k))
                .collect();
            snapshot["armStats"] = serde_json::to_value(arm_stats)?;
        }
        Ok(snapshot)
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
            let merged: BanditConfig = serde_json::from_value::<BanditConfig>(merged)?.sanitized();
            if merged.seed != current.seed {
                self.rng.reseed(merged.seed);
            }
            *self.config.write().unwrap_or_else(PoisonError::into_inner) = merged;
        }

        if let Some(steps) = snapshot.get("stepCount").and_then(Value::as_u64) {
            self.steps.store(steps, Ordering::Relaxed);
        }

        if let Some(arm_stats) = snapshot.get("armStats") {
            let dump: StorageDump = serde_json::from_value(arm_stats.clone())?;
            self.storage.import(dump).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use dialoglern_core::{ConversationTurn, MemoryStorage, StorageResult, END_CALL};
    use std::time::Duration;

    fn ask() -> Action {
        Action::new("ask_question", "ask", "Ask a clarifying question")
    }

    fn end() -> Action {
        Action::new(END_CALL, "end", "End the call")
    }

    fn space() -> ActionSpace {
        vec![ask(), end()].into_iter().collect()
    }

    fn greedy_config() -> BanditConfig {
        BanditConfig {
            initial_reward: 0.0,
            confidence_bonus: 2.0,
            use_ucb: true,
            exploration_rate: 0.0,
            min_exploration_rate: 0.0,
            ..BanditConfig::default()
        }
    }

    fn bandit(config: BanditConfig) -> ContextualBandit {
        ContextualBandit::new(Arc::new(MemoryStorage::new()), config).with_actions(space())
    }

    fn state_a() -> ConversationState {
        ConversationState::new("call-a")
            .with_intent("billing")
            .with_feature("frustration", 0.25)
    }

    #[tokio::test]
    async fn learns_to_prefer_rewarded_action() {
        let policy = bandit(greedy_config());
        policy.update(&state_a(), &ask(), 1.0).await.unwrap();

        let chosen = policy.select_action(&state_a()).await.unwrap();
        assert_eq!(chosen.r#type, "ask_question");
    }

    #[tokio::test]
    async fn running_mean_matches_rewards() {
        let policy = bandit(greedy_config());
        let rewards = [0.5, -0.25, 1.0, 0.0, 0.75];
        for r in rewards {
            policy.update(&state_a(), &ask(), r).await.unwrap();
        }

        let stats = policy
            .arm_stats(&state_a().context_key(), "ask_question")
            .await
            .unwrap()
            .expect("arm exists after update");
        assert_eq!(stats.pulls, 5);
        let expected: f64 = rewards.iter().sum::<f64>() / 5.0;
        assert!((stats.average_reward - expected).abs() < 1e-12);
        assert!((stats.total_reward - 2.0).abs() < 1e-12);
        assert_eq!(policy.context_pulls(&state_a().context_key()).await.unwrap(), 5);
    }

    #[test]
    fn untried_arm_is_always_initial_reward() {
        let cfg = BanditConfig {
            initial_reward: 0.8,
            ..BanditConfig::default()
        };
        let untried = ArmStats {
            pulls: 0,
            total_reward: 42.0,
            average_reward: -3.0,
        };
        for total in [0, 1, 100] {
            assert!((cfg.arm_value(&untried, total) - 0.8).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn ucb_bonus_shrinks_with_more_pulls() {
        let cfg = BanditConfig::default();
        let mut previous = f64::INFINITY;
        for pulls in 1..20 {
            let stats = ArmStats {
                pulls,
                total_reward: 0.5 * pulls as f64,
                average_reward: 0.5,
            };
            let value = cfg.arm_value(&stats, 50);
            assert!(value < previous, "pulls={pulls}");
            previous = value;
        }
    }

    #[test]
    fn ucb_without_context_pulls_falls_back_to_initial_reward() {
        let cfg = BanditConfig::default();
        let stats = ArmStats {
            pulls: 3,
            total_reward: -1.5,
            average_reward: -0.5,
        };
        assert!((cfg.arm_value(&stats, 0) - cfg.initial_reward).abs() < f64::EPSILON);

        let plain = BanditConfig {
            use_ucb: false,
            ..BanditConfig::default()
        };
        assert!((plain.arm_value(&stats, 0) + 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn repetition_penalty_breaks_loops() {
        let policy = bandit(BanditConfig {
            repetition_penalty: 0.6,
            lookback_window: 2,
            ..greedy_config()
        });
        policy.update(&state_a(), &ask(), 0.5).await.unwrap();
        policy.update(&state_a(), &end(), 0.3).await.unwrap();

        let looping = state_a()
            .with_turn(ConversationTurn::agent("?", "ask_question"))
            .with_turn(ConversationTurn::user("hm"))
            .with_turn(ConversationTurn::agent("?", "ask_question"));
        // ask: 0.5 + bonus - 1.2 < end: 0.3 + bonus
        assert_eq!(policy.select_action(&looping).await.unwrap().r#type, END_CALL);
        assert_eq!(
            policy.select_action(&state_a()).await.unwrap().r#type,
            "ask_question"
        );
    }

    #[tokio::test]
    async fn ties_go_to_first_inserted_action() {
        let policy = bandit(greedy_config());
        let chosen = policy.select_action(&state_a()).await.unwrap();
        assert_eq!(chosen.r#type, "ask_question");
    }

    #[tokio::test]
    async fn full_exploration_samples_from_space() {
        let policy = bandit(BanditConfig {
            exploration_rate: 1.0,
            min_exploration_rate: 1.0,
            seed: Some(11),
            ..greedy_config()
        });
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            seen.insert(policy.select_action(&state_a()).await.unwrap().r#type);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(policy.step_count(), 64);
    }

    #[tokio::test]
    async fn exploration_rate_decays_with_steps() {
        let policy = bandit(BanditConfig {
            exploration_rate: 0.5,
            min_exploration_rate: 0.1,
            exploration_decay: 0.5,
            ..BanditConfig::default()
        });
        assert!((policy.exploration_rate() - 0.5).abs() < 1e-12);
        policy.analyze_action(&state_a()).await.unwrap();
        assert!((policy.exploration_rate() - 0.25).abs() < 1e-12);
        for _ in 0..10 {
            policy.analyze_action(&state_a()).await.unwrap();
        }
        assert!((policy.exploration_rate() - 0.1).abs() < 1e-12);
    }

    #[tokio::test]
    async fn analyze_ranks_without_touching_statistics() {
        let policy = bandit(greedy_config());
        policy.update(&state_a(), &end(), 0.9).await.unwrap();
        let before = policy.snapshot().await.unwrap();

        let analysis = policy.analyze_action(&state_a()).await.unwrap();
        assert_eq!(analysis.action.r#type, END_CALL);
        assert_eq!(analysis.explanation.alternatives.len(), 2);
        assert_eq!(analysis.explanation.alternatives[0].action_type, END_CALL);
        assert!(analysis.explanation.alternatives[1]
            .justification
            .contains("untried"));
        assert!((analysis.explanation.confidence - 0.5).abs() < 1e-12);

        assert_eq!(policy.snapshot().await.unwrap()["armStats"], before["armStats"]);
    }

    #[tokio::test]
    async fn missing_action_space_is_an_error() {
        let policy = ContextualBandit::new(Arc::new(MemoryStorage::new()), greedy_config());
        let err = policy.select_action(&state_a()).await.unwrap_err();
        assert!(matches!(err, PolicyError::NotConfigured("action space")));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_restores_behaviour() {
        let policy = bandit(greedy_config());
        policy.update(&state_a(), &end(), 1.0).await.unwrap();
        policy.update(&state_a(), &ask(), -1.0).await.unwrap();
        let snap = policy.snapshot().await.unwrap();

        let restored = ContextualBandit::new(
            Arc::new(MemoryStorage::new()),
            BanditConfig {
                initial_reward: 5.0,
                ..BanditConfig::default()
            },
        )
        .with_actions(space());
        restored.load(snap).await.unwrap();

        assert_eq!(restored.config(), policy.config());
        assert_eq!(restored.step_count(), policy.step_count());
        assert_eq!(
            restored.select_action(&state_a()).await.unwrap(),
            policy.select_action(&state_a()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn snapshot_carries_exploration_decay() {
        let policy = bandit(BanditConfig {
            exploration_rate: 0.5,
            min_exploration_rate: 0.01,
            exploration_decay: 0.5,
            seed: Some(1),
            ..BanditConfig::default()
        });
        for _ in 0..10 {
            policy.select_action(&state_a()).await.unwrap();
        }
        let snap = policy.snapshot().await.unwrap();
        assert_eq!(snap["stepCount"], json!(10));

        let restored =
            ContextualBandit::new(Arc::new(MemoryStorage::new()), BanditConfig::default())
                .with_actions(space());
        restored.load(snap).await.unwrap();

        assert_eq!(restored.step_count(), 10);
        assert!((restored.exploration_rate() - policy.exploration_rate()).abs() < 1e-12);
        assert!((restored.exploration_rate() - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn reseed_is_not_persisted() {
        let policy = bandit(BanditConfig::default());
        policy.reseed(Some(7));
        let snap = policy.snapshot().await.unwrap();
        assert_eq!(snap["config"]["seed"], Value::Null);
    }

    #[tokio::test]
    async fn choose_reports_exploration() {
        let explorer = bandit(BanditConfig {
            exploration_rate: 1.0,
            min_exploration_rate: 1.0,
            ..BanditConfig::default()
        });
        let choice = explorer.choose(&state_a()).await.unwrap();
        assert!(choice.explored);
        assert!((choice.exploration_rate - 1.0).abs() < f64::EPSILON);

        let exploiter = bandit(greedy_config());
        let choice = exploiter.choose(&state_a()).await.unwrap();
        assert!(!choice.explored);
        assert_eq!(exploiter.step_count(), 1);
    }

    #[tokio::test]
    async fn action_types_with_key_separator_are_rejected() {
        let colon = Action::new("transfer:sales", "transfer", "");
        let policy = bandit(greedy_config());
        let err = policy.update(&state_a(), &colon, 1.0).await.unwrap_err();
        assert!(matches!(err, PolicyError::InvalidAction(_)));

        let mixed = ContextualBandit::new(Arc::new(MemoryStorage::new()), greedy_config())
            .with_actions(vec![ask(), colon].into_iter().collect());
        assert!(matches!(
            mixed.select_action(&state_a()).await,
            Err(PolicyError::InvalidAction(_))
        ));
    }

    #[tokio::test]
    async fn load_merges_partial_config_and_sanitizes() {
        let policy = bandit(BanditConfig::default());
        policy
            .load(json!({"config": {"explorationRate": 7.0, "useUCB": false}}))
            .await
            .unwrap();
        let cfg = policy.config();
        assert!((cfg.exploration_rate - 1.0).abs() < f64::EPSILON);
        assert!(!cfg.use_ucb);
        assert!((cfg.confidence_bonus - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn reset_only_drops_own_keys() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set("other:key", json!(1), None).await.unwrap();
        let policy = ContextualBandit::new(storage.clone(), greedy_config()).with_actions(space());
        policy.update(&state_a(), &ask(), 1.0).await.unwrap();
        policy.select_action(&state_a()).await.unwrap();

        policy.reset().await.unwrap();

        assert_eq!(policy.step_count(), 0);
        assert!(policy
            .arm_stats(&state_a().context_key(), "ask_question")
            .await
            .unwrap()
            .is_none());
        assert_eq!(storage.get("other:key").await.unwrap(), Some(json!(1)));
    }

    /// Holds every arm read until two readers have arrived, so both updates
    /// see the same pre-update statistics.
    struct RacingStorage {
        inner: MemoryStorage,
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl Storage for RacingStorage {
        async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
            let value = self.inner.get(key).await?;
            if key.contains(":arm:") {
                self.barrier.wait().await;
            }
            Ok(value)
        }
        async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
        async fn clear(&self) -> StorageResult<()> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn concurrent_updates_on_one_arm_lose_an_update() {
        let storage = Arc::new(RacingStorage {
            inner: MemoryStorage::new(),
            barrier: tokio::sync::Barrier::new(2),
        });
        let policy = ContextualBandit::new(storage.clone(), greedy_config()).with_actions(space());
        let state = state_a();

        let action = ask();
        let (a, b) = tokio::join!(
            policy.update(&state, &action, 1.0),
            policy.update(&state, &action, 0.0)
        );
        a.unwrap();
        b.unwrap();

        // Two updates were issued but the arm only records the later write.
        let key = policy.config().arm_key(&state.context_key(), "ask_question");
        let stats: ArmStats = storage.inner.get_as(&key).await.unwrap().expect("arm written");
        assert_eq!(stats.pulls, 1);
    }
}
