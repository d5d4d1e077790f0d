#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Safety layer between a policy and the conversation.
//!
//! [`Guardrails`] checks a proposed action against a whitelist, a blacklist
//! and an ordered list of [`Rule`]s. A blocking violation replaces the action
//! with a fallback; a non-blocking one is only logged and recorded.

use dialoglern_core::{log_warn, Action, ConversationState, Policy, PolicyError, END_CALL};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use time::OffsetDateTime;

/// Rule name recorded when an action is missing from the whitelist.
pub const WHITELIST_RULE: &str = "whitelist";
/// Rule name recorded when an action is on the blacklist.
pub const BLACKLIST_RULE: &str = "blacklist";

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("action '{action_type}' violates '{rule}' and no fallback is available")]
    NoFallback { rule: String, action_type: String },
    #[error("fallback policy failed: {0}")]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, GuardrailError>;

/// Predicate returning `true` when `(state, action)` violates the rule.
pub type RuleCheck = Arc<dyn Fn(&ConversationState, &Action) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Rule {
    pub name: String,
    pub description: String,
    check: RuleCheck,
    /// Replacement used when this rule blocks an action.
    pub fallback_action: Option<Action>,
    /// Non-blocking rules are recorded but never change the action.
    pub blocking: bool,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("fallback_action", &self.fallback_action.as_ref().map(|a| &a.r#type))
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

impl Rule {
    /// Creates a blocking rule without fallback.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&ConversationState, &Action) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            check: Arc::new(check),
            fallback_action: None,
            blocking: true,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, action: Action) -> Self {
        self.fallback_action = Some(action);
        self
    }

    #[must_use]
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn is_violated(&self, state: &ConversationState, action: &Action) -> bool {
        (self.check)(state, action)
    }

    /// Forces `end_call` once the conversation has reached `max_turns`.
    pub fn max_turns(max_turns: u32) -> Self {
        Self::new("max_turns", move |state, action| {
            state.turn_number >= max_turns && !action.is_terminal()
        })
        .with_description(format!("conversation must end after {max_turns} turns"))
        .with_fallback(Action::new(
            END_CALL,
            "end",
            "We've covered a lot, let's wrap up here.",
        ))
    }

    /// Rejects repeating the previous agent action.
    pub fn no_consecutive_repeat() -> Self {
        Self::new("no_consecutive_repeat", |state, action| {
            state.last_agent_action() == Some(action.r#type.as_str())
        })
        .with_description("the same action may not be taken twice in a row")
    }

    /// Rejects the listed action types until the user's intent is known.
    pub fn require_intent<I, S>(action_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let guarded: BTreeSet<String> = action_types.into_iter().map(Into::into).collect();
        let description = format!(
            "{} require a known intent",
            guarded.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        Self::new("require_intent", move |state, action| {
            state.intent.is_none() && guarded.contains(&action.r#type)
        })
        .with_description(description)
    }
}

/// A recorded guardrail hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub rule: String,
    pub action_type: String,
    pub conversation_id: String,
    pub turn_number: u32,
    pub blocking: bool,
    /// Type of the action that was returned instead, if any.
    pub replacement: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Result of [`Guardrails::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    /// The action to execute; the proposal itself when nothing blocked it.
    pub action: Action,
    pub overridden: bool,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GuardrailStats {
    pub total: usize,
    pub blocking: usize,
    pub non_blocking: usize,
    pub overridden: usize,
    pub by_rule: BTreeMap<String, usize>,
    pub by_action: BTreeMap<String, usize>,
}

struct Blocked<'a> {
    rule: &'a str,
    fallback: Option<&'a Action>,
}

#[derive(Default)]
pub struct Guardrails {
    rules: Vec<Rule>,
    whitelist: BTreeSet<String>,
    blacklist: BTreeSet<String>,
    fallback_policy: Option<Arc<dyn Policy>>,
    default_fallback: Option<Action>,
    violations: Mutex<Vec<Violation>>,
}

impl std::fmt::Debug for Guardrails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guardrails")
            .field("rules", &self.rules)
            .field("whitelist", &self.whitelist)
            .field("blacklist", &self.blacklist)
            .field("fallback_policy", &self.fallback_policy.as_ref().map(|p| p.name()))
            .field("default_fallback", &self.default_fallback.as_ref().map(|a| &a.r#type))
            .finish_non_exhaustive()
    }
}

impl Guardrails {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Appends a rule; rules are evaluated in registration order.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, name: &str) -> Option<Rule> {
        let idx = self.rules.iter().position(|r| r.name == name)?;
        Some(self.rules.remove(idx))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Only these action types pass, when non-empty.
    #[must_use]
    pub fn with_whitelist<I, S>(mut self, action_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = action_types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_blacklist<I, S>(mut self, action_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist = action_types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_fallback_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.fallback_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_default_fallback(mut self, action: Action) -> Self {
        self.default_fallback = Some(action);
        self
    }

    fn first_blocking<'a>(&'a self, state: &ConversationState, action: &Action) -> Option<Blocked<'a>> {
        if !self.whitelist.is_empty() && !self.whitelist.contains(&action.r#type) {
            return Some(Blocked {
                rule: WHITELIST_RULE,
                fallback: None,
            });
        }
        if self.blacklist.contains(&action.r#type) {
            return Some(Blocked {
                rule: BLACKLIST_RULE,
                fallback: None,
            });
        }
        self.rules
            .iter()
            .find(|r| r.blocking && r.is_violated(state, action))
            .map(|r| Blocked {
                rule: &r.name,
                fallback: r.fallback_action.as_ref(),
            })
    }

    /// Whether `action` passes every blocking check. Records nothing.
    pub fn is_safe(&self, state: &ConversationState, action: &Action) -> bool {
        self.first_blocking(state, action).is_none()
    }

    /// Checks `action` and returns it, or its replacement when blocked.
    ///
    /// A blocked action is replaced by the violated rule's fallback, else the
    /// default fallback, else the fallback policy's choice. Replacements are
    /// not validated again.
    pub async fn validate(
        &self,
        state: &ConversationState,
        action: &Action,
    ) -> Result<Validation> {
        let mut recorded = Vec::new();

        for rule in self.rules.iter().filter(|r| !r.blocking) {
            if rule.is_violated(state, action) {
                log_warn!(
                    "guardrail '{}' flagged {} in {} (non-blocking)",
                    rule.name,
                    action.r#type,
                    state.conversation_id
                );
                recorded.push(violation(state, action, &rule.name, false, None));
            }
        }

        let Some(blocked) = self.first_blocking(state, action) else {
            self.record(&recorded);
            return Ok(Validation {
                action: action.clone(),
                overridden: false,
                violations: recorded,
            });
        };

        let replacement = match blocked.fallback.or(self.default_fallback.as_ref()) {
            Some(fallback) => Some(fallback.clone()),
            None => match &self.fallback_policy {
                Some(policy) => Some(policy.select_action(state).await?),
                None => None,
            },
        };

        recorded.push(violation(
            state,
            action,
            blocked.rule,
            true,
            replacement.as_ref().map(|a| a.r#type.clone()),
        ));
        self.record(&recorded);

        match replacement {
            Some(replacement) => {
                log_warn!(
                    "guardrail '{}' replaced {} with {} in {}",
                    blocked.rule,
                    action.r#type,
                    replacement.r#type,
                    state.conversation_id
                );
                Ok(Validation {
                    action: replacement,
                    overridden: true,
                    violations: recorded,
                })
            }
            None => Err(GuardrailError::NoFallback {
                rule: blocked.rule.to_string(),
                action_type: action.r#type.clone(),
            }),
        }
    }

    fn record(&self, new: &[Violation]) {
        if new.is_empty() {
            return;
        }
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(new);
    }

    /// All violations recorded so far, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_violations(&self) {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn stats(&self) -> GuardrailStats {
        let violations = self.violations.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = GuardrailStats {
            total: violations.len(),
            ..GuardrailStats::default()
        };
        for v in violations.iter() {
            if v.blocking {
                stats.blocking += 1;
            } else {
                stats.non_blocking += 1;
            }
            if v.replacement.is_some() {
                stats.overridden += 1;
            }
            *stats.by_rule.entry(v.rule.clone()).or_default() += 1;
            *stats.by_action.entry(v.action_type.clone()).or_default() += 1;
        }
        stats
    }
}

fn violation(
    state: &ConversationState,
    action: &Action,
    rule: &str,
    blocking: bool,
    replacement: Option<String>,
) -> Violation {
    Violation {
        rule: rule.to_string(),
        action_type: action.r#type.clone(),
        conversation_id: state.conversation_id.clone(),
        turn_number: state.turn_number,
        blocking,
        replacement,
        timestamp: OffsetDateTime::now_utc(),
    }
}

/// Declarative guardrail setup, as read from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardrailSettings {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub default_fallback: Option<Action>,
    pub max_turns: Option<u32>,
    pub no_consecutive_repeat: bool,
    /// Action types that need a known intent.
    pub require_intent: Vec<String>,
}

impl GuardrailSettings {
    pub fn build(&self) -> Guardrails {
        let mut guardrails = Guardrails::new()
            .with_whitelist(self.whitelist.iter().cloned())
            .with_blacklist(self.blacklist.iter().cloned());
        if let Some(fallback) = &self.default_fallback {
            guardrails = guardrails.with_default_fallback(fallback.clone());
        }
        if let Some(max_turns) = self.max_turns {
            guardrails.add_rule(Rule::max_turns(max_turns));
        }
        if self.no_consecutive_repeat {
            guardrails.add_rule(Rule::no_consecutive_repeat());
        }
        if !self.require_intent.is_empty() {
            guardrails.add_rule(Rule::require_intent(self.require_intent.iter().cloned()));
        }
        guardrails
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dialoglern_core::{ActionAnalysis, ActionSpace, ConversationTurn};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fallback policy that always answers with `transfer` and counts calls.
    #[derive(Default)]
    struct Transfer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Policy for Transfer {
        fn name(&self) -> &str {
            "transfer"
        }

        fn action_space(&self) -> ActionSpace {
            [transfer()].into_iter().collect()
        }

        async fn select_action(&self, _state: &ConversationState) -> dialoglern_core::Result<Action> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(transfer())
        }

        async fn analyze_action(
            &self,
            _state: &ConversationState,
        ) -> dialoglern_core::Result<ActionAnalysis> {
            Err(PolicyError::Internal("not used"))
        }

        async fn update(
            &self,
            _state: &ConversationState,
            _action: &Action,
            _reward: f64,
        ) -> dialoglern_core::Result<()> {
            Ok(())
        }

        async fn reset(&self) -> dialoglern_core::Result<()> {
            Ok(())
        }

        async fn snapshot(&self) -> dialoglern_core::Result<Value> {
            Ok(json!({}))
        }

        async fn load(&self, _snapshot: Value) -> dialoglern_core::Result<()> {
            Ok(())
        }
    }

    fn ask() -> Action {
        Action::new("ask_question", "ask", "")
    }

    fn transfer() -> Action {
        Action::new("transfer", "transfer", "")
    }

    fn apology() -> Action {
        Action::new("apologize", "apology", "")
    }

    fn end() -> Action {
        Action::new(END_CALL, "end", "")
    }

    fn state() -> ConversationState {
        ConversationState::new("c1")
    }

    fn never_ask() -> Rule {
        Rule::new("never_ask", |_, action| action.r#type == "ask_question")
    }

    #[tokio::test]
    async fn rule_fallback_wins_over_default_and_policy() {
        let policy = Arc::new(Transfer::default());
        let guardrails = Guardrails::new()
            .with_rule(never_ask().with_fallback(apology()))
            .with_default_fallback(end())
            .with_fallback_policy(policy.clone());

        let validation = guardrails.validate(&state(), &ask()).await.expect("validate");
        assert_eq!(validation.action.r#type, "apologize");
        assert!(validation.overridden);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallbacks_are_tried_in_order() {
        let policy = Arc::new(Transfer::default());

        let with_default = Guardrails::new()
            .with_rule(never_ask())
            .with_default_fallback(end())
            .with_fallback_policy(policy.clone());
        let v = with_default.validate(&state(), &ask()).await.expect("default");
        assert_eq!(v.action.r#type, END_CALL);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 0);

        let with_policy = Guardrails::new()
            .with_rule(never_ask())
            .with_fallback_policy(policy.clone());
        let v = with_policy.validate(&state(), &ask()).await.expect("policy");
        assert_eq!(v.action.r#type, "transfer");
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);

        let without = Guardrails::new().with_rule(never_ask());
        let err = without.validate(&state(), &ask()).await.unwrap_err();
        assert!(matches!(
            err,
            GuardrailError::NoFallback { ref rule, ref action_type }
                if rule == "never_ask" && action_type == "ask_question"
        ));
        assert_eq!(without.violations().len(), 1);
        assert_eq!(without.violations()[0].replacement, None);
    }

    #[test]
    fn whitelist_excludes_everything_else() {
        let guardrails = Guardrails::new().with_whitelist(["ask_question"]);
        assert!(guardrails.is_safe(&state(), &ask()));
        assert!(!guardrails.is_safe(&state(), &end()));
        assert!(!guardrails.is_safe(&state(), &transfer()));

        // Blacklist still applies to whitelisted actions.
        let both = Guardrails::new()
            .with_whitelist(["ask_question"])
            .with_blacklist(["ask_question"]);
        assert!(!both.is_safe(&state(), &ask()));
        assert!(guardrails.violations().is_empty());
    }

    #[tokio::test]
    async fn whitelist_is_checked_before_rules() {
        let guardrails = Guardrails::new()
            .with_whitelist(["ask_question"])
            .with_rule(Rule::new("never_transfer", |_, a| a.r#type == "transfer").with_fallback(apology()))
            .with_default_fallback(ask());
        let v = guardrails.validate(&state(), &transfer()).await.expect("validate");
        assert_eq!(v.action.r#type, "ask_question");
        assert_eq!(v.violations[0].rule, WHITELIST_RULE);
    }

    #[tokio::test]
    async fn non_blocking_rules_only_record() {
        let guardrails = Guardrails::new()
            .with_rule(Rule::new("audit_ask", |_, a| a.r#type == "ask_question").non_blocking());
        let v = guardrails.validate(&state(), &ask()).await.expect("validate");
        assert_eq!(v.action, ask());
        assert!(!v.overridden);
        assert_eq!(v.violations.len(), 1);
        assert!(!v.violations[0].blocking);
        assert!(guardrails.is_safe(&state(), &ask()));
    }

    #[tokio::test]
    async fn stats_aggregate_recorded_violations() {
        let guardrails = Guardrails::new()
            .with_blacklist(["transfer"])
            .with_rule(Rule::new("audit_ask", |_, a| a.r#type == "ask_question").non_blocking())
            .with_default_fallback(end());

        guardrails.validate(&state(), &ask()).await.expect("ask");
        guardrails.validate(&state(), &ask()).await.expect("ask again");
        guardrails.validate(&state(), &transfer()).await.expect("transfer");
        guardrails.validate(&state(), &end()).await.expect("end");

        let stats = guardrails.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.blocking, 1);
        assert_eq!(stats.non_blocking, 2);
        assert_eq!(stats.overridden, 1);
        assert_eq!(stats.by_rule.get("audit_ask"), Some(&2));
        assert_eq!(stats.by_rule.get(BLACKLIST_RULE), Some(&1));
        assert_eq!(stats.by_action.get("transfer"), Some(&1));

        guardrails.clear_violations();
        assert_eq!(guardrails.stats(), GuardrailStats::default());
    }

    #[tokio::test]
    async fn presets_behave_as_named() {
        let guardrails = Guardrails::new()
            .with_rule(Rule::max_turns(3))
            .with_rule(Rule::no_consecutive_repeat().with_fallback(apology()))
            .with_rule(Rule::require_intent(["transfer"]).with_fallback(ask()));

        let mut late = state();
        late.turn_number = 3;
        let v = guardrails.validate(&late, &ask()).await.expect("max turns");
        assert!(v.action.is_terminal());
        assert!(guardrails.is_safe(&late, &end()));

        let repeated = state().with_turn(ConversationTurn::agent("?", "ask_question"));
        let v = guardrails.validate(&repeated, &ask()).await.expect("repeat");
        assert_eq!(v.action.r#type, "apologize");

        let v = guardrails.validate(&state(), &transfer()).await.expect("intent");
        assert_eq!(v.action.r#type, "ask_question");
        assert!(guardrails.is_safe(&state().with_intent("billing"), &transfer()));
    }

    #[test]
    fn settings_build_guardrails_from_json() {
        let settings: GuardrailSettings = serde_json::from_value(json!({
            "blacklist": ["transfer"],
            "defaultFallback": {"type": "end_call", "name": "end", "description": "Bye"},
            "maxTurns": 10,
            "noConsecutiveRepeat": true
        }))
        .expect("settings should deserialize");

        let guardrails = settings.build();
        let names: Vec<&str> = guardrails.rules().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["max_turns", "no_consecutive_repeat"]);
        assert!(!guardrails.is_safe(&state(), &transfer()));
        assert!(guardrails.is_safe(&state(), &ask()));
    }
}
