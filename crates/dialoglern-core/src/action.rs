//! Actions an agent can take and the space they are chosen from.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Action type that terminates a conversation.
pub const END_CALL: &str = "end_call";

/// A choice the agent can make. `type` is the identity key.
///
/// Actions are treated as immutable values: [`Action::with_parameters`]
/// produces a new action instead of mutating this one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    /// Identity of the action (e.g. `ask_question`, `end_call`).
    /// Raw identifier so that code and JSON name match 1:1.
    pub r#type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Action {
    pub fn new(
        action_type: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            r#type: action_type.into(),
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Returns a copy with `params` merged over the existing parameters.
    ///
    /// Type, name, description and metadata are shared with `self`.
    #[must_use]
    pub fn with_parameters<I, K>(&self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut next = self.clone();
        for (k, v) in params {
            next.parameters.insert(k.into(), v);
        }
        next
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.r#type == END_CALL
    }
}

/// Ordered set of actions keyed by their unique `type`.
///
/// Iteration order is insertion order; it is the deterministic tie-break
/// used when scoring actions.
/// Serialises as a plain JSON array. Duplicate types in the input collapse
/// the same way [`ActionSpace::add_action`] does.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "Vec<Action>", into = "Vec<Action>")]
pub struct ActionSpace {
    actions: Vec<Action>,
}

impl ActionSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an action. An action with the same `type` is replaced in place.
    pub fn add_action(&mut self, action: Action) {
        match self.actions.iter_mut().find(|a| a.r#type == action.r#type) {
            Some(slot) => *slot = action,
            None => self.actions.push(action),
        }
    }

    pub fn get_action(&self, action_type: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.r#type == action_type)
    }

    /// Snapshot of all actions in insertion order.
    pub fn get_all_actions(&self) -> Vec<Action> {
        self.actions.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter()
    }

    pub fn has_action(&self, action_type: &str) -> bool {
        self.get_action(action_type).is_some()
    }

    pub fn remove_action(&mut self, action_type: &str) -> Option<Action> {
        let idx = self.actions.iter().position(|a| a.r#type == action_type)?;
        Some(self.actions.remove(idx))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Uniformly random action, `None` when the space is empty.
    pub fn random_action<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Action> {
        self.actions.choose(rng)
    }
}

impl From<Vec<Action>> for ActionSpace {
    fn from(actions: Vec<Action>) -> Self {
        actions.into_iter().collect()
    }
}

impl From<ActionSpace> for Vec<Action> {
    fn from(space: ActionSpace) -> Self {
        space.actions
    }
}

impl FromIterator<Action> for ActionSpace {
    fn from_iter<T: IntoIterator<Item = Action>>(iter: T) -> Self {
        let mut space = ActionSpace::new();
        for action in iter {
            space.add_action(action);
        }
        space
    }
}
