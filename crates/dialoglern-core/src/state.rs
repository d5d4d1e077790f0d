//! Conversation state snapshots and the context key derived from them.
//!
//! A [`ConversationState`] is created per turn and treated as an immutable
//! snapshot. Its JSON form is the boundary contract that platform adapters
//! produce to drive the policy layer.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Resolution used when bucketing numeric features into the context key.
const NUMERIC_BUCKETS_PER_UNIT: f64 = 10.0;

/// Value of a single state feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FeatureValue {
    /// Renders the value as it appears in a context key.
    ///
    /// Numbers are floored to 0.1 so that nearby values share a context.
    fn context_fragment(&self) -> String {
        match self {
            FeatureValue::Bool(b) => b.to_string(),
            FeatureValue::Text(s) => s.clone(),
            FeatureValue::Number(n) => {
                let bucket = (n * NUMERIC_BUCKETS_PER_UNIT).floor() / NUMERIC_BUCKETS_PER_UNIT;
                // -0 and 0 are the same bucket
                let bucket = if bucket == 0.0 { 0.0 } else { bucket };
                if bucket.is_nan() {
                    "nan".to_string()
                } else if bucket.is_infinite() {
                    let sign = if bucket > 0.0 { "" } else { "-" };
                    format!("{sign}inf")
                } else {
                    bucket.to_string()
                }
            }
        }
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Bool(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Number(v)
    }
}

impl From<i64> for FeatureValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(v: i64) -> Self {
        FeatureValue::Number(v as f64)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Text(v.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Text(v)
    }
}

/// Feature map that remembers insertion order.
///
/// The order feeds the context key, so it must survive a JSON round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features {
    entries: Vec<(String, FeatureValue)>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a feature. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<FeatureValue> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FeatureValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<FeatureValue>> FromIterator<(K, V)> for Features {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut features = Features::new();
        for (k, v) in iter {
            features.insert(k, v);
        }
        features
    }
}

impl Serialize for Features {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Features {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FeaturesVisitor;

        impl<'de> Visitor<'de> for FeaturesVisitor {
            type Value = Features;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of feature names to numbers, strings or booleans")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Features, A::Error> {
                let mut features = Features::new();
                while let Some((k, v)) = access.next_entry::<String, FeatureValue>()? {
                    features.insert(k, v);
                }
                Ok(features)
            }
        }

        deserializer.deserialize_map(FeaturesVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// One utterance in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<Sentiment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Type of the action the agent took in this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl ConversationTurn {
    pub fn agent(text: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Agent,
            text: text.into(),
            timestamp: OffsetDateTime::now_utc(),
            sentiment: None,
            intent: None,
            action: Some(action_type.into()),
            state: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            timestamp: OffsetDateTime::now_utc(),
            sentiment: None,
            intent: None,
            action: None,
            state: None,
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
}

/// Snapshot of a conversation at one turn.
///
/// `history` is chronological; `turn_number` counts completed exchanges and
/// is not the raw history length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    #[serde(default)]
    pub turn_number: u32,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub features: Features,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_number: 0,
            history: Vec::new(),
            features: Features::new(),
            intent: None,
            user_info: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    #[must_use]
    pub fn with_feature(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.features.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_turn(mut self, turn: ConversationTurn) -> Self {
        self.history.push(turn);
        self
    }

    /// Deterministic key summarising intent and bucketed features.
    ///
    /// History does not participate, so states that differ only in what was
    /// said share learned statistics.
    pub fn context_key(&self) -> String {
        let mut parts = Vec::with_capacity(self.features.len() + 1);
        if let Some(intent) = &self.intent {
            parts.push(format!("intent:{intent}"));
        }
        for (name, value) in self.features.iter() {
            parts.push(format!("{name}:{}", value.context_fragment()));
        }
        parts.join("|")
    }

    /// Action types of the last `window` agent turns, oldest first.
    pub fn recent_agent_actions(&self, window: usize) -> Vec<&str> {
        let mut recent: Vec<&str> = self
            .history
            .iter()
            .rev()
            .filter(|t| t.speaker == Speaker::Agent)
            .take(window)
            .filter_map(|t| t.action.as_deref())
            .collect();
        recent.reverse();
        recent
    }

    /// Most recent agent action type, if any.
    pub fn last_agent_action(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|t| t.speaker == Speaker::Agent)
            .and_then(|t| t.action.as_deref())
    }
}
