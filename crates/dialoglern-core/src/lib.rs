#![warn(clippy::unwrap_used, clippy::expect_used)]

//! Core traits and types for dialoglern.
//!
//! Defines the conversation [`ConversationState`], the [`Action`] a policy
//! chooses, the async [`Policy`] contract every learner implements, and the
//! [`Storage`] abstraction learners persist their statistics into.

pub mod action;
pub mod error;
pub mod extract;
pub mod log;
pub mod state;
pub mod storage;

pub use action::{Action, ActionSpace, END_CALL};
pub use error::{ExtractError, PolicyError, Result, StorageError, StorageResult};
pub use extract::{FeatureExtractor, FeaturePipeline, TurnStatsExtractor};
pub use state::{ConversationState, ConversationTurn, FeatureValue, Features, Sentiment, Speaker};
pub use storage::{MemoryStorage, RetryPolicy, RetryingStorage, Storage, StorageDump, StorageExt};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A scored candidate in an [`ActionAnalysis`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alternative {
    pub action_type: String,
    pub value: f64,
    pub justification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Explanation {
    pub reason: String,
    /// How much the policy trusts its choice, 0.0 to 1.0.
    pub confidence: f64,
    /// All candidates ranked by value, best first.
    pub alternatives: Vec<Alternative>,
}

/// Diagnostic view of what a policy would choose and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionAnalysis {
    pub action: Action,
    pub explanation: Explanation,
}

/// Decision policy over a conversation state.
///
/// Operations may suspend on storage I/O. Implementations hold no lock
/// across a suspension point, so concurrent `update` calls on the same arm
/// are not serialised.
#[async_trait]
pub trait Policy: Send + Sync {
    /// Short identifier used in logs and snapshots.
    fn name(&self) -> &str;

    /// Current action space; empty when none has been configured.
    fn action_space(&self) -> ActionSpace;

    async fn select_action(&self, state: &ConversationState) -> Result<Action>;

    /// Explains the choice without touching learned statistics.
    async fn analyze_action(&self, state: &ConversationState) -> Result<ActionAnalysis>;

    async fn update(&self, state: &ConversationState, action: &Action, reward: f64) -> Result<()>;

    /// Drops all learned state. Irreversible.
    async fn reset(&self) -> Result<()>;

    /// Serialises configuration and learned weights as JSON.
    async fn snapshot(&self) -> Result<Value>;

    /// Restores a snapshot produced by [`Policy::snapshot`].
    async fn load(&self, snapshot: Value) -> Result<()>;
}
